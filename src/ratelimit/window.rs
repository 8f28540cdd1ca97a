//! Sliding window for a single rate-limit key

use std::collections::VecDeque;

use tokio::time::Instant;

use super::config::RateLimitConfig;

/// Result of an admission attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Event admitted and recorded
    Admitted,
    /// Key is still inside its block period
    Blocked,
    /// This attempt hit the limit and started a block period
    LimitReached,
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }
}

/// Time-ordered admitted events for one `(topic, action)` key.
///
/// `events.len() <= max_events` holds because admission refuses the event
/// that would exceed it; nothing is truncated after the fact.
#[derive(Debug, Clone)]
pub struct RateLimitWindow {
    config: RateLimitConfig,
    events: VecDeque<Instant>,
    blocked_until: Option<Instant>,
    last_attempt: Instant,
}

impl RateLimitWindow {
    pub fn new(config: RateLimitConfig, now: Instant) -> Self {
        Self {
            config,
            events: VecDeque::with_capacity(config.max_events),
            blocked_until: None,
            last_attempt: now,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Try to admit one event at `now`
    pub fn admit(&mut self, now: Instant) -> Admission {
        self.last_attempt = now;
        self.expire(now);

        if let Some(until) = self.blocked_until {
            if now < until {
                return Admission::Blocked;
            }
            self.blocked_until = None;
        }

        if self.events.len() >= self.config.max_events {
            self.blocked_until = Some(now + self.config.block_duration());
            return Admission::LimitReached;
        }

        self.events.push_back(now);
        Admission::Admitted
    }

    /// Drop timestamps older than the window
    fn expire(&mut self, now: Instant) {
        let window = self.config.window();
        while let Some(&oldest) = self.events.front() {
            if now.saturating_duration_since(oldest) >= window {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }

    /// Events still admissible right now
    pub fn remaining(&mut self, now: Instant) -> usize {
        self.expire(now);
        self.config.max_events.saturating_sub(self.events.len())
    }

    pub fn is_blocked(&self, now: Instant) -> bool {
        self.blocked_until.map(|until| now < until).unwrap_or(false)
    }

    /// Window is empty and not blocked: full capacity available
    pub fn is_idle(&mut self, now: Instant) -> bool {
        !self.is_blocked(now) && self.remaining(now) == self.config.max_events
    }

    pub fn last_attempt(&self) -> Instant {
        self.last_attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_admits_up_to_max() {
        let now = Instant::now();
        let mut window = RateLimitWindow::new(RateLimitConfig::new(3, 1_000, 500), now);

        assert_eq!(window.admit(now), Admission::Admitted);
        assert_eq!(window.admit(now), Admission::Admitted);
        assert_eq!(window.admit(now), Admission::Admitted);
        assert_eq!(window.admit(now), Admission::LimitReached);
        assert_eq!(window.remaining(now), 0);
    }

    #[test]
    fn test_block_outlives_window() {
        let start = Instant::now();
        let mut window = RateLimitWindow::new(RateLimitConfig::new(1, 100, 1_000), start);

        assert!(window.admit(start).is_admitted());
        assert_eq!(window.admit(start), Admission::LimitReached);

        // Window has rolled over but the block is still active
        let later = start + Duration::from_millis(200);
        assert_eq!(window.admit(later), Admission::Blocked);

        let after_block = start + Duration::from_millis(1_001);
        assert_eq!(window.admit(after_block), Admission::Admitted);
    }

    #[test]
    fn test_idle_detection() {
        let start = Instant::now();
        let mut window = RateLimitWindow::new(RateLimitConfig::new(2, 100, 100), start);
        assert!(window.is_idle(start));

        window.admit(start);
        assert!(!window.is_idle(start));
        assert!(window.is_idle(start + Duration::from_millis(100)));
    }
}
