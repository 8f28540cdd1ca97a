//! Shared registry of rate-limit windows
//!
//! One registry is owned by the client and passed by `Arc` to every caller.
//! Windows are created lazily on the first admission check for a key and
//! garbage-collected by `sweep`.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::config::{default_presets, RateLimitConfig, ACTION_BROADCAST};
use super::window::{Admission, RateLimitWindow};
use crate::observability::{log_event_with_fields, Event, MetricsRegistry};

/// `(topic, action)` key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    pub topic: String,
    pub action: String,
}

impl RateLimitKey {
    pub fn new(topic: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            action: action.into(),
        }
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.topic, self.action)
    }
}

/// Registry of sliding windows keyed by `(topic, action)`
#[derive(Debug)]
pub struct RateLimiterRegistry {
    /// Per-action limits; unknown actions use the `broadcast` preset
    presets: HashMap<String, RateLimitConfig>,
    /// Absolute idle eviction; `None` keeps the empty-window rule only
    max_idle: Option<Duration>,
    windows: Mutex<HashMap<RateLimitKey, RateLimitWindow>>,
    metrics: Arc<MetricsRegistry>,
}

impl Default for RateLimiterRegistry {
    fn default() -> Self {
        Self::new(default_presets(), None, Arc::new(MetricsRegistry::new()))
    }
}

impl RateLimiterRegistry {
    pub fn new(
        presets: HashMap<String, RateLimitConfig>,
        max_idle: Option<Duration>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            presets,
            max_idle,
            windows: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    fn windows(&self) -> MutexGuard<'_, HashMap<RateLimitKey, RateLimitWindow>> {
        // Windows are pure bookkeeping; a panic elsewhere never corrupts them.
        self.windows.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Limit applied to `action`
    pub fn config_for(&self, action: &str) -> RateLimitConfig {
        self.presets
            .get(action)
            .or_else(|| self.presets.get(ACTION_BROADCAST))
            .copied()
            .unwrap_or_default()
    }

    /// Admission check; rejections are counted and logged, never raised
    pub fn admit(&self, topic: &str, action: &str) -> bool {
        self.check(&RateLimitKey::new(topic, action), Instant::now())
            .is_admitted()
    }

    /// Admission check at an explicit instant
    pub fn check(&self, key: &RateLimitKey, now: Instant) -> Admission {
        let config = self.config_for(&key.action);
        let admission = {
            let mut windows = self.windows();
            windows
                .entry(key.clone())
                .or_insert_with(|| RateLimitWindow::new(config, now))
                .admit(now)
        };

        if !admission.is_admitted() {
            self.metrics.increment_rate_limit_rejections();
            let key_str = key.to_string();
            let reason = match admission {
                Admission::LimitReached => "limit_reached",
                _ => "blocked",
            };
            log_event_with_fields(Event::RateLimited, &[("key", &key_str), ("reason", reason)]);
        }

        admission
    }

    /// Remaining capacity for a key; a key never seen has full capacity
    pub fn remaining(&self, key: &RateLimitKey) -> usize {
        let now = Instant::now();
        match self.windows().get_mut(key) {
            Some(window) => window.remaining(now),
            None => self.config_for(&key.action).max_events,
        }
    }

    /// Remove windows with full remaining capacity, and windows with no
    /// admission attempt for longer than `max_idle`. Returns keys removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let max_idle = self.max_idle;
        let removed = {
            let mut windows = self.windows();
            let before = windows.len();
            windows.retain(|_, window| {
                let idle_too_long = max_idle
                    .map(|limit| now.saturating_duration_since(window.last_attempt()) > limit)
                    .unwrap_or(false);
                !(idle_too_long || window.is_idle(now))
            });
            before - windows.len()
        };

        if removed > 0 {
            self.metrics.add_rate_limit_keys_swept(removed as u64);
            let removed_str = removed.to_string();
            log_event_with_fields(Event::RateLimitSwept, &[("removed", &removed_str)]);
        }
        removed
    }

    /// Number of live windows
    pub fn len(&self) -> usize {
        self.windows().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `sweep` every `period` until the handle is aborted
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                registry.sweep(Instant::now());
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::config::{ACTION_BULK, ACTION_TYPING};

    fn registry() -> RateLimiterRegistry {
        RateLimiterRegistry::default()
    }

    #[test]
    fn test_keys_are_independent() {
        let registry = registry();
        let now = Instant::now();
        let room_a = RateLimitKey::new("room:a", ACTION_TYPING);
        let room_b = RateLimitKey::new("room:b", ACTION_TYPING);

        for _ in 0..5 {
            assert!(registry.check(&room_a, now).is_admitted());
        }
        assert!(!registry.check(&room_a, now).is_admitted());
        assert!(registry.check(&room_b, now).is_admitted());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_unknown_action_uses_broadcast_preset() {
        let registry = registry();
        assert_eq!(registry.config_for("custom"), RateLimitConfig::broadcast());
        assert_eq!(registry.config_for(ACTION_BULK), RateLimitConfig::bulk());
    }

    #[test]
    fn test_rejections_are_counted() {
        let metrics = Arc::new(MetricsRegistry::new());
        let registry = RateLimiterRegistry::new(default_presets(), None, Arc::clone(&metrics));
        let key = RateLimitKey::new("t", ACTION_BULK);
        let now = Instant::now();

        registry.check(&key, now);
        registry.check(&key, now);
        registry.check(&key, now);
        registry.check(&key, now);

        assert_eq!(metrics.snapshot().rate_limit_rejections, 2);
    }

    #[test]
    fn test_sweep_removes_only_empty_windows() {
        let registry = registry();
        let start = Instant::now();
        let quiet = RateLimitKey::new("quiet", ACTION_TYPING);
        let busy = RateLimitKey::new("busy", ACTION_BULK);

        registry.check(&quiet, start);
        registry.check(&busy, start);

        // Typing window (1s) has drained, bulk window (60s) has not
        let later = start + Duration::from_secs(2);
        assert_eq!(registry.sweep(later), 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.remaining(&busy), 1);
    }

    #[test]
    fn test_sweep_absolute_idle_eviction() {
        let registry = RateLimiterRegistry::new(
            default_presets(),
            Some(Duration::from_secs(30)),
            Arc::new(MetricsRegistry::new()),
        );
        let start = Instant::now();
        let key = RateLimitKey::new("t", ACTION_BULK);
        registry.check(&key, start);

        assert_eq!(registry.sweep(start + Duration::from_secs(10)), 0);
        assert_eq!(registry.sweep(start + Duration::from_secs(31)), 1);
        assert!(registry.is_empty());
    }
}
