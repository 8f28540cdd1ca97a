//! Exponential backoff with jitter
//!
//! `delay(n) = min(initial * multiplier^n, max) + jitter`, jitter drawn
//! uniformly from `[-ratio, +ratio]` of the capped delay.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Reconnect policy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before the first retry
    pub initial_delay_ms: u64,
    /// Growth factor per attempt
    pub multiplier: f64,
    /// Cap on the computed delay (before jitter)
    pub max_delay_ms: u64,
    /// Consecutive failures tolerated before giving up
    pub max_retries: u32,
    /// Jitter spread as a fraction of the capped delay
    pub jitter_ratio: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            max_retries: 10,
            jitter_ratio: 0.25,
        }
    }
}

impl BackoffConfig {
    /// Capped delay for `attempt` (0-based), without jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let raw = self.initial_delay_ms as f64 * self.multiplier.powi(exponent);
        let capped = if raw.is_finite() {
            raw.min(self.max_delay_ms as f64)
        } else {
            self.max_delay_ms as f64
        };
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Jittered delay for `attempt`
    pub fn delay<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt).as_millis() as f64;
        let ratio = self.jitter_ratio.clamp(0.0, 1.0);
        let jitter = if ratio > 0.0 {
            rng.gen_range(-ratio..=ratio) * base
        } else {
            0.0
        };
        Duration::from_millis((base + jitter).max(0.0).round() as u64)
    }

    /// Bounds of the jittered delay for `attempt`
    pub fn delay_bounds(&self, attempt: u32) -> (Duration, Duration) {
        let base = self.base_delay(attempt).as_millis() as f64;
        let ratio = self.jitter_ratio.clamp(0.0, 1.0);
        (
            Duration::from_millis((base * (1.0 - ratio)).floor() as u64),
            Duration::from_millis((base * (1.0 + ratio)).ceil() as u64),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_base_delay_grows_then_caps() {
        let config = BackoffConfig::default();
        assert_eq!(config.base_delay(0), Duration::from_millis(1_000));
        assert_eq!(config.base_delay(1), Duration::from_millis(2_000));
        assert_eq!(config.base_delay(4), Duration::from_millis(16_000));
        assert_eq!(config.base_delay(5), Duration::from_millis(30_000));
        assert_eq!(config.base_delay(500), Duration::from_millis(30_000));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let config = BackoffConfig::default();
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 0..12 {
            let (low, high) = config.delay_bounds(attempt);
            for _ in 0..50 {
                let delay = config.delay(attempt, &mut rng);
                assert!(delay >= low && delay <= high, "attempt {attempt}: {delay:?}");
            }
        }
    }

    #[test]
    fn test_zero_jitter_is_exact() {
        let config = BackoffConfig {
            jitter_ratio: 0.0,
            ..BackoffConfig::default()
        };
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(config.delay(2, &mut rng), Duration::from_millis(4_000));
    }
}
