//! Rate limit presets
//!
//! Limits differ by event class. Low-value ephemeral signals get tight
//! windows, expensive bulk operations get a long post-limit block.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Action name for outbound/inbound typing signals
pub const ACTION_TYPING: &str = "typing";
/// Action name for generic broadcasts
pub const ACTION_BROADCAST: &str = "broadcast";
/// Action name for chat message broadcasts
pub const ACTION_MESSAGE: &str = "message";
/// Action name for presence tracking
pub const ACTION_PRESENCE: &str = "presence";
/// Action name for expensive bulk operations
pub const ACTION_BULK: &str = "bulk";

/// Sliding-window limit for one `(topic, action)` key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum admitted events inside one window
    pub max_events: usize,
    /// Window length in milliseconds
    pub window_ms: u64,
    /// How long the key stays blocked once the limit is hit
    pub block_duration_ms: u64,
}

impl RateLimitConfig {
    pub const fn new(max_events: usize, window_ms: u64, block_duration_ms: u64) -> Self {
        Self {
            max_events,
            window_ms,
            block_duration_ms,
        }
    }

    /// Typing indicators: 5 per second
    pub const fn typing() -> Self {
        Self::new(5, 1_000, 1_000)
    }

    /// Generic broadcasts: 10 per second
    pub const fn broadcast() -> Self {
        Self::new(10, 1_000, 1_000)
    }

    /// Chat messages: 20 per second
    pub const fn message() -> Self {
        Self::new(20, 1_000, 1_000)
    }

    /// Presence updates: 3 per second
    pub const fn presence() -> Self {
        Self::new(3, 1_000, 2_000)
    }

    /// Bulk operations: 2 per minute, blocked for five minutes after
    pub const fn bulk() -> Self {
        Self::new(2, 60_000, 300_000)
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn block_duration(&self) -> Duration {
        Duration::from_millis(self.block_duration_ms)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::broadcast()
    }
}

/// Built-in presets keyed by action name
pub fn default_presets() -> HashMap<String, RateLimitConfig> {
    [
        (ACTION_TYPING, RateLimitConfig::typing()),
        (ACTION_BROADCAST, RateLimitConfig::broadcast()),
        (ACTION_MESSAGE, RateLimitConfig::message()),
        (ACTION_PRESENCE, RateLimitConfig::presence()),
        (ACTION_BULK, RateLimitConfig::bulk()),
    ]
    .into_iter()
    .map(|(action, config)| (action.to_string(), config))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        let presets = default_presets();
        assert_eq!(presets[ACTION_TYPING].max_events, 5);
        assert_eq!(presets[ACTION_PRESENCE].max_events, 3);
        assert_eq!(presets[ACTION_BULK].window(), Duration::from_secs(60));
        assert!(presets[ACTION_BULK].block_duration() > presets[ACTION_BULK].window());
    }

    #[test]
    fn test_deserialize() {
        let config: RateLimitConfig =
            serde_json::from_str(r#"{"max_events":7,"window_ms":500,"block_duration_ms":250}"#)
                .unwrap();
        assert_eq!(config, RateLimitConfig::new(7, 500, 250));
    }
}
