//! Configuration for the delivery layer
//!
//! Loaded from a JSON file; every field is optional and defaults to the
//! values below. `load` validates before returning.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::connection::{BackoffConfig, ConnectionOptions};
use crate::observability::{log_event_with_fields, Event, Severity};
use crate::presence::PresenceOptions;
use crate::ratelimit::{default_presets, RateLimitConfig};
use crate::reconcile::UnreadOptions;

/// Result type for configuration
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

/// Delivery layer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveConfig {
    /// Minimum log severity: trace, info, warn, error, fatal
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Reconnect policy
    #[serde(default)]
    pub backoff: BackoffConfig,

    /// Liveness broadcast interval while connected
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Entity ids remembered per session for deduplication
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,

    /// Consecutive fetch failures before the log escalates to error
    #[serde(default = "default_fetch_failure_alert_threshold")]
    pub fetch_failure_alert_threshold: u32,

    /// Remote typing expiry and local auto-stop
    #[serde(default = "default_typing_timeout_ms")]
    pub typing_timeout_ms: u64,

    /// Unread reconciliation interval
    #[serde(default = "default_unread_poll_interval_ms")]
    pub unread_poll_interval_ms: u64,

    /// Quiet period before a push-triggered unread refresh
    #[serde(default = "default_unread_push_debounce_ms")]
    pub unread_push_debounce_ms: u64,

    /// Longest a push-triggered refresh may be deferred
    #[serde(default = "default_unread_push_max_wait_ms")]
    pub unread_push_max_wait_ms: u64,

    /// Coalescing interval for presence syncs
    #[serde(default = "default_presence_throttle_ms")]
    pub presence_throttle_ms: u64,

    /// Presence records older than this read as offline
    #[serde(default = "default_presence_stale_after_ms")]
    pub presence_stale_after_ms: u64,

    /// How often idle rate-limit windows are collected
    #[serde(default = "default_rate_limit_sweep_interval_ms")]
    pub rate_limit_sweep_interval_ms: u64,

    /// Windows with no admission attempt for this long are collected
    #[serde(default = "default_rate_limit_max_idle_ms")]
    pub rate_limit_max_idle_ms: u64,

    /// Per-action overrides on top of the built-in presets
    #[serde(default)]
    pub rate_limits: HashMap<String, RateLimitConfig>,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_heartbeat_interval_ms() -> u64 {
    30_000
}
fn default_dedup_capacity() -> usize {
    100
}
fn default_fetch_failure_alert_threshold() -> u32 {
    3
}
fn default_typing_timeout_ms() -> u64 {
    3_000
}
fn default_unread_poll_interval_ms() -> u64 {
    30_000
}
fn default_unread_push_debounce_ms() -> u64 {
    250
}
fn default_unread_push_max_wait_ms() -> u64 {
    1_000
}
fn default_presence_throttle_ms() -> u64 {
    500
}
fn default_presence_stale_after_ms() -> u64 {
    60_000
}
fn default_rate_limit_sweep_interval_ms() -> u64 {
    60_000
}
fn default_rate_limit_max_idle_ms() -> u64 {
    300_000
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            backoff: BackoffConfig::default(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            dedup_capacity: default_dedup_capacity(),
            fetch_failure_alert_threshold: default_fetch_failure_alert_threshold(),
            typing_timeout_ms: default_typing_timeout_ms(),
            unread_poll_interval_ms: default_unread_poll_interval_ms(),
            unread_push_debounce_ms: default_unread_push_debounce_ms(),
            unread_push_max_wait_ms: default_unread_push_max_wait_ms(),
            presence_throttle_ms: default_presence_throttle_ms(),
            presence_stale_after_ms: default_presence_stale_after_ms(),
            rate_limit_sweep_interval_ms: default_rate_limit_sweep_interval_ms(),
            rate_limit_max_idle_ms: default_rate_limit_max_idle_ms(),
            rate_limits: HashMap::new(),
        }
    }
}

impl LiveConfig {
    /// Load and validate configuration from file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        let config: LiveConfig = serde_json::from_str(&content)?;
        config.validate()?;

        let path_str = path.display().to_string();
        log_event_with_fields(Event::ConfigLoaded, &[("path", &path_str)]);
        Ok(config)
    }

    /// Reject values the delivery layer cannot run with
    pub fn validate(&self) -> ConfigResult<()> {
        self.severity()?;

        let backoff = &self.backoff;
        if backoff.initial_delay_ms == 0 {
            return Err(invalid("backoff.initial_delay_ms must be > 0"));
        }
        if !backoff.multiplier.is_finite() || backoff.multiplier < 1.0 {
            return Err(invalid(format!(
                "backoff.multiplier must be >= 1.0, got {}",
                backoff.multiplier
            )));
        }
        if backoff.max_delay_ms < backoff.initial_delay_ms {
            return Err(invalid("backoff.max_delay_ms must be >= backoff.initial_delay_ms"));
        }
        if !(0.0..1.0).contains(&backoff.jitter_ratio) {
            return Err(invalid(format!(
                "backoff.jitter_ratio must be in [0, 1), got {}",
                backoff.jitter_ratio
            )));
        }

        let intervals = [
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("typing_timeout_ms", self.typing_timeout_ms),
            ("unread_poll_interval_ms", self.unread_poll_interval_ms),
            ("unread_push_debounce_ms", self.unread_push_debounce_ms),
            ("unread_push_max_wait_ms", self.unread_push_max_wait_ms),
            ("presence_throttle_ms", self.presence_throttle_ms),
            ("presence_stale_after_ms", self.presence_stale_after_ms),
            ("rate_limit_sweep_interval_ms", self.rate_limit_sweep_interval_ms),
            ("rate_limit_max_idle_ms", self.rate_limit_max_idle_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(invalid(format!("{} must be > 0", name)));
            }
        }
        if self.unread_push_max_wait_ms < self.unread_push_debounce_ms {
            return Err(invalid(
                "unread_push_max_wait_ms must be >= unread_push_debounce_ms",
            ));
        }

        if self.dedup_capacity == 0 {
            return Err(invalid("dedup_capacity must be > 0"));
        }
        if self.fetch_failure_alert_threshold == 0 {
            return Err(invalid("fetch_failure_alert_threshold must be > 0"));
        }

        for (action, limit) in &self.rate_limits {
            if limit.max_events == 0 || limit.window_ms == 0 {
                return Err(invalid(format!(
                    "rate_limits.{}: max_events and window_ms must be > 0",
                    action
                )));
            }
        }

        Ok(())
    }

    /// Configured minimum log severity
    pub fn severity(&self) -> ConfigResult<Severity> {
        self.log_level
            .parse()
            .map_err(|_| invalid(format!("Invalid log_level: '{}'", self.log_level)))
    }

    /// Built-in presets with configured overrides applied
    pub fn rate_limit_presets(&self) -> HashMap<String, RateLimitConfig> {
        let mut presets = default_presets();
        presets.extend(self.rate_limits.iter().map(|(k, v)| (k.clone(), *v)));
        presets
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            backoff: self.backoff,
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
        }
    }

    pub fn presence_options(&self) -> PresenceOptions {
        PresenceOptions {
            throttle: Duration::from_millis(self.presence_throttle_ms),
            stale_after: Duration::from_millis(self.presence_stale_after_ms),
        }
    }

    pub fn unread_options(&self) -> UnreadOptions {
        UnreadOptions {
            poll_interval: Duration::from_millis(self.unread_poll_interval_ms),
            push_debounce: Duration::from_millis(self.unread_push_debounce_ms),
            push_max_wait: Duration::from_millis(self.unread_push_max_wait_ms),
        }
    }

    pub fn typing_timeout(&self) -> Duration {
        Duration::from_millis(self.typing_timeout_ms)
    }

    pub fn rate_limit_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.rate_limit_sweep_interval_ms)
    }

    pub fn rate_limit_max_idle(&self) -> Duration {
        Duration::from_millis(self.rate_limit_max_idle_ms)
    }
}
