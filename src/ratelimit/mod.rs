//! # Sliding-Window Rate Limiter
//!
//! Per-key `(topic, action)` admission control for ephemeral events.
//!
//! Rejection is backpressure, not a fault: callers simply drop the event.
//! Every rejection is counted in `MetricsRegistry::rate_limit_rejections`
//! and logged as `RATE_LIMITED`.

pub mod config;
pub mod registry;
pub mod window;

pub use config::{
    default_presets, RateLimitConfig, ACTION_BROADCAST, ACTION_BULK, ACTION_MESSAGE,
    ACTION_PRESENCE, ACTION_TYPING,
};
pub use registry::{RateLimitKey, RateLimiterRegistry};
pub use window::{Admission, RateLimitWindow};
