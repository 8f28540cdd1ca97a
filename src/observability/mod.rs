//! Observability for the delivery layer
//!
//! - Structured JSON logging
//! - Typed lifecycle events
//! - Diagnostic counters
//!
//! Observability is read-only: nothing here feeds back into delivery
//! decisions, and a failing log write never fails the caller.
//!
//! ```ignore
//! use aerolive::observability::{log_event_with_fields, Event, MetricsRegistry};
//!
//! log_event_with_fields(Event::ChannelConnected, &[("topic", "room:42")]);
//!
//! let metrics = MetricsRegistry::new();
//! metrics.increment_duplicates();
//! ```

mod events;
mod logger;
mod metrics;

pub use events::Event;
pub use logger::{Logger, Severity};
pub use metrics::{MetricsRegistry, MetricsSnapshot};

/// Log a lifecycle event at its default severity
pub fn log_event(event: Event) {
    Logger::log(event.severity(), event.as_str(), &[]);
}

/// Log a lifecycle event with fields at its default severity
pub fn log_event_with_fields(event: Event, fields: &[(&str, &str)]) {
    Logger::log(event.severity(), event.as_str(), fields);
}

/// Log a lifecycle event with fields at an explicit severity
pub fn log_event_at(severity: Severity, event: Event, fields: &[(&str, &str)]) {
    Logger::log(severity, event.as_str(), fields);
}
