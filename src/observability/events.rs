//! Observable events of the delivery layer
//!
//! Events are explicit and typed; each carries the severity it is logged at.

use std::fmt;

use super::logger::Severity;

/// Observable events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Configuration
    /// Configuration loaded and validated
    ConfigLoaded,

    // Channel lifecycle
    /// Transport subscription requested
    ChannelSubscribe,
    /// Transport confirmed the subscription
    ChannelConnected,
    /// Transport reported a channel error
    ChannelError,
    /// Transport reported a subscribe timeout
    ChannelTimedOut,
    /// Transport closed the subscription unexpectedly
    ChannelClosed,
    /// Channel paused (host offline)
    ChannelPaused,
    /// Channel resumed
    ChannelResumed,
    /// Channel torn down by its owner
    ChannelCleanup,
    /// Reconnect scheduled with backoff
    ReconnectScheduled,
    /// Retries exhausted, terminal error reported
    RetriesExhausted,
    /// Heartbeat broadcast failed
    HeartbeatFailed,
    /// Older session for the same topic replaced
    ChannelReplaced,

    // Rate limiting
    /// Admission rejected
    RateLimited,
    /// Idle windows garbage-collected
    RateLimitSwept,

    // Delivery
    /// Hydrated entity handed to the application
    Delivered,
    /// Notification for an already delivered entity
    DuplicateDropped,
    /// Entity vanished between notification and fetch
    EntityNotFound,
    /// Fetch by id failed
    FetchFailed,
    /// Fetch by id keeps failing
    FetchFailuresPersistent,
    /// Notification ignored because it carries no entity id
    NotificationMalformed,

    // Typing / presence
    /// Remote typing entry expired without renewal
    TypingExpired,
    /// Local presence could not be tracked
    PresenceTrackFailed,

    // Reconciliation
    /// Unread counts refreshed
    UnreadRefreshed,
    /// Unread refresh failed
    UnreadRefreshFailed,
}

impl Event {
    /// Returns the event name used in log lines
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::ConfigLoaded => "CONFIG_LOADED",
            Event::ChannelSubscribe => "CHANNEL_SUBSCRIBE",
            Event::ChannelConnected => "CHANNEL_CONNECTED",
            Event::ChannelError => "CHANNEL_ERROR",
            Event::ChannelTimedOut => "CHANNEL_TIMED_OUT",
            Event::ChannelClosed => "CHANNEL_CLOSED",
            Event::ChannelPaused => "CHANNEL_PAUSED",
            Event::ChannelResumed => "CHANNEL_RESUMED",
            Event::ChannelCleanup => "CHANNEL_CLEANUP",
            Event::ReconnectScheduled => "RECONNECT_SCHEDULED",
            Event::RetriesExhausted => "RETRIES_EXHAUSTED",
            Event::HeartbeatFailed => "HEARTBEAT_FAILED",
            Event::ChannelReplaced => "CHANNEL_REPLACED",
            Event::RateLimited => "RATE_LIMITED",
            Event::RateLimitSwept => "RATE_LIMIT_SWEPT",
            Event::Delivered => "DELIVERED",
            Event::DuplicateDropped => "DUPLICATE_DROPPED",
            Event::EntityNotFound => "ENTITY_NOT_FOUND",
            Event::FetchFailed => "FETCH_FAILED",
            Event::FetchFailuresPersistent => "FETCH_FAILURES_PERSISTENT",
            Event::NotificationMalformed => "NOTIFICATION_MALFORMED",
            Event::TypingExpired => "TYPING_EXPIRED",
            Event::PresenceTrackFailed => "PRESENCE_TRACK_FAILED",
            Event::UnreadRefreshed => "UNREAD_REFRESHED",
            Event::UnreadRefreshFailed => "UNREAD_REFRESH_FAILED",
        }
    }

    /// Severity the event is logged at
    pub fn severity(&self) -> Severity {
        match self {
            Event::Delivered
            | Event::DuplicateDropped
            | Event::RateLimited
            | Event::RateLimitSwept
            | Event::TypingExpired
            | Event::UnreadRefreshed => Severity::Trace,

            Event::ChannelError
            | Event::ChannelTimedOut
            | Event::ChannelClosed
            | Event::HeartbeatFailed
            | Event::FetchFailed
            | Event::NotificationMalformed
            | Event::PresenceTrackFailed
            | Event::UnreadRefreshFailed => Severity::Warn,

            Event::RetriesExhausted | Event::FetchFailuresPersistent => Severity::Error,

            _ => Severity::Info,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
