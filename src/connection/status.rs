//! Connection status

use std::fmt;

/// Status of one channel session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    /// No transport subscription
    Disconnected,
    /// Subscribe requested, waiting for confirmation
    Connecting,
    /// Subscription confirmed
    Connected,
    /// Torn down on request (host offline); resumable
    Paused,
    /// Transport failure; terminal once retries are exhausted
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Paused => "paused",
            ConnectionStatus::Error => "error",
        }
    }

    /// Statuses after which a later `Connected` counts as a reconnect
    pub fn is_down(&self) -> bool {
        matches!(
            self,
            ConnectionStatus::Disconnected | ConnectionStatus::Error | ConnectionStatus::Paused
        )
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
