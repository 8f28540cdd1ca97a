//! # Connection Errors

use thiserror::Error;

use crate::transport::TransportError;

/// Result type for connection operations
pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Connection errors
///
/// Transient transport failures are retried internally and never show up
/// here; only the terminal and caller-misuse cases do.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// Operation needs a confirmed subscription
    #[error("Channel not connected")]
    NotConnected,

    /// Reconnect gave up after this many consecutive failures
    #[error("Live updates unavailable: gave up after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    /// Session already cleaned up
    #[error("Channel closed")]
    Closed,

    /// Synchronous transport failure on an outbound call
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ConnectionError {
    /// Whether the application should surface this to the user
    pub fn is_user_visible(&self) -> bool {
        matches!(self, ConnectionError::RetriesExhausted { .. })
    }
}
