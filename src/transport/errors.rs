//! # Transport Errors

use thiserror::Error;

/// Result type for transport calls
pub type TransportResult<T> = Result<T, TransportError>;

/// Failures reported synchronously by the transport collaborator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The underlying socket is not connected
    #[error("Transport not connected")]
    NotConnected,

    /// Handle does not refer to a live subscription
    #[error("Unknown subscription handle: {0}")]
    UnknownHandle(u64),

    /// Topic rejected by the transport
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    /// Outbound payload rejected
    #[error("Send rejected: {0}")]
    SendRejected(String),

    /// Anything else the transport reports
    #[error("Transport error: {0}")]
    Other(String),
}
