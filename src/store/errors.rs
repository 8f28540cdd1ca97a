//! # Data-Access Errors

use thiserror::Error;

/// Result type for data-access calls
pub type FetchResult<T> = Result<T, FetchError>;

/// Failures of the data-access collaborator.
///
/// "Not found" is not an error: fetches return `Ok(None)` for it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// Network or backend unavailable
    #[error("Data source unavailable: {0}")]
    Unavailable(String),

    /// Request timed out
    #[error("Fetch timed out")]
    Timeout,

    /// Caller not allowed to read the entity
    #[error("Not authorized to read {0}")]
    Unauthorized(String),

    /// Payload could not be decoded
    #[error("Malformed payload: {0}")]
    Malformed(String),
}
