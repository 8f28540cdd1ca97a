//! # Connection Supervision
//!
//! One `ConnectionManager` per logical subscription. It drives the status
//! machine
//!
//! ```text
//! Disconnected -> Connecting -> Connected
//!                     |             |
//!                     v             v
//!                   Error <----- Disconnected (server close)
//!                     |
//!                     +--> Connecting (after backoff) ... or terminal Error
//! ```
//!
//! plus `Paused`, entered on request from any status and left by `resume`.

mod backoff;
mod errors;
mod manager;
mod status;

pub use backoff::BackoffConfig;
pub use errors::{ConnectionError, ConnectionResult};
pub use manager::{
    ChannelEvent, ConnectionControl, ConnectionManager, ConnectionOptions, FailureCallback,
    ObserverId, StatusCallback, HEARTBEAT_EVENT,
};
pub use status::ConnectionStatus;
