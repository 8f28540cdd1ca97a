//! # Reconciliation
//!
//! Re-derives application-visible state on a timer, independent of push
//! delivery, so a silent channel failure costs at most one interval of
//! staleness.

mod unread;

pub use unread::{RefreshReason, UnreadCallback, UnreadOptions, UnreadReconciler};
