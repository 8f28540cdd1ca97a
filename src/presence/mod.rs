//! # Presence
//!
//! Who is online on a topic. The local record is published on every
//! (re)connect and on explicit status changes; remote syncs are throttled
//! before reaching the application, and records not refreshed within the
//! staleness window read as offline.

mod observer;
mod record;

pub use observer::{PresenceCallback, PresenceMap, PresenceObserver, PresenceOptions};
pub use record::{PresenceRecord, PresenceStatus};
