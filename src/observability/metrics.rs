//! Diagnostic counters
//!
//! - Counters only, monotonic
//! - Shared by `Arc` between every component of one client
//! - Relaxed ordering; counters are diagnostics, not synchronisation

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Operational counters for the delivery layer
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    rate_limit_rejections: AtomicU64,
    rate_limit_keys_swept: AtomicU64,
    notifications_received: AtomicU64,
    duplicates_dropped: AtomicU64,
    deliveries: AtomicU64,
    fetch_failures: AtomicU64,
    fetch_not_found: AtomicU64,
    connect_attempts: AtomicU64,
    reconnects_scheduled: AtomicU64,
    retries_exhausted: AtomicU64,
    heartbeats_sent: AtomicU64,
    typing_expirations: AtomicU64,
    unread_refreshes: AtomicU64,
    unread_refresh_failures: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl MetricsRegistry {
    /// Create a registry with all counters at zero
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_rate_limit_rejections(&self) {
        bump(&self.rate_limit_rejections);
    }

    pub fn add_rate_limit_keys_swept(&self, count: u64) {
        self.rate_limit_keys_swept.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_notifications(&self) {
        bump(&self.notifications_received);
    }

    pub fn increment_duplicates(&self) {
        bump(&self.duplicates_dropped);
    }

    pub fn increment_deliveries(&self) {
        bump(&self.deliveries);
    }

    pub fn increment_fetch_failures(&self) {
        bump(&self.fetch_failures);
    }

    pub fn increment_fetch_not_found(&self) {
        bump(&self.fetch_not_found);
    }

    pub fn increment_connect_attempts(&self) {
        bump(&self.connect_attempts);
    }

    pub fn increment_reconnects_scheduled(&self) {
        bump(&self.reconnects_scheduled);
    }

    pub fn increment_retries_exhausted(&self) {
        bump(&self.retries_exhausted);
    }

    pub fn increment_heartbeats(&self) {
        bump(&self.heartbeats_sent);
    }

    pub fn increment_typing_expirations(&self) {
        bump(&self.typing_expirations);
    }

    pub fn increment_unread_refreshes(&self) {
        bump(&self.unread_refreshes);
    }

    pub fn increment_unread_refresh_failures(&self) {
        bump(&self.unread_refresh_failures);
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            rate_limit_rejections: load(&self.rate_limit_rejections),
            rate_limit_keys_swept: load(&self.rate_limit_keys_swept),
            notifications_received: load(&self.notifications_received),
            duplicates_dropped: load(&self.duplicates_dropped),
            deliveries: load(&self.deliveries),
            fetch_failures: load(&self.fetch_failures),
            fetch_not_found: load(&self.fetch_not_found),
            connect_attempts: load(&self.connect_attempts),
            reconnects_scheduled: load(&self.reconnects_scheduled),
            retries_exhausted: load(&self.retries_exhausted),
            heartbeats_sent: load(&self.heartbeats_sent),
            typing_expirations: load(&self.typing_expirations),
            unread_refreshes: load(&self.unread_refreshes),
            unread_refresh_failures: load(&self.unread_refresh_failures),
        }
    }

    /// Snapshot rendered as a JSON object
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.snapshot()).unwrap_or_else(|_| "{}".to_string())
    }
}

/// A point-in-time snapshot of all counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub rate_limit_rejections: u64,
    pub rate_limit_keys_swept: u64,
    pub notifications_received: u64,
    pub duplicates_dropped: u64,
    pub deliveries: u64,
    pub fetch_failures: u64,
    pub fetch_not_found: u64,
    pub connect_attempts: u64,
    pub reconnects_scheduled: u64,
    pub retries_exhausted: u64,
    pub heartbeats_sent: u64,
    pub typing_expirations: u64,
    pub unread_refreshes: u64,
    pub unread_refresh_failures: u64,
}
