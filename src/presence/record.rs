//! Presence records
//!
//! A record is a mirrored view of server-tracked state; the client never
//! owns it exclusively.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reported availability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    Offline,
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PresenceStatus::Online => write!(f, "online"),
            PresenceStatus::Away => write!(f, "away"),
            PresenceStatus::Offline => write!(f, "offline"),
        }
    }
}

/// Presence state for one user in one topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    /// User ID
    pub user_id: String,

    /// Reported status
    pub status: PresenceStatus,

    /// Last time the user was seen by the server
    pub last_seen_at: DateTime<Utc>,

    /// Custom state (display name, avatar, ...)
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

impl PresenceRecord {
    /// A record stamped now
    pub fn new(user_id: impl Into<String>, status: PresenceStatus) -> Self {
        Self {
            user_id: user_id.into(),
            status,
            last_seen_at: Utc::now(),
            metadata: Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Refresh `last_seen_at`
    pub fn touch(&mut self) {
        self.last_seen_at = Utc::now();
    }

    /// No sighting for longer than `timeout` as of `now`
    pub fn is_stale(&self, timeout: Duration, now: DateTime<Utc>) -> bool {
        now - self.last_seen_at > timeout
    }

    /// Status as it should be shown: stale records read as offline
    pub fn effective_status(&self, timeout: Duration, now: DateTime<Utc>) -> PresenceStatus {
        if self.is_stale(timeout, now) {
            PresenceStatus::Offline
        } else {
            self.status
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stale_record_reads_offline() {
        let mut record = PresenceRecord::new("u-1", PresenceStatus::Away);
        let now = Utc::now();
        assert_eq!(record.effective_status(Duration::seconds(60), now), PresenceStatus::Away);

        record.last_seen_at = now - Duration::seconds(61);
        assert!(record.is_stale(Duration::seconds(60), now));
        assert_eq!(
            record.effective_status(Duration::seconds(60), now),
            PresenceStatus::Offline
        );
    }

    #[test]
    fn test_wire_shape() {
        let record = PresenceRecord::new("u-1", PresenceStatus::Online)
            .with_metadata(json!({"name": "Ada"}));
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["status"], "online");
        assert_eq!(value["metadata"]["name"], "Ada");

        let back: PresenceRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back.user_id, "u-1");
    }
}
