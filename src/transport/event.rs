//! # Transport Events
//!
//! Everything the transport pushes back for one subscription, plus the
//! bindings that decide which of it the subscriber wants.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::presence::PresenceRecord;

/// Subscription status reported by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeStatus {
    /// Subscription confirmed
    Subscribed,
    /// Channel-level error
    ChannelError(String),
    /// Subscribe or heartbeat reply timed out
    TimedOut,
    /// Subscription closed by the transport
    Closed,
}

/// Kind of row change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Insert => write!(f, "INSERT"),
            ChangeKind::Update => write!(f, "UPDATE"),
            ChangeKind::Delete => write!(f, "DELETE"),
        }
    }
}

/// Durable change-feed notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub kind: ChangeKind,
    pub table: String,
    /// Row after the change (INSERT/UPDATE)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new: Option<Value>,
    /// Row before the change (UPDATE/DELETE)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<Value>,
    pub commit_timestamp: DateTime<Utc>,
}

impl ChangeRecord {
    pub fn insert(table: impl Into<String>, row: Value) -> Self {
        Self {
            kind: ChangeKind::Insert,
            table: table.into(),
            new: Some(row),
            old: None,
            commit_timestamp: Utc::now(),
        }
    }

    pub fn update(table: impl Into<String>, old: Value, new: Value) -> Self {
        Self {
            kind: ChangeKind::Update,
            table: table.into(),
            new: Some(new),
            old: Some(old),
            commit_timestamp: Utc::now(),
        }
    }

    pub fn delete(table: impl Into<String>, row: Value) -> Self {
        Self {
            kind: ChangeKind::Delete,
            table: table.into(),
            new: None,
            old: Some(row),
            commit_timestamp: Utc::now(),
        }
    }

    /// The row the notification is about: new image first, then old
    pub fn row(&self) -> Option<&Value> {
        self.new.as_ref().or(self.old.as_ref())
    }
}

/// One event pushed by the transport for a subscription
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Status(SubscribeStatus),
    Broadcast { event: String, payload: Value },
    Change(ChangeRecord),
    PresenceSync(Vec<PresenceRecord>),
}

/// Change-feed filter: table, optional kinds, optional `column = value`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeFilter {
    pub table: String,
    /// Empty means every kind
    #[serde(default)]
    pub kinds: Vec<ChangeKind>,
    #[serde(default)]
    pub column_eq: Option<(String, Value)>,
}

impl ChangeFilter {
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            kinds: Vec::new(),
            column_eq: None,
        }
    }

    pub fn kinds(mut self, kinds: &[ChangeKind]) -> Self {
        self.kinds = kinds.to_vec();
        self
    }

    pub fn column_eq(mut self, column: impl Into<String>, value: Value) -> Self {
        self.column_eq = Some((column.into(), value));
        self
    }

    pub fn matches(&self, record: &ChangeRecord) -> bool {
        if record.table != self.table {
            return false;
        }
        if !self.kinds.is_empty() && !self.kinds.contains(&record.kind) {
            return false;
        }
        match &self.column_eq {
            None => true,
            Some((column, expected)) => record
                .row()
                .and_then(|row| row.get(column))
                .map(|actual| actual == expected)
                .unwrap_or(false),
        }
    }
}

/// One event-type binding
#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    /// Broadcasts with this event name
    Broadcast(String),
    /// Change-feed notifications matching the filter
    Change(ChangeFilter),
    /// Presence sync
    PresenceSync,
}

/// Ordered bindings attached before the transport confirms a subscription
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelBindings {
    bindings: Vec<Binding>,
}

impl ChannelBindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn broadcast(mut self, event: impl Into<String>) -> Self {
        let binding = Binding::Broadcast(event.into());
        if !self.bindings.contains(&binding) {
            self.bindings.push(binding);
        }
        self
    }

    pub fn changes(mut self, filter: ChangeFilter) -> Self {
        let binding = Binding::Change(filter);
        if !self.bindings.contains(&binding) {
            self.bindings.push(binding);
        }
        self
    }

    pub fn presence(mut self) -> Self {
        if !self.bindings.contains(&Binding::PresenceSync) {
            self.bindings.push(Binding::PresenceSync);
        }
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &Binding> {
        self.bindings.iter()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Whether a non-status event is wanted by any binding
    pub fn wants(&self, event: &TransportEvent) -> bool {
        match event {
            TransportEvent::Status(_) => true,
            TransportEvent::Broadcast { event, .. } => self
                .bindings
                .iter()
                .any(|b| matches!(b, Binding::Broadcast(name) if name == event)),
            TransportEvent::Change(record) => self
                .bindings
                .iter()
                .any(|b| matches!(b, Binding::Change(filter) if filter.matches(record))),
            TransportEvent::PresenceSync(_) => self.bindings.contains(&Binding::PresenceSync),
        }
    }
}
