//! # Delivery Pipeline
//!
//! Redundant at-least-once producers (broadcast and change feed) feeding
//! one idempotent consumer. For each raw notification:
//!
//! 1. drop it if the id is already in the dedup window
//! 2. insert the id
//! 3. fetch the canonical payload by id
//! 4. drop silently on fetch failure or not-found
//! 5. otherwise deliver exactly once
//!
//! The id stays in the window even when the fetch fails, so a later
//! notification for the same id is not retried. The application callback
//! therefore runs at most once per id for the life of the pipeline.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;

use super::dedup::DedupWindow;
use crate::connection::ChannelEvent;
use crate::observability::{log_event_with_fields, Event, MetricsRegistry};
use crate::store::EntityStore;

/// Default consecutive fetch failures before the log escalates
pub const DEFAULT_FETCH_FAILURE_ALERT_THRESHOLD: u32 = 3;

/// Application delivery callback
pub type DeliverCallback = Arc<dyn Fn(Value) + Send + Sync>;

/// Which producer reported the entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryPath {
    /// Low-latency ephemeral broadcast
    Broadcast,
    /// Durable change feed
    ChangeFeed,
}

impl fmt::Display for DeliveryPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryPath::Broadcast => write!(f, "broadcast"),
            DeliveryPath::ChangeFeed => write!(f, "change_feed"),
        }
    }
}

/// What happened to one raw notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Callback invoked with the hydrated payload
    Delivered,
    /// Id already seen; dropped
    Duplicate,
    /// Entity gone by the time it was fetched; dropped
    NotFound,
    /// Fetch failed; dropped
    FetchFailed,
    /// Pipeline already cleaned up; dropped
    Closed,
}

/// Pipeline settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOptions {
    /// Entity type passed to `fetch_by_id`
    pub entity_type: String,
    /// Payload field carrying the entity id
    pub id_field: String,
    pub dedup_capacity: usize,
    pub fetch_failure_alert_threshold: u32,
}

impl PipelineOptions {
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            id_field: "id".to_string(),
            dedup_capacity: super::DEFAULT_DEDUP_CAPACITY,
            fetch_failure_alert_threshold: DEFAULT_FETCH_FAILURE_ALERT_THRESHOLD,
        }
    }
}

/// Deduplicating fetch-and-deliver pipeline for one channel session
pub struct DeliveryPipeline {
    options: PipelineOptions,
    store: Arc<dyn EntityStore>,
    dedup: Mutex<DedupWindow>,
    consecutive_failures: AtomicU32,
    closed: AtomicBool,
    metrics: Arc<MetricsRegistry>,
    deliver: DeliverCallback,
}

impl DeliveryPipeline {
    pub fn new(
        options: PipelineOptions,
        store: Arc<dyn EntityStore>,
        metrics: Arc<MetricsRegistry>,
        deliver: impl Fn(Value) + Send + Sync + 'static,
    ) -> Self {
        let dedup = DedupWindow::new(options.dedup_capacity);
        Self {
            options,
            store,
            dedup: Mutex::new(dedup),
            consecutive_failures: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            metrics,
            deliver: Arc::new(deliver),
        }
    }

    fn dedup(&self) -> MutexGuard<'_, DedupWindow> {
        self.dedup.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Process one raw notification
    pub async fn on_raw_notification(&self, entity_id: &str, path: DeliveryPath) -> DeliveryOutcome {
        if self.is_closed() {
            return DeliveryOutcome::Closed;
        }
        self.metrics.increment_notifications();

        let path_str = path.to_string();
        if !self.dedup().insert(entity_id) {
            self.metrics.increment_duplicates();
            log_event_with_fields(
                Event::DuplicateDropped,
                &[("id", entity_id), ("path", &path_str)],
            );
            return DeliveryOutcome::Duplicate;
        }

        let fetched = self
            .store
            .fetch_by_id(&self.options.entity_type, entity_id)
            .await;

        if self.is_closed() {
            return DeliveryOutcome::Closed;
        }

        match fetched {
            Ok(Some(payload)) => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
                self.metrics.increment_deliveries();
                log_event_with_fields(Event::Delivered, &[("id", entity_id), ("path", &path_str)]);
                (self.deliver)(payload);
                DeliveryOutcome::Delivered
            }
            Ok(None) => {
                // Benign race: deleted between notification and fetch
                self.consecutive_failures.store(0, Ordering::SeqCst);
                self.metrics.increment_fetch_not_found();
                log_event_with_fields(Event::EntityNotFound, &[("id", entity_id), ("path", &path_str)]);
                DeliveryOutcome::NotFound
            }
            Err(e) => {
                self.metrics.increment_fetch_failures();
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                let reason = e.to_string();
                let failures_str = failures.to_string();
                let fields = [
                    ("id", entity_id),
                    ("path", path_str.as_str()),
                    ("reason", reason.as_str()),
                    ("consecutive", failures_str.as_str()),
                ];
                if failures >= self.options.fetch_failure_alert_threshold {
                    log_event_with_fields(Event::FetchFailuresPersistent, &fields);
                } else {
                    log_event_with_fields(Event::FetchFailed, &fields);
                }
                DeliveryOutcome::FetchFailed
            }
        }
    }

    /// Route a channel event; events without an entity id are ignored
    pub async fn on_channel_event(&self, event: &ChannelEvent) -> Option<DeliveryOutcome> {
        match notification_id(event, &self.options.id_field) {
            Some((id, path)) => Some(self.on_raw_notification(&id, path).await),
            None => {
                if !matches!(event, ChannelEvent::PresenceSync(_)) {
                    log_event_with_fields(
                        Event::NotificationMalformed,
                        &[("id_field", &self.options.id_field)],
                    );
                }
                None
            }
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    pub fn seen(&self, entity_id: &str) -> bool {
        self.dedup().contains(entity_id)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop delivering and forget every seen id. Idempotent.
    pub fn cleanup(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.dedup().clear();
        }
    }
}

/// Entity id and path of a raw notification.
///
/// Broadcasts carry the id in their payload; change records in the new
/// row, or the old row for deletes.
pub fn notification_id(event: &ChannelEvent, id_field: &str) -> Option<(String, DeliveryPath)> {
    let (row, path) = match event {
        ChannelEvent::Broadcast { payload, .. } => (payload, DeliveryPath::Broadcast),
        ChannelEvent::Change(record) => (record.row()?, DeliveryPath::ChangeFeed),
        ChannelEvent::PresenceSync(_) => return None,
    };
    let id = match row.get(id_field)? {
        Value::String(s) if !s.is_empty() => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    Some((id, path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::transport::ChangeRecord;
    use serde_json::json;

    fn pipeline(store: Arc<MemoryStore>) -> (DeliveryPipeline, Arc<Mutex<Vec<Value>>>) {
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&delivered);
        let pipeline = DeliveryPipeline::new(
            PipelineOptions::new("message"),
            store,
            Arc::new(MetricsRegistry::new()),
            move |payload| sink.lock().unwrap().push(payload),
        );
        (pipeline, delivered)
    }

    #[tokio::test]
    async fn test_both_paths_deliver_once() {
        let store = Arc::new(MemoryStore::new());
        store.insert("message", "m-1", json!({"id": "m-1", "body": "hi"}));
        let (pipeline, delivered) = pipeline(store.clone());

        assert_eq!(
            pipeline.on_raw_notification("m-1", DeliveryPath::Broadcast).await,
            DeliveryOutcome::Delivered
        );
        assert_eq!(
            pipeline.on_raw_notification("m-1", DeliveryPath::ChangeFeed).await,
            DeliveryOutcome::Duplicate
        );

        assert_eq!(delivered.lock().unwrap().len(), 1);
        assert_eq!(store.fetch_calls(), 1);
    }

    #[tokio::test]
    async fn test_not_found_is_dropped() {
        let store = Arc::new(MemoryStore::new());
        let (pipeline, delivered) = pipeline(store);

        assert_eq!(
            pipeline.on_raw_notification("gone", DeliveryPath::ChangeFeed).await,
            DeliveryOutcome::NotFound
        );
        assert!(delivered.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_fetch_is_not_retried() {
        let store = Arc::new(MemoryStore::new());
        store.insert("message", "m-1", json!({"id": "m-1"}));
        store.fail_next_fetches(1);
        let (pipeline, delivered) = pipeline(store);

        assert_eq!(
            pipeline.on_raw_notification("m-1", DeliveryPath::Broadcast).await,
            DeliveryOutcome::FetchFailed
        );
        assert_eq!(
            pipeline.on_raw_notification("m-1", DeliveryPath::ChangeFeed).await,
            DeliveryOutcome::Duplicate
        );
        assert!(delivered.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_consecutive_failures_reset_on_success() {
        let store = Arc::new(MemoryStore::new());
        store.insert("message", "m-4", json!({"id": "m-4"}));
        store.fail_next_fetches(3);
        let (pipeline, _delivered) = pipeline(store);

        for id in ["m-1", "m-2", "m-3"] {
            pipeline.on_raw_notification(id, DeliveryPath::Broadcast).await;
        }
        assert_eq!(pipeline.consecutive_failures(), 3);

        pipeline.on_raw_notification("m-4", DeliveryPath::Broadcast).await;
        assert_eq!(pipeline.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_stops_delivery() {
        let store = Arc::new(MemoryStore::new());
        store.insert("message", "m-1", json!({"id": "m-1"}));
        let (pipeline, delivered) = pipeline(store);

        pipeline.cleanup();
        pipeline.cleanup();

        assert_eq!(
            pipeline.on_raw_notification("m-1", DeliveryPath::Broadcast).await,
            DeliveryOutcome::Closed
        );
        assert!(delivered.lock().unwrap().is_empty());
    }

    #[test]
    fn test_notification_id_extraction() {
        let broadcast = ChannelEvent::Broadcast {
            event: "new_message".to_string(),
            payload: json!({"id": "m-1"}),
        };
        assert_eq!(
            notification_id(&broadcast, "id"),
            Some(("m-1".to_string(), DeliveryPath::Broadcast))
        );

        let change = ChannelEvent::Change(ChangeRecord::insert("messages", json!({"id": 42})));
        assert_eq!(
            notification_id(&change, "id"),
            Some(("42".to_string(), DeliveryPath::ChangeFeed))
        );

        let missing = ChannelEvent::Broadcast {
            event: "new_message".to_string(),
            payload: json!({"body": "no id"}),
        };
        assert_eq!(notification_id(&missing, "id"), None);
    }
}
