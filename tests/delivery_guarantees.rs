//! Delivery Guarantee Tests
//!
//! Two independent notification paths (broadcast and change feed) each
//! deliver at least once. The application must see every reachable entity
//! at most once, fully hydrated from the store.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use aerolive::client::{RealtimeClient, Subscription, MESSAGES_TABLE, MESSAGE_EVENT};
use aerolive::config::LiveConfig;
use aerolive::store::MemoryStore;
use aerolive::transport::{ChangeRecord, MemoryTransport};
use serde_json::{json, Value};
use tokio::time::sleep;

// =============================================================================
// Test Utilities
// =============================================================================

const TOPIC: &str = "room:42";

struct Harness {
    transport: Arc<MemoryTransport>,
    store: Arc<MemoryStore>,
    client: RealtimeClient,
    delivered: Arc<Mutex<Vec<Value>>>,
}

impl Harness {
    fn new(config: LiveConfig) -> Self {
        let transport = Arc::new(MemoryTransport::new());
        let store = Arc::new(MemoryStore::new());
        let client = RealtimeClient::new(
            "alice",
            config,
            transport.clone(),
            store.clone(),
            store.clone(),
        );
        Self {
            transport,
            store,
            client,
            delivered: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn subscribe(&self) -> Subscription {
        let sink = Arc::clone(&self.delivered);
        self.client
            .subscribe_to_messages(TOPIC, move |message| sink.lock().unwrap().push(message))
    }

    fn publish(&self, id: &str) {
        self.store
            .insert("message", id, json!({"id": id, "body": format!("body of {}", id)}));
    }

    fn broadcast(&self, id: &str) -> usize {
        self.transport.broadcast(TOPIC, MESSAGE_EVENT, json!({"id": id}))
    }

    fn change(&self, id: &str) -> usize {
        self.transport
            .change(TOPIC, ChangeRecord::insert(MESSAGES_TABLE, json!({"id": id})))
    }

    fn delivered_ids(&self) -> Vec<String> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .filter_map(|m| m["id"].as_str().map(str::to_string))
            .collect()
    }
}

async fn settle() {
    sleep(Duration::from_millis(5)).await;
}

// =============================================================================
// At-most-once across paths
// =============================================================================

/// Both paths and a repeated broadcast announce the same id: one callback.
#[tokio::test(start_paused = true)]
async fn test_same_id_on_both_paths_delivered_once() {
    let h = Harness::new(LiveConfig::default());
    let _sub = h.subscribe();
    settle().await;

    h.publish("m-1");
    assert_eq!(h.broadcast("m-1"), 1);
    assert_eq!(h.change("m-1"), 1);
    assert_eq!(h.broadcast("m-1"), 1);
    settle().await;

    assert_eq!(h.delivered_ids(), vec!["m-1".to_string()]);
    let metrics = h.client.metrics();
    assert_eq!(metrics.notifications_received, 3);
    assert_eq!(metrics.duplicates_dropped, 2);
    assert_eq!(metrics.deliveries, 1);
}

/// The callback receives the store's hydrated entity, not the notification.
#[tokio::test(start_paused = true)]
async fn test_delivered_entity_is_hydrated_from_store() {
    let h = Harness::new(LiveConfig::default());
    let _sub = h.subscribe();
    settle().await;

    h.publish("m-7");
    h.change("m-7");
    settle().await;

    let delivered = h.delivered.lock().unwrap();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0]["body"], "body of m-7");
}

/// Interleaved paths across many ids still deliver each id exactly once.
#[tokio::test(start_paused = true)]
async fn test_many_ids_interleaved_paths() {
    let h = Harness::new(LiveConfig::default());
    let _sub = h.subscribe();
    settle().await;

    for i in 0..50 {
        let id = format!("m-{}", i);
        h.publish(&id);
        if i % 2 == 0 {
            h.broadcast(&id);
            h.change(&id);
        } else {
            h.change(&id);
            h.broadcast(&id);
        }
    }
    settle().await;

    let mut ids = h.delivered_ids();
    assert_eq!(ids.len(), 50);
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 50);
}

// =============================================================================
// Fetch outcomes
// =============================================================================

/// A notification for an entity that no longer exists produces no callback.
#[tokio::test(start_paused = true)]
async fn test_missing_entity_not_delivered() {
    let h = Harness::new(LiveConfig::default());
    let _sub = h.subscribe();
    settle().await;

    h.broadcast("deleted");
    settle().await;

    assert!(h.delivered_ids().is_empty());
    assert_eq!(h.client.metrics().fetch_not_found, 1);
}

/// A failed fetch is not retried by the duplicate from the other path.
#[tokio::test(start_paused = true)]
async fn test_failed_fetch_keeps_id_deduplicated() {
    let h = Harness::new(LiveConfig::default());
    let _sub = h.subscribe();
    settle().await;

    h.publish("m-1");
    h.store.fail_next_fetches(1);
    h.broadcast("m-1");
    settle().await;
    h.change("m-1");
    settle().await;

    assert!(h.delivered_ids().is_empty());
    let metrics = h.client.metrics();
    assert_eq!(metrics.fetch_failures, 1);
    assert_eq!(metrics.duplicates_dropped, 1);
    assert_eq!(h.store.fetch_calls(), 1);
}

// =============================================================================
// Bounded memory
// =============================================================================

/// Ids evicted from the dedup window are delivered again if re-announced.
#[tokio::test(start_paused = true)]
async fn test_dedup_window_is_bounded() {
    let config = LiveConfig {
        dedup_capacity: 2,
        ..LiveConfig::default()
    };
    let h = Harness::new(config);
    let _sub = h.subscribe();
    settle().await;

    for id in ["m-1", "m-2", "m-3"] {
        h.publish(id);
        h.broadcast(id);
    }
    settle().await;
    h.broadcast("m-1");
    settle().await;

    assert_eq!(h.delivered_ids(), vec!["m-1", "m-2", "m-3", "m-1"]);
}

// =============================================================================
// Lifecycle
// =============================================================================

/// After cleanup nothing more is delivered and the transport is released.
#[tokio::test(start_paused = true)]
async fn test_no_delivery_after_cleanup() {
    let h = Harness::new(LiveConfig::default());
    let sub = h.subscribe();
    settle().await;

    sub.cleanup();
    h.publish("m-1");
    assert_eq!(h.broadcast("m-1"), 0);
    settle().await;

    assert!(h.delivered_ids().is_empty());
    assert_eq!(h.transport.live_count(TOPIC), 0);
}
