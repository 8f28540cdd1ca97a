//! Cleanup Lifecycle Tests
//!
//! Every subscription has exactly one teardown:
//! - calling it twice is a no-op
//! - after it, no callback fires and no transport subscription is live
//! - re-subscribing a topic replaces the previous session, whole

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use aerolive::client::{RealtimeClient, MESSAGE_EVENT};
use aerolive::config::LiveConfig;
use aerolive::connection::ConnectionStatus;
use aerolive::reconcile::UnreadOptions;
use aerolive::store::MemoryStore;
use aerolive::transport::MemoryTransport;
use aerolive::typing::TYPING_EVENT;
use serde_json::json;
use tokio::time::sleep;

fn setup() -> (Arc<MemoryTransport>, Arc<MemoryStore>, RealtimeClient) {
    let transport = Arc::new(MemoryTransport::new());
    let store = Arc::new(MemoryStore::new());
    let client = RealtimeClient::new(
        "alice",
        LiveConfig::default(),
        transport.clone(),
        store.clone(),
        store.clone(),
    );
    (transport, store, client)
}

async fn ms(n: u64) {
    sleep(Duration::from_millis(n)).await;
}

fn counter() -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    (Arc::clone(&count), count)
}

/// Each subscription kind: cleanup twice, then silence.
#[tokio::test(start_paused = true)]
async fn test_every_subscription_cleanup_is_idempotent() {
    let (transport, store, client) = setup();

    let (messages, sink) = counter();
    let message_sub = client.subscribe_to_messages("room:1", move |_| {
        sink.fetch_add(1, Ordering::SeqCst);
    });
    let (typing, sink) = counter();
    let typing_sub = client.subscribe_to_typing("c-1", move |_| {
        sink.fetch_add(1, Ordering::SeqCst);
    });
    let (presence, sink) = counter();
    let presence_sub = client.subscribe_to_presence("lobby", move |_| {
        sink.fetch_add(1, Ordering::SeqCst);
    });
    let (unread, sink) = counter();
    let unread_sub = client.subscribe_to_unread("alice", move |_| {
        sink.fetch_add(1, Ordering::SeqCst);
    });
    ms(600).await;
    assert_eq!(client.topics().len(), 4);

    message_sub.cleanup();
    typing_sub.cleanup();
    presence_sub.cleanup();
    unread_sub.cleanup();

    message_sub.cleanup();
    typing_sub.cleanup();
    presence_sub.cleanup();
    unread_sub.cleanup();

    assert!(message_sub.is_closed());
    assert!(typing_sub.is_closed());
    assert!(presence_sub.is_closed());
    assert!(unread_sub.is_closed());
    assert!(client.topics().is_empty());
    for topic in ["room:1", "typing:c-1", "lobby", "user:alice"] {
        assert_eq!(transport.live_count(topic), 0, "{} still live", topic);
    }

    let before = (
        messages.load(Ordering::SeqCst),
        typing.load(Ordering::SeqCst),
        presence.load(Ordering::SeqCst),
        unread.load(Ordering::SeqCst),
    );

    store.insert("message", "m-1", json!({"id": "m-1"}));
    transport.broadcast("room:1", MESSAGE_EVENT, json!({"id": "m-1"}));
    transport.broadcast("typing:c-1", TYPING_EVENT, json!({"user_id": "bob", "typing": true}));
    transport.presence_sync("lobby");
    typing_sub.start_typing();
    ms(60_000).await;

    let after = (
        messages.load(Ordering::SeqCst),
        typing.load(Ordering::SeqCst),
        presence.load(Ordering::SeqCst),
        unread.load(Ordering::SeqCst),
    );
    assert_eq!(before, after);
    assert_eq!(transport.sent_count("typing:c-1", TYPING_EVENT), 0);
}

/// Dropping a subscription handle cleans it up.
#[tokio::test(start_paused = true)]
async fn test_drop_cleans_up() {
    let (transport, _store, client) = setup();
    {
        let _sub = client.subscribe_to_messages("room:1", |_| {});
        ms(1).await;
        assert_eq!(transport.live_count("room:1"), 1);
    }
    assert_eq!(transport.live_count("room:1"), 0);
    assert!(client.topics().is_empty());
}

/// A second subscription to the same topic closes the first session.
#[tokio::test(start_paused = true)]
async fn test_resubscribe_replaces_previous_session() {
    let (transport, store, client) = setup();
    let first_count = Arc::new(Mutex::new(0));
    let second_count = Arc::new(Mutex::new(0));

    let sink = Arc::clone(&first_count);
    let _first = client.subscribe_to_messages("room:1", move |_| *sink.lock().unwrap() += 1);
    let sink = Arc::clone(&second_count);
    let _second = client.subscribe_to_messages("room:1", move |_| *sink.lock().unwrap() += 1);
    ms(1).await;

    assert_eq!(transport.live_count("room:1"), 1);
    store.insert("message", "m-1", json!({"id": "m-1"}));
    transport.broadcast("room:1", MESSAGE_EVENT, json!({"id": "m-1"}));
    ms(1).await;

    assert_eq!(*first_count.lock().unwrap(), 0);
    assert_eq!(*second_count.lock().unwrap(), 1);
}

/// Replacing an unread session stops its reconciler too, not just its
/// channel, even while the old handle is still held.
#[tokio::test(start_paused = true)]
async fn test_resubscribe_stops_replaced_reconciler() {
    let (transport, store, client) = setup();
    let options = UnreadOptions {
        poll_interval: Duration::from_secs(5),
        ..UnreadOptions::default()
    };

    let (first, sink) = counter();
    let first_sub = client.subscribe_to_unread_with("alice", options, move |_| {
        sink.fetch_add(1, Ordering::SeqCst);
    });
    let (second, sink) = counter();
    let _second_sub = client.subscribe_to_unread_with("alice", options, move |_| {
        sink.fetch_add(1, Ordering::SeqCst);
    });
    ms(1).await;

    assert!(first_sub.is_closed());
    assert_eq!(transport.live_count("user:alice"), 1);
    let calls = store.unread_calls();
    let first_seen = first.load(Ordering::SeqCst);
    let second_seen = second.load(Ordering::SeqCst);

    // Polls at +5 s and +10 s from the surviving reconciler only
    ms(12_000).await;
    assert_eq!(store.unread_calls(), calls + 2);
    assert_eq!(first.load(Ordering::SeqCst), first_seen);
    assert_eq!(second.load(Ordering::SeqCst), second_seen + 2);

    // The stale handle's cleanup leaves the new session tracked
    first_sub.cleanup();
    assert_eq!(client.topics(), vec!["user:alice".to_string()]);
}

/// Shutdown runs every subscription's teardown, even with handles alive.
#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_background_work() {
    let (_transport, store, client) = setup();
    let options = UnreadOptions {
        poll_interval: Duration::from_secs(5),
        ..UnreadOptions::default()
    };
    let sub = client.subscribe_to_unread_with("alice", options, |_| {});
    ms(1).await;

    client.shutdown();
    assert!(sub.is_closed());
    let calls = store.unread_calls();
    ms(30_000).await;
    assert_eq!(store.unread_calls(), calls);
}

/// Shutdown closes every session and stops status reporting.
#[tokio::test(start_paused = true)]
async fn test_shutdown_closes_everything() {
    let (transport, _store, client) = setup();
    let statuses = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&statuses);
    client.on_connection_status(move |topic, status| {
        sink.lock().unwrap().push((topic.to_string(), status))
    });

    let _a = client.subscribe_to_messages("room:a", |_| {});
    let _b = client.subscribe_to_typing("c-1", |_| {});
    ms(1).await;
    assert_eq!(client.status("room:a"), Some(ConnectionStatus::Connected));

    client.shutdown();
    client.shutdown();
    ms(1).await;

    assert!(client.topics().is_empty());
    assert_eq!(transport.live_count("room:a"), 0);
    assert_eq!(transport.live_count("typing:c-1"), 0);

    let seen = statuses.lock().unwrap().len();
    transport.close("room:a");
    ms(5_000).await;
    assert_eq!(statuses.lock().unwrap().len(), seen);
}
