//! # Realtime Client
//!
//! Application-facing entry point. Each `subscribe_*` opens one supervised
//! channel, wires it to the component that consumes it and returns a
//! handle with a single idempotent `cleanup`.
//!
//! | call | topic | consumer |
//! |---|---|---|
//! | `subscribe_to_messages` | caller's topic | delivery pipeline |
//! | `subscribe_to_typing` | `typing:<conversation>` | typing session |
//! | `subscribe_to_presence` | caller's topic | presence observer |
//! | `subscribe_to_unread` | `user:<user>` | unread reconciler |

mod subscription;
mod tracker;

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::LiveConfig;
use crate::connection::{
    ChannelEvent, ConnectionControl, ConnectionError, ConnectionManager, ConnectionStatus,
};
use crate::delivery::{notification_id, DedupWindow, DeliveryPipeline, PipelineOptions};
use crate::observability::{log_event_with_fields, Event, MetricsRegistry, MetricsSnapshot};
use crate::presence::{PresenceMap, PresenceObserver, PresenceRecord, PresenceStatus};
use crate::ratelimit::RateLimiterRegistry;
use crate::reconcile::{UnreadOptions, UnreadReconciler};
use crate::store::{EntityStore, UnreadCounts, UnreadSource};
use crate::transport::{ChangeFilter, ChangeKind, ChannelBindings, Transport};
use crate::typing::{TypingSession, TypingUser, TYPING_EVENT};

pub use subscription::{PresenceSubscription, Subscription, TypingSubscription};
pub use tracker::{ChannelTracker, ClientFailureCallback, ClientStatusCallback};

/// Broadcast event announcing a new message
pub const MESSAGE_EVENT: &str = "new_message";

/// Table whose inserts announce new messages on the change feed
pub const MESSAGES_TABLE: &str = "messages";

/// Where new entities of one kind are announced
#[derive(Debug, Clone, PartialEq)]
pub struct MessageChannel {
    /// Entity type fetched by id
    pub entity_type: String,
    /// Broadcast event name
    pub broadcast_event: String,
    /// Change-feed filter
    pub changes: ChangeFilter,
    /// Payload / row field holding the entity id
    pub id_field: String,
}

impl Default for MessageChannel {
    fn default() -> Self {
        Self {
            entity_type: "message".to_string(),
            broadcast_event: MESSAGE_EVENT.to_string(),
            changes: ChangeFilter::table(MESSAGES_TABLE).kinds(&[ChangeKind::Insert]),
            id_field: "id".to_string(),
        }
    }
}

impl MessageChannel {
    fn bindings(&self) -> ChannelBindings {
        ChannelBindings::new()
            .broadcast(self.broadcast_event.clone())
            .changes(self.changes.clone())
    }
}

/// Client for one authenticated user
pub struct RealtimeClient {
    user_id: String,
    config: LiveConfig,
    transport: Arc<dyn Transport>,
    store: Arc<dyn EntityStore>,
    unread_source: Arc<dyn UnreadSource>,
    limiter: Arc<RateLimiterRegistry>,
    metrics: Arc<MetricsRegistry>,
    tracker: Arc<ChannelTracker>,
    sweeper: JoinHandle<()>,
}

impl RealtimeClient {
    /// Must be called inside a tokio runtime; starts the rate-limit sweeper.
    pub fn new(
        user_id: impl Into<String>,
        config: LiveConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn EntityStore>,
        unread_source: Arc<dyn UnreadSource>,
    ) -> Self {
        let metrics = Arc::new(MetricsRegistry::new());
        let limiter = Arc::new(RateLimiterRegistry::new(
            config.rate_limit_presets(),
            Some(config.rate_limit_max_idle()),
            Arc::clone(&metrics),
        ));
        let sweeper = limiter.spawn_sweeper(config.rate_limit_sweep_interval());

        Self {
            user_id: user_id.into(),
            config,
            transport,
            store,
            unread_source,
            limiter,
            metrics,
            tracker: Arc::new(ChannelTracker::new()),
            sweeper,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn config(&self) -> &LiveConfig {
        &self.config
    }

    pub fn limiter(&self) -> &Arc<RateLimiterRegistry> {
        &self.limiter
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Open a supervised channel, replacing any session already on `topic`.
    /// The caller builds its consumer, then hands the teardown to `hold`.
    fn open(
        &self,
        topic: &str,
        bindings: ChannelBindings,
    ) -> (ConnectionManager, mpsc::UnboundedReceiver<ChannelEvent>, u64) {
        self.tracker.evict(topic);

        let (manager, events) = ConnectionManager::subscribe(
            Arc::clone(&self.transport),
            topic,
            bindings,
            self.config.connection_options(),
            Arc::clone(&self.metrics),
        );
        let generation = self.tracker.next_generation();

        let tracker = Arc::downgrade(&self.tracker);
        let observed_topic = topic.to_string();
        manager.on_status(move |status| {
            if let Some(tracker) = tracker.upgrade() {
                tracker.notify(&observed_topic, status);
            }
        });

        let tracker = Arc::downgrade(&self.tracker);
        let observed_topic = topic.to_string();
        manager.on_failure(move |error| {
            if let Some(tracker) = tracker.upgrade() {
                tracker.notify_failure(&observed_topic, error);
            }
        });

        (manager, events, generation)
    }

    /// Track the session behind `subscription` so a later subscribe on the
    /// same topic, or `shutdown`, runs its whole teardown
    fn hold(
        &self,
        topic: &str,
        generation: u64,
        control: ConnectionControl,
        subscription: &Subscription,
    ) {
        self.tracker
            .register(topic, generation, control, subscription.teardown());
    }

    fn release(&self, topic: &str, generation: u64) -> impl FnOnce() + Send + 'static {
        let tracker = Arc::downgrade(&self.tracker);
        let topic = topic.to_string();
        move || {
            if let Some(tracker) = tracker.upgrade() {
                tracker.release(&topic, generation);
            }
        }
    }

    /// Deliver each new message on `topic` once, fully hydrated
    pub fn subscribe_to_messages(
        &self,
        topic: &str,
        on_message: impl Fn(Value) + Send + Sync + 'static,
    ) -> Subscription {
        self.subscribe_to_entities(topic, MessageChannel::default(), on_message)
    }

    /// Deliver each entity announced on `channel` once, fully hydrated
    pub fn subscribe_to_entities(
        &self,
        topic: &str,
        channel: MessageChannel,
        on_entity: impl Fn(Value) + Send + Sync + 'static,
    ) -> Subscription {
        let (manager, mut events, generation) = self.open(topic, channel.bindings());
        let control = manager.control();

        let options = PipelineOptions {
            entity_type: channel.entity_type,
            id_field: channel.id_field,
            dedup_capacity: self.config.dedup_capacity,
            fetch_failure_alert_threshold: self.config.fetch_failure_alert_threshold,
        };
        let pipeline = Arc::new(DeliveryPipeline::new(
            options,
            Arc::clone(&self.store),
            Arc::clone(&self.metrics),
            on_entity,
        ));

        // One worker per session keeps per-path order
        let worker_pipeline = Arc::clone(&pipeline);
        let worker = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                worker_pipeline.on_channel_event(&event).await;
            }
        });

        let release = self.release(topic, generation);
        let subscription = Subscription::new(move || {
            release();
            manager.cleanup();
            pipeline.cleanup();
            worker.abort();
        });
        self.hold(topic, generation, control, &subscription);
        subscription
    }

    /// Track who is typing in `conversation_id`
    pub fn subscribe_to_typing(
        &self,
        conversation_id: &str,
        on_change: impl Fn(Vec<TypingUser>) + Send + Sync + 'static,
    ) -> TypingSubscription {
        let topic = format!("typing:{}", conversation_id);
        let (manager, events, generation) =
            self.open(&topic, ChannelBindings::new().broadcast(TYPING_EVENT));
        let control = manager.control();

        let session = Arc::new(TypingSession::new(
            topic.clone(),
            TypingUser::new(self.user_id.clone()),
            self.config.typing_timeout(),
            manager,
            events,
            Arc::clone(&self.limiter),
            Arc::clone(&self.metrics),
            on_change,
        ));

        let release = self.release(&topic, generation);
        let owned = Arc::clone(&session);
        let guard = Subscription::new(move || {
            release();
            owned.cleanup();
        });
        self.hold(&topic, generation, control, &guard);
        TypingSubscription { session, guard }
    }

    /// Publish our presence on `topic` and report everyone's
    pub fn subscribe_to_presence(
        &self,
        topic: &str,
        on_change: impl Fn(PresenceMap) + Send + Sync + 'static,
    ) -> PresenceSubscription {
        let (manager, events, generation) = self.open(topic, ChannelBindings::new().presence());
        let control = manager.control();

        let observer = Arc::new(PresenceObserver::new(
            topic,
            Some(PresenceRecord::new(self.user_id.clone(), PresenceStatus::Online)),
            manager,
            events,
            Arc::clone(&self.limiter),
            self.config.presence_options(),
            on_change,
        ));

        let release = self.release(topic, generation);
        let owned = Arc::clone(&observer);
        let guard = Subscription::new(move || {
            release();
            owned.cleanup();
        });
        self.hold(topic, generation, control, &guard);
        PresenceSubscription { observer, guard }
    }

    /// Keep `user_id`'s unread counts fresh: push, poll and reconnect paths.
    /// Timing comes from the client config.
    pub fn subscribe_to_unread(
        &self,
        user_id: &str,
        on_change: impl Fn(UnreadCounts) + Send + Sync + 'static,
    ) -> Subscription {
        self.subscribe_to_unread_with(user_id, self.config.unread_options(), on_change)
    }

    /// Same as `subscribe_to_unread` with explicit timing
    pub fn subscribe_to_unread_with(
        &self,
        user_id: &str,
        options: UnreadOptions,
        on_change: impl Fn(UnreadCounts) + Send + Sync + 'static,
    ) -> Subscription {
        let topic = format!("user:{}", user_id);
        let channel = MessageChannel::default();
        let (manager, mut events, generation) = self.open(&topic, channel.bindings());
        let control = manager.control();

        let reconciler = Arc::new(UnreadReconciler::start(
            user_id,
            Arc::clone(&self.unread_source),
            options,
            Arc::clone(&self.metrics),
            on_change,
        ));
        reconciler.watch_connection(&manager);

        // Both paths announce the same message; one push per id
        let mut seen = DedupWindow::new(self.config.dedup_capacity);
        let metrics = Arc::clone(&self.metrics);
        let push = Arc::downgrade(&reconciler);
        let worker = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some((id, path)) = notification_id(&event, &channel.id_field) else {
                    continue;
                };
                metrics.increment_notifications();
                if !seen.insert(&id) {
                    metrics.increment_duplicates();
                    let path = path.to_string();
                    log_event_with_fields(
                        Event::DuplicateDropped,
                        &[("id", &id), ("path", &path)],
                    );
                    continue;
                }
                match push.upgrade() {
                    Some(reconciler) => reconciler.notify_push(),
                    None => break,
                }
            }
        });

        let release = self.release(&topic, generation);
        let subscription = Subscription::new(move || {
            release();
            manager.cleanup();
            reconciler.cleanup();
            worker.abort();
        });
        self.hold(&topic, generation, control, &subscription);
        subscription
    }

    /// `(topic, status)` for every session; current statuses are replayed
    /// on registration
    pub fn on_connection_status(
        &self,
        callback: impl Fn(&str, ConnectionStatus) + Send + Sync + 'static,
    ) {
        self.tracker.add_observer(Arc::new(callback));
    }

    /// `(topic, error)` whenever a session gives up reconnecting. Standing
    /// failures are replayed on registration. Transient errors are not
    /// reported here.
    pub fn on_connection_failure(
        &self,
        callback: impl Fn(&str, &ConnectionError) + Send + Sync + 'static,
    ) {
        self.tracker.add_failure_observer(Arc::new(callback));
    }

    pub fn status(&self, topic: &str) -> Option<ConnectionStatus> {
        self.tracker.status(topic)
    }

    pub fn topics(&self) -> Vec<String> {
        self.tracker.topics()
    }

    /// Manual reconnect after retries are exhausted
    pub fn reconnect(&self, topic: &str) -> bool {
        self.tracker.reconnect(topic)
    }

    /// Host went offline: tear down every live subscription
    pub fn pause_all(&self) {
        self.tracker.pause_all();
    }

    /// Host back online
    pub fn resume_all(&self) {
        self.tracker.resume_all();
    }

    /// Close every session and stop background work. Idempotent.
    pub fn shutdown(&self) {
        self.tracker.close_all();
        self.sweeper.abort();
    }
}

impl Drop for RealtimeClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::transport::MemoryTransport;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::sleep;

    fn client(transport: Arc<MemoryTransport>, store: Arc<MemoryStore>) -> RealtimeClient {
        RealtimeClient::new("me", LiveConfig::default(), transport, store.clone(), store)
    }

    #[tokio::test(start_paused = true)]
    async fn test_messages_end_to_end() {
        let transport = Arc::new(MemoryTransport::new());
        let store = Arc::new(MemoryStore::new());
        store.insert("message", "m-1", json!({"id": "m-1", "body": "hello"}));
        let client = client(transport.clone(), store);

        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&delivered);
        let sub = client.subscribe_to_messages("room:1", move |m| sink.lock().unwrap().push(m));
        sleep(Duration::from_millis(1)).await;

        transport.broadcast("room:1", MESSAGE_EVENT, json!({"id": "m-1"}));
        transport.change(
            "room:1",
            crate::transport::ChangeRecord::insert(MESSAGES_TABLE, json!({"id": "m-1"})),
        );
        sleep(Duration::from_millis(1)).await;

        assert_eq!(delivered.lock().unwrap().len(), 1);
        assert_eq!(client.metrics().duplicates_dropped, 1);

        sub.cleanup();
        sub.cleanup();
        assert!(client.topics().is_empty());
        assert_eq!(transport.live_count("room:1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_subscription_replaces_first() {
        let transport = Arc::new(MemoryTransport::new());
        let store = Arc::new(MemoryStore::new());
        let client = client(transport.clone(), store);

        let first = client.subscribe_to_messages("room:1", |_| {});
        let _second = client.subscribe_to_messages("room:1", |_| {});
        sleep(Duration::from_millis(1)).await;

        assert_eq!(transport.live_count("room:1"), 1);
        assert!(first.is_closed());

        // Cleaning up the replaced session leaves the new one tracked
        first.cleanup();
        assert_eq!(client.topics(), vec!["room:1".to_string()]);
        assert_eq!(client.status("room:1"), Some(ConnectionStatus::Connected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_observer_replays_and_follows() {
        let transport = Arc::new(MemoryTransport::new());
        let store = Arc::new(MemoryStore::new());
        let client = client(transport.clone(), store);
        let _sub = client.subscribe_to_messages("room:1", |_| {});
        sleep(Duration::from_millis(1)).await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        client.on_connection_status(move |topic, status| {
            sink.lock().unwrap().push((topic.to_string(), status))
        });
        assert_eq!(
            *seen.lock().unwrap(),
            vec![("room:1".to_string(), ConnectionStatus::Connected)]
        );

        client.pause_all();
        sleep(Duration::from_millis(1)).await;
        assert_eq!(
            seen.lock().unwrap().last().cloned(),
            Some(("room:1".to_string(), ConnectionStatus::Paused))
        );

        client.resume_all();
        sleep(Duration::from_millis(1)).await;
        assert_eq!(client.status("room:1"), Some(ConnectionStatus::Connected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_typing_and_presence_subscriptions() {
        let transport = Arc::new(MemoryTransport::new());
        let store = Arc::new(MemoryStore::new());
        let client = client(transport.clone(), store);

        let typing = client.subscribe_to_typing("c-1", |_| {});
        let presence = client.subscribe_to_presence("lobby", |_| {});
        sleep(Duration::from_millis(10)).await;

        typing.start_typing();
        assert_eq!(transport.sent_count("typing:c-1", TYPING_EVENT), 1);
        assert_eq!(presence.presence()["me"].status, PresenceStatus::Online);

        typing.cleanup();
        presence.cleanup();
        assert!(client.topics().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_replaced_presence_stops_publishing() {
        let transport = Arc::new(MemoryTransport::new());
        let store = Arc::new(MemoryStore::new());
        let client = client(transport.clone(), store);

        let first = client.subscribe_to_presence("lobby", |_| {});
        let _second = client.subscribe_to_presence("lobby", |_| {});
        sleep(Duration::from_millis(10)).await;

        assert!(first.is_closed());
        assert!(first.observer.connection().is_closed());
        assert_eq!(transport.live_count("lobby"), 1);
    }
}
