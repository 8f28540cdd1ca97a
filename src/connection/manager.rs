//! # Connection Manager
//!
//! Owns one logical subscription to a topic and supervises it:
//!
//! - opens the transport subscription with every binding attached up front
//! - on confirmation: `Connected`, retry counter reset, heartbeat started
//! - on error / timeout / close: teardown, then reconnect with jittered
//!   exponential backoff until `max_retries` is exhausted, which is terminal
//! - `pause` / `resume` / `reconnect` are commands to the supervisor task
//! - `cleanup` is synchronous and idempotent
//!
//! At most one transport subscription is live per manager: every open
//! first tears down the previous binding.

use std::future::pending;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};

use super::backoff::BackoffConfig;
use super::errors::{ConnectionError, ConnectionResult};
use super::status::ConnectionStatus;
use crate::observability::{log_event_with_fields, Event, MetricsRegistry};
use crate::presence::PresenceRecord;
use crate::transport::{
    ChangeRecord, ChannelBindings, SubscribeStatus, SubscriptionHandle, Transport,
    TransportEvent, TransportResult,
};

/// Event name of the liveness broadcast
pub const HEARTBEAT_EVENT: &str = "heartbeat";

/// Status observer
pub type StatusCallback = Arc<dyn Fn(ConnectionStatus) + Send + Sync>;

/// Terminal failure observer
pub type FailureCallback = Arc<dyn Fn(&ConnectionError) + Send + Sync>;

/// Identifies a registered status or failure observer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Supervision settings for one session
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionOptions {
    pub backoff: BackoffConfig,
    pub heartbeat_interval: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

/// Non-status events forwarded to the session owner, in transport order
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Broadcast { event: String, payload: Value },
    Change(ChangeRecord),
    PresenceSync(Vec<PresenceRecord>),
}

enum Command {
    Pause,
    Resume,
    Reconnect,
}

enum Failure {
    ChannelError(String),
    TimedOut,
    Closed,
    Rejected(String),
}

struct SessionState {
    status: ConnectionStatus,
    retry_count: u32,
    handle: Option<SubscriptionHandle>,
    observers: Vec<(ObserverId, StatusCallback)>,
    failure_observers: Vec<(ObserverId, FailureCallback)>,
    next_observer: u64,
    heartbeat_active: bool,
    failure: Option<ConnectionError>,
    closed: bool,
}

struct Shared {
    topic: String,
    transport: Arc<dyn Transport>,
    bindings: ChannelBindings,
    options: ConnectionOptions,
    metrics: Arc<MetricsRegistry>,
    state: Mutex<SessionState>,
    status_tx: watch::Sender<ConnectionStatus>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_closed(&self) -> bool {
        self.state().closed
    }

    fn set_status(&self, status: ConnectionStatus) {
        let observers: Vec<StatusCallback> = {
            let mut state = self.state();
            if state.closed || state.status == status {
                return;
            }
            state.status = status;
            state.observers.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };
        self.status_tx.send_replace(status);
        for observer in observers {
            observer(status);
        }
    }

    /// Detach the live transport subscription, if any
    fn teardown_handle(&self) {
        let handle = {
            let mut state = self.state();
            state.heartbeat_active = false;
            state.handle.take()
        };
        if let Some(handle) = handle {
            self.transport.unsubscribe(&handle);
        }
    }

    /// Fresh subscribe attempt
    fn open(&self) -> TransportResult<mpsc::UnboundedReceiver<TransportEvent>> {
        self.teardown_handle();
        self.set_status(ConnectionStatus::Connecting);
        self.metrics.increment_connect_attempts();

        let retry = self.state().retry_count.to_string();
        log_event_with_fields(
            Event::ChannelSubscribe,
            &[("topic", &self.topic), ("retry", &retry)],
        );

        let (sink, events) = mpsc::unbounded_channel();
        let handle = self.transport.subscribe(&self.topic, &self.bindings, sink)?;

        let stale = {
            let mut state = self.state();
            if state.closed {
                Some(handle)
            } else {
                state.handle = Some(handle);
                None
            }
        };
        if let Some(handle) = stale {
            self.transport.unsubscribe(&handle);
        }
        Ok(events)
    }

    fn close(&self, task: &AbortHandle) {
        let handle = {
            let mut state = self.state();
            if state.closed {
                return;
            }
            state.closed = true;
            state.heartbeat_active = false;
            state.observers.clear();
            state.failure_observers.clear();
            state.status = ConnectionStatus::Disconnected;
            state.handle.take()
        };
        if let Some(handle) = handle {
            self.transport.unsubscribe(&handle);
        }
        task.abort();
        self.status_tx.send_replace(ConnectionStatus::Disconnected);
        log_event_with_fields(Event::ChannelCleanup, &[("topic", &self.topic)]);
    }

    /// Record the terminal failure and tell failure observers, then
    /// publish `Error`. Failure observers run before status observers.
    fn fail(&self, error: ConnectionError) {
        let observers: Vec<FailureCallback> = {
            let mut state = self.state();
            if state.closed {
                return;
            }
            state.failure = Some(error.clone());
            state
                .failure_observers
                .iter()
                .map(|(_, cb)| Arc::clone(cb))
                .collect()
        };
        for observer in observers {
            observer(&error);
        }
        self.set_status(ConnectionStatus::Error);
    }

    fn connected_handle(&self) -> ConnectionResult<SubscriptionHandle> {
        let state = self.state();
        if state.closed {
            return Err(ConnectionError::Closed);
        }
        match (&state.handle, state.status) {
            (Some(handle), ConnectionStatus::Connected) => Ok(handle.clone()),
            _ => Err(ConnectionError::NotConnected),
        }
    }
}

/// Supervisor task state; owns every timer of the session
struct Supervisor {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    out: mpsc::UnboundedSender<ChannelEvent>,
    retry_at: Option<Instant>,
    heartbeat: Option<Interval>,
    paused: bool,
    rng: StdRng,
}

enum Wake {
    Command(Option<Command>),
    Transport(Option<TransportEvent>),
    Retry,
    Heartbeat,
}

async fn next_event(events: &mut Option<mpsc::UnboundedReceiver<TransportEvent>>) -> Option<TransportEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => pending().await,
    }
}

async fn tick_opt(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}

impl Supervisor {
    async fn run(mut self) {
        loop {
            let wake = tokio::select! {
                biased;
                command = self.commands.recv() => Wake::Command(command),
                event = next_event(&mut self.events) => Wake::Transport(event),
                _ = sleep_until_opt(self.retry_at) => Wake::Retry,
                _ = tick_opt(&mut self.heartbeat) => Wake::Heartbeat,
            };

            match wake {
                Wake::Command(None) => break,
                Wake::Command(Some(command)) => self.handle_command(command),
                Wake::Transport(Some(event)) => self.handle_event(event),
                Wake::Transport(None) => {
                    // Transport dropped the sink without a status
                    self.events = None;
                    self.on_failure(Failure::Closed);
                }
                Wake::Retry => {
                    self.retry_at = None;
                    self.attempt();
                }
                Wake::Heartbeat => self.send_heartbeat(),
            }

            if self.shared.is_closed() {
                break;
            }
        }
    }

    fn attempt(&mut self) {
        self.heartbeat = None;
        self.events = None;
        match self.shared.open() {
            Ok(events) => self.events = Some(events),
            Err(e) => self.on_failure(Failure::Rejected(e.to_string())),
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Pause => {
                if self.paused {
                    return;
                }
                self.paused = true;
                self.retry_at = None;
                self.heartbeat = None;
                self.events = None;
                self.shared.teardown_handle();
                self.shared.set_status(ConnectionStatus::Paused);
                log_event_with_fields(Event::ChannelPaused, &[("topic", &self.shared.topic)]);
            }
            Command::Resume => {
                if !self.paused {
                    return;
                }
                self.paused = false;
                log_event_with_fields(Event::ChannelResumed, &[("topic", &self.shared.topic)]);
                self.attempt();
            }
            Command::Reconnect => {
                self.paused = false;
                self.retry_at = None;
                {
                    let mut state = self.shared.state();
                    state.retry_count = 0;
                    state.failure = None;
                }
                self.attempt();
            }
        }
    }

    fn handle_event(&mut self, event: TransportEvent) {
        if !self.shared.bindings.wants(&event) {
            return;
        }
        let forwarded = match event {
            TransportEvent::Status(status) => {
                self.handle_status(status);
                return;
            }
            TransportEvent::Broadcast { event, payload } => ChannelEvent::Broadcast { event, payload },
            TransportEvent::Change(record) => ChannelEvent::Change(record),
            TransportEvent::PresenceSync(records) => ChannelEvent::PresenceSync(records),
        };
        // The owner may have stopped listening; that is its choice.
        let _ = self.out.send(forwarded);
    }

    fn handle_status(&mut self, status: SubscribeStatus) {
        match status {
            SubscribeStatus::Subscribed => self.on_connected(),
            SubscribeStatus::ChannelError(reason) => self.on_failure(Failure::ChannelError(reason)),
            SubscribeStatus::TimedOut => self.on_failure(Failure::TimedOut),
            SubscribeStatus::Closed => self.on_failure(Failure::Closed),
        }
    }

    fn on_connected(&mut self) {
        if self.paused {
            return;
        }
        let period = self.shared.options.heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.heartbeat = Some(heartbeat);
        self.retry_at = None;
        {
            let mut state = self.shared.state();
            state.retry_count = 0;
            state.failure = None;
            state.heartbeat_active = true;
        }
        self.shared.set_status(ConnectionStatus::Connected);
        log_event_with_fields(Event::ChannelConnected, &[("topic", &self.shared.topic)]);
    }

    fn on_failure(&mut self, failure: Failure) {
        if self.paused || self.shared.is_closed() {
            return;
        }
        self.events = None;
        self.heartbeat = None;
        self.shared.teardown_handle();

        let topic = self.shared.topic.clone();
        let (event, status, reason) = match failure {
            Failure::ChannelError(reason) => (Event::ChannelError, ConnectionStatus::Error, reason),
            Failure::TimedOut => (Event::ChannelTimedOut, ConnectionStatus::Error, "timed out".to_string()),
            Failure::Closed => (Event::ChannelClosed, ConnectionStatus::Disconnected, "closed".to_string()),
            Failure::Rejected(reason) => (Event::ChannelError, ConnectionStatus::Error, reason),
        };
        log_event_with_fields(event, &[("topic", &topic), ("reason", &reason)]);

        let backoff = self.shared.options.backoff;
        let retry_count = self.shared.state().retry_count;

        if retry_count >= backoff.max_retries {
            self.retry_at = None;
            self.shared.metrics.increment_retries_exhausted();
            let attempts = retry_count.to_string();
            log_event_with_fields(
                Event::RetriesExhausted,
                &[("topic", &topic), ("attempts", &attempts)],
            );
            self.shared.fail(ConnectionError::RetriesExhausted {
                attempts: retry_count,
            });
            return;
        }

        let delay = backoff.delay(retry_count, &mut self.rng);
        self.shared.state().retry_count = retry_count + 1;
        self.retry_at = Some(Instant::now() + delay);
        self.shared.metrics.increment_reconnects_scheduled();

        let attempt = (retry_count + 1).to_string();
        let delay_ms = delay.as_millis().to_string();
        log_event_with_fields(
            Event::ReconnectScheduled,
            &[("topic", &topic), ("attempt", &attempt), ("delay_ms", &delay_ms)],
        );
        self.shared.set_status(status);
    }

    fn send_heartbeat(&mut self) {
        let Ok(handle) = self.shared.connected_handle() else {
            return;
        };
        let payload = json!({ "ts": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true) });
        match self.shared.transport.send(&handle, HEARTBEAT_EVENT, payload) {
            Ok(()) => self.shared.metrics.increment_heartbeats(),
            Err(e) => {
                let reason = e.to_string();
                log_event_with_fields(
                    Event::HeartbeatFailed,
                    &[("topic", &self.shared.topic), ("reason", &reason)],
                );
            }
        }
    }
}

/// Supervised subscription to one topic
pub struct ConnectionManager {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl ConnectionManager {
    /// Open a subscription and start supervising it.
    ///
    /// Returns the manager and the stream of bound events. Must be called
    /// inside a tokio runtime.
    pub fn subscribe(
        transport: Arc<dyn Transport>,
        topic: impl Into<String>,
        bindings: ChannelBindings,
        options: ConnectionOptions,
        metrics: Arc<MetricsRegistry>,
    ) -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        let shared = Arc::new(Shared {
            topic: topic.into(),
            transport,
            bindings,
            options,
            metrics,
            state: Mutex::new(SessionState {
                status: ConnectionStatus::Disconnected,
                retry_count: 0,
                handle: None,
                observers: Vec::new(),
                failure_observers: Vec::new(),
                next_observer: 0,
                heartbeat_active: false,
                failure: None,
                closed: false,
            }),
            status_tx,
        });

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (out, events_out) = mpsc::unbounded_channel();

        let mut supervisor = Supervisor {
            shared: Arc::clone(&shared),
            commands: command_rx,
            events: None,
            out,
            retry_at: None,
            heartbeat: None,
            paused: false,
            rng: StdRng::from_entropy(),
        };
        supervisor.attempt();

        let task = tokio::spawn(supervisor.run());
        (
            Self {
                shared,
                commands,
                task,
            },
            events_out,
        )
    }

    pub fn topic(&self) -> &str {
        &self.shared.topic
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.state().status
    }

    pub fn retry_count(&self) -> u32 {
        self.shared.state().retry_count
    }

    pub fn heartbeat_active(&self) -> bool {
        self.shared.state().heartbeat_active
    }

    /// Terminal failure, once retries are exhausted
    pub fn failure(&self) -> Option<ConnectionError> {
        self.shared.state().failure.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Register a status observer. It is invoked immediately with the
    /// current status, then on every transition.
    pub fn on_status(&self, callback: impl Fn(ConnectionStatus) + Send + Sync + 'static) -> ObserverId {
        let callback: StatusCallback = Arc::new(callback);
        let (id, current, closed) = {
            let mut state = self.shared.state();
            let id = ObserverId(state.next_observer);
            state.next_observer += 1;
            if !state.closed {
                state.observers.push((id, Arc::clone(&callback)));
            }
            (id, state.status, state.closed)
        };
        if !closed {
            callback(current);
        }
        id
    }

    /// Register a terminal failure observer. It fires once each time
    /// retries run out, and immediately if the session has already failed.
    /// A transient `Error` status never reaches it.
    pub fn on_failure(
        &self,
        callback: impl Fn(&ConnectionError) + Send + Sync + 'static,
    ) -> ObserverId {
        let callback: FailureCallback = Arc::new(callback);
        let (id, current) = {
            let mut state = self.shared.state();
            let id = ObserverId(state.next_observer);
            state.next_observer += 1;
            if state.closed {
                return id;
            }
            state.failure_observers.push((id, Arc::clone(&callback)));
            (id, state.failure.clone())
        };
        if let Some(error) = current {
            callback(&error);
        }
        id
    }

    pub fn remove_observer(&self, id: ObserverId) {
        let mut state = self.shared.state();
        state.observers.retain(|(oid, _)| *oid != id);
        state.failure_observers.retain(|(oid, _)| *oid != id);
    }

    /// Status as a watch channel; `borrow()` always holds current truth
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status_tx.subscribe()
    }

    /// Tear down the live subscription without touching the retry count
    pub fn pause(&self) {
        let _ = self.commands.send(Command::Pause);
    }

    /// Fresh subscribe attempt if paused
    pub fn resume(&self) {
        let _ = self.commands.send(Command::Resume);
    }

    /// Manual reconnect: clears terminal failure and retry count
    pub fn reconnect(&self) {
        let _ = self.commands.send(Command::Reconnect);
    }

    /// Broadcast on the topic; only while connected
    pub fn send(&self, event: &str, payload: Value) -> ConnectionResult<()> {
        let handle = self.shared.connected_handle()?;
        self.shared.transport.send(&handle, event, payload)?;
        Ok(())
    }

    /// Publish local presence on the topic; only while connected
    pub fn track_presence(&self, record: &PresenceRecord) -> ConnectionResult<()> {
        let handle = self.shared.connected_handle()?;
        self.shared.transport.track_presence(&handle, record)?;
        Ok(())
    }

    /// Stop every timer, detach the transport subscription and drop all
    /// observers. Safe to call repeatedly and from any status.
    pub fn cleanup(&self) {
        self.shared.close(&self.task.abort_handle());
    }

    /// Control handle usable without owning the manager
    pub fn control(&self) -> ConnectionControl {
        ConnectionControl {
            shared: Arc::downgrade(&self.shared),
            commands: self.commands.clone(),
            task: self.task.abort_handle(),
        }
    }
}

/// Drives a session from outside its owner. Every method is a no-op once
/// the session is gone.
#[derive(Clone)]
pub struct ConnectionControl {
    shared: Weak<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    task: AbortHandle,
}

impl ConnectionControl {
    pub fn status(&self) -> Option<ConnectionStatus> {
        let shared = self.shared.upgrade()?;
        let state = shared.state();
        (!state.closed).then_some(state.status)
    }

    pub fn failure(&self) -> Option<ConnectionError> {
        let shared = self.shared.upgrade()?;
        let state = shared.state();
        if state.closed {
            return None;
        }
        state.failure.clone()
    }

    pub fn pause(&self) {
        let _ = self.commands.send(Command::Pause);
    }

    pub fn resume(&self) {
        let _ = self.commands.send(Command::Resume);
    }

    pub fn reconnect(&self) {
        let _ = self.commands.send(Command::Reconnect);
    }

    /// Same as `ConnectionManager::cleanup`
    pub fn close(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.close(&self.task);
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    fn options(max_retries: u32) -> ConnectionOptions {
        ConnectionOptions {
            backoff: BackoffConfig {
                initial_delay_ms: 100,
                multiplier: 2.0,
                max_delay_ms: 1_000,
                max_retries,
                jitter_ratio: 0.0,
            },
            heartbeat_interval: Duration::from_secs(30),
        }
    }

    fn open(
        transport: &Arc<MemoryTransport>,
        max_retries: u32,
    ) -> (ConnectionManager, mpsc::UnboundedReceiver<ChannelEvent>) {
        ConnectionManager::subscribe(
            transport.clone(),
            "room:1",
            ChannelBindings::new().broadcast("new_message"),
            options(max_retries),
            Arc::new(MetricsRegistry::new()),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_connects_and_starts_heartbeat() {
        let transport = Arc::new(MemoryTransport::manual());
        let (manager, _events) = open(&transport, 3);
        assert_eq!(manager.status(), ConnectionStatus::Connecting);

        transport.confirm("room:1");
        settle().await;

        assert_eq!(manager.status(), ConnectionStatus::Connected);
        assert!(manager.heartbeat_active());

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(transport.sent_count("room:1", HEARTBEAT_EVENT), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_schedules_backoff_then_recovers() {
        let transport = Arc::new(MemoryTransport::manual());
        let (manager, _events) = open(&transport, 3);

        transport.fail("room:1", "boom");
        settle().await;
        assert_eq!(manager.status(), ConnectionStatus::Error);
        assert_eq!(manager.retry_count(), 1);
        assert_eq!(transport.live_count("room:1"), 0);

        tokio::time::sleep(Duration::from_millis(99)).await;
        assert_eq!(transport.subscribe_count("room:1"), 1);
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(transport.subscribe_count("room:1"), 2);
        assert_eq!(manager.status(), ConnectionStatus::Connecting);

        transport.confirm("room:1");
        settle().await;
        assert_eq!(manager.status(), ConnectionStatus::Connected);
        assert_eq!(manager.retry_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_is_terminal() {
        let transport = Arc::new(MemoryTransport::manual());
        transport.script("room:1", vec![SubscribeStatus::TimedOut; 3]);
        let (manager, _events) = open(&transport, 2);

        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(manager.status(), ConnectionStatus::Error);
        assert_eq!(
            manager.failure(),
            Some(ConnectionError::RetriesExhausted { attempts: 2 })
        );
        assert_eq!(transport.subscribe_count("room:1"), 3);

        // No further automatic attempts
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.subscribe_count("room:1"), 3);

        manager.reconnect();
        settle().await;
        transport.confirm("room:1");
        settle().await;
        assert_eq!(manager.status(), ConnectionStatus::Connected);
        assert_eq!(manager.failure(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_observer_fires_only_when_terminal() {
        let transport = Arc::new(MemoryTransport::manual());
        transport.script("room:1", vec![SubscribeStatus::TimedOut; 3]);
        let (manager, _events) = open(&transport, 2);

        let failures = Arc::new(Mutex::new(Vec::new()));
        let sink = failures.clone();
        manager.on_failure(move |e| sink.lock().unwrap().push(e.clone()));

        // First timeout is transient: status is Error, but no failure yet
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(manager.status(), ConnectionStatus::Error);
        assert!(failures.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(
            *failures.lock().unwrap(),
            vec![ConnectionError::RetriesExhausted { attempts: 2 }]
        );

        // Late observers see the standing failure at once
        let late = Arc::new(Mutex::new(0));
        let count = late.clone();
        manager.on_failure(move |_| *count.lock().unwrap() += 1);
        assert_eq!(*late.lock().unwrap(), 1);

        // A recovered session does not replay the old failure
        manager.reconnect();
        settle().await;
        transport.confirm("room:1");
        settle().await;
        assert_eq!(manager.status(), ConnectionStatus::Connected);
        let fresh = Arc::new(Mutex::new(0));
        let count = fresh.clone();
        manager.on_failure(move |_| *count.lock().unwrap() += 1);
        assert_eq!(*fresh.lock().unwrap(), 0);
        assert_eq!(failures.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_and_resume() {
        let transport = Arc::new(MemoryTransport::new());
        let (manager, _events) = open(&transport, 3);
        settle().await;
        assert_eq!(manager.status(), ConnectionStatus::Connected);

        manager.pause();
        settle().await;
        assert_eq!(manager.status(), ConnectionStatus::Paused);
        assert_eq!(transport.live_count("room:1"), 0);
        assert!(!manager.heartbeat_active());

        manager.resume();
        settle().await;
        assert_eq!(manager.status(), ConnectionStatus::Connected);
        assert_eq!(transport.live_count("room:1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_observer_replays_current_status() {
        let transport = Arc::new(MemoryTransport::new());
        let (manager, _events) = open(&transport, 3);
        settle().await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        manager.on_status(move |status| sink.lock().unwrap().push(status));
        assert_eq!(*seen.lock().unwrap(), vec![ConnectionStatus::Connected]);

        transport.close("room:1");
        settle().await;
        assert_eq!(
            *seen.lock().unwrap(),
            vec![ConnectionStatus::Connected, ConnectionStatus::Disconnected]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_forwards_only_bound_events() {
        let transport = Arc::new(MemoryTransport::new());
        let (_manager, mut events) = open(&transport, 3);
        settle().await;

        transport.broadcast("room:1", "new_message", json!({"id": "m-1"}));
        transport.broadcast("room:1", "unrelated", json!({"id": "x"}));
        settle().await;

        assert_eq!(
            events.try_recv().unwrap(),
            ChannelEvent::Broadcast {
                event: "new_message".to_string(),
                payload: json!({"id": "m-1"})
            }
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_is_idempotent_mid_backoff() {
        let transport = Arc::new(MemoryTransport::manual());
        let (manager, _events) = open(&transport, 5);
        transport.fail("room:1", "boom");
        settle().await;

        manager.cleanup();
        manager.cleanup();
        assert!(manager.is_closed());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.subscribe_count("room:1"), 1);
        assert_eq!(transport.live_count("room:1"), 0);
        assert_eq!(manager.send("x", json!({})), Err(ConnectionError::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_requires_connection() {
        let transport = Arc::new(MemoryTransport::manual());
        let (manager, _events) = open(&transport, 3);
        assert_eq!(
            manager.send("new_message", json!({})),
            Err(ConnectionError::NotConnected)
        );

        transport.confirm("room:1");
        settle().await;
        assert!(manager.send("new_message", json!({})).is_ok());
    }
}
