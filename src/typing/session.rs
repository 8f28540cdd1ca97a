//! # Typing Session
//!
//! Per-conversation view of who is typing, plus the local user's outbound
//! typing signal.
//!
//! Remote side, per `(conversation, user)`: `Idle -> Typing -> Idle`.
//! Every admitted `typing=true` (re)arms an expiry timer; `typing=false`
//! or the timer firing returns the user to idle.
//!
//! Local side: `start_typing` sends `typing=true` once per idle period and
//! arms an auto-stop timer; `stop_typing` sends `typing=false`. Every send
//! passes through the rate limiter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use crate::connection::{ChannelEvent, ConnectionManager};
use crate::observability::{log_event_with_fields, Event, MetricsRegistry};
use crate::ratelimit::{RateLimiterRegistry, ACTION_TYPING};

/// Broadcast event name carrying typing signals
pub const TYPING_EVENT: &str = "typing";

/// Default expiry of a remote typing entry and of the local auto-stop
pub const DEFAULT_TYPING_TIMEOUT: Duration = Duration::from_millis(3_000);

/// One user shown as typing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypingUser {
    pub user_id: String,
    /// Display info sent along with the signal (name, avatar, ...)
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub display: Value,
}

impl TypingUser {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display: Value::Null,
        }
    }

    pub fn with_display(mut self, display: Value) -> Self {
        self.display = display;
        self
    }
}

/// Typing-set observer; receives the full set, sorted by user id
pub type TypingCallback = Arc<dyn Fn(Vec<TypingUser>) + Send + Sync>;

struct RemoteEntry {
    display: Value,
    generation: u64,
    expiry: JoinHandle<()>,
}

#[derive(Default)]
struct TypingState {
    remote: HashMap<String, RemoteEntry>,
    local_typing: bool,
    local_generation: u64,
    auto_stop: Option<JoinHandle<()>>,
    listener: Option<JoinHandle<()>>,
    closed: bool,
}

struct Inner {
    conversation_id: String,
    local: TypingUser,
    timeout: Duration,
    connection: ConnectionManager,
    limiter: Arc<RateLimiterRegistry>,
    metrics: Arc<MetricsRegistry>,
    on_change: TypingCallback,
    generations: AtomicU64,
    state: Mutex<TypingState>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, TypingState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn snapshot(state: &TypingState) -> Vec<TypingUser> {
        let mut users: Vec<TypingUser> = state
            .remote
            .iter()
            .map(|(user_id, entry)| TypingUser {
                user_id: user_id.clone(),
                display: entry.display.clone(),
            })
            .collect();
        users.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        users
    }

    fn on_event(self: &Arc<Self>, event: ChannelEvent) {
        if let ChannelEvent::Broadcast { event, payload } = event {
            if event == TYPING_EVENT {
                self.on_broadcast(&payload);
            }
        }
    }

    fn on_broadcast(self: &Arc<Self>, payload: &Value) {
        let Some(user_id) = payload.get("user_id").and_then(Value::as_str) else {
            log_event_with_fields(Event::NotificationMalformed, &[("topic", &self.conversation_id)]);
            return;
        };
        // Our own signal echoed back by some transports
        if user_id == self.local.user_id {
            return;
        }
        let Some(typing) = payload.get("typing").and_then(Value::as_bool) else {
            log_event_with_fields(Event::NotificationMalformed, &[("topic", &self.conversation_id)]);
            return;
        };

        if typing {
            let sender_key = format!("{}@{}", self.conversation_id, user_id);
            if !self.limiter.admit(&sender_key, ACTION_TYPING) {
                return;
            }
            let display = payload.get("display").cloned().unwrap_or(Value::Null);
            self.mark_typing(user_id, display);
        } else {
            self.mark_idle(user_id);
        }
    }

    fn mark_typing(self: &Arc<Self>, user_id: &str, display: Value) {
        let snapshot = {
            let mut state = self.state();
            if state.closed {
                return;
            }
            let generation = self.next_generation();
            let expiry = self.arm_expiry(user_id.to_string(), generation);
            let previous = state.remote.insert(
                user_id.to_string(),
                RemoteEntry {
                    display: display.clone(),
                    generation,
                    expiry,
                },
            );
            match previous {
                Some(entry) => {
                    entry.expiry.abort();
                    if entry.display == display {
                        None
                    } else {
                        Some(Self::snapshot(&state))
                    }
                }
                None => Some(Self::snapshot(&state)),
            }
        };

        if let Some(users) = snapshot {
            (self.on_change)(users);
        }
    }

    fn mark_idle(&self, user_id: &str) {
        let snapshot = {
            let mut state = self.state();
            match state.remote.remove(user_id) {
                Some(entry) => {
                    entry.expiry.abort();
                    Self::snapshot(&state)
                }
                None => return,
            }
        };
        (self.on_change)(snapshot);
    }

    fn arm_expiry(self: &Arc<Self>, user_id: String, generation: u64) -> JoinHandle<()> {
        let deadline = Instant::now() + self.timeout;
        let weak: Weak<Inner> = Arc::downgrade(self);
        tokio::spawn(async move {
            sleep_until(deadline).await;
            if let Some(inner) = weak.upgrade() {
                inner.expire(&user_id, generation);
            }
        })
    }

    fn expire(&self, user_id: &str, generation: u64) {
        let snapshot = {
            let mut state = self.state();
            let current = state.remote.get(user_id).map(|entry| entry.generation);
            if current != Some(generation) {
                return;
            }
            state.remote.remove(user_id);
            Self::snapshot(&state)
        };
        self.metrics.increment_typing_expirations();
        log_event_with_fields(
            Event::TypingExpired,
            &[("topic", &self.conversation_id), ("user_id", user_id)],
        );
        (self.on_change)(snapshot);
    }

    /// Rate-limited outbound signal; false if dropped or not sent
    fn send_signal(&self, typing: bool) -> bool {
        if !self.limiter.admit(&self.conversation_id, ACTION_TYPING) {
            return false;
        }
        let payload = json!({
            "user_id": self.local.user_id,
            "typing": typing,
            "display": self.local.display,
        });
        self.connection.send(TYPING_EVENT, payload).is_ok()
    }

    fn start_typing(self: &Arc<Self>) {
        let already_typing = {
            let state = self.state();
            if state.closed {
                return;
            }
            state.local_typing
        };

        if !already_typing && !self.send_signal(true) {
            return;
        }

        let generation = self.next_generation();
        let deadline = Instant::now() + self.timeout;
        let weak = Arc::downgrade(self);
        let auto_stop = tokio::spawn(async move {
            sleep_until(deadline).await;
            if let Some(inner) = weak.upgrade() {
                inner.auto_stop(generation);
            }
        });

        let mut state = self.state();
        if state.closed {
            auto_stop.abort();
            return;
        }
        state.local_typing = true;
        state.local_generation = generation;
        if let Some(previous) = state.auto_stop.replace(auto_stop) {
            previous.abort();
        }
    }

    fn auto_stop(&self, generation: u64) {
        {
            let mut state = self.state();
            if !state.local_typing || state.local_generation != generation {
                return;
            }
            state.local_typing = false;
            state.auto_stop = None;
        }
        self.send_signal(false);
    }

    fn stop_typing(&self) {
        {
            let mut state = self.state();
            if state.closed || !state.local_typing {
                return;
            }
            state.local_typing = false;
            if let Some(timer) = state.auto_stop.take() {
                timer.abort();
            }
        }
        self.send_signal(false);
    }

    fn cleanup(&self) {
        let (remote, auto_stop, listener) = {
            let mut state = self.state();
            if state.closed {
                return;
            }
            state.closed = true;
            state.local_typing = false;
            (
                std::mem::take(&mut state.remote),
                state.auto_stop.take(),
                state.listener.take(),
            )
        };
        for entry in remote.into_values() {
            entry.expiry.abort();
        }
        if let Some(timer) = auto_stop {
            timer.abort();
        }
        if let Some(listener) = listener {
            listener.abort();
        }
        self.connection.cleanup();
    }
}

/// Typing state for one conversation
pub struct TypingSession {
    inner: Arc<Inner>,
}

impl TypingSession {
    /// Start tracking typing on `connection`, whose bound events arrive on
    /// `events`. The connection must bind the `typing` broadcast.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        conversation_id: impl Into<String>,
        local: TypingUser,
        timeout: Duration,
        connection: ConnectionManager,
        mut events: mpsc::UnboundedReceiver<ChannelEvent>,
        limiter: Arc<RateLimiterRegistry>,
        metrics: Arc<MetricsRegistry>,
        on_change: impl Fn(Vec<TypingUser>) + Send + Sync + 'static,
    ) -> Self {
        let inner = Arc::new(Inner {
            conversation_id: conversation_id.into(),
            local,
            timeout,
            connection,
            limiter,
            metrics,
            on_change: Arc::new(on_change),
            generations: AtomicU64::new(0),
            state: Mutex::new(TypingState::default()),
        });

        let weak = Arc::downgrade(&inner);
        let listener = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                inner.on_event(event);
            }
        });
        inner.state().listener = Some(listener);

        Self { inner }
    }

    pub fn conversation_id(&self) -> &str {
        &self.inner.conversation_id
    }

    /// Feed one inbound `typing` broadcast payload
    pub fn on_broadcast(&self, payload: &Value) {
        self.inner.on_broadcast(payload);
    }

    /// Signal local typing; call on every keystroke
    pub fn start_typing(&self) {
        self.inner.start_typing();
    }

    pub fn stop_typing(&self) {
        self.inner.stop_typing();
    }

    pub fn is_typing_locally(&self) -> bool {
        self.inner.state().local_typing
    }

    /// Remote users currently typing, sorted by user id
    pub fn typing_users(&self) -> Vec<TypingUser> {
        Inner::snapshot(&self.inner.state())
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.inner.connection
    }

    /// Cancel every timer and tear down the channel. Idempotent.
    pub fn cleanup(&self) {
        self.inner.cleanup();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state().closed
    }
}

impl Drop for TypingSession {
    fn drop(&mut self) {
        self.inner.cleanup();
    }
}
