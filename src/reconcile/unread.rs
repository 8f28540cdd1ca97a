//! # Unread Reconciliation Loop
//!
//! Refreshes unread counts on a fixed interval regardless of push-path
//! health, immediately after a reconnect, and (debounced) whenever the push
//! path reports new messages. The poll bounds staleness to one interval
//! even if every push is lost.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::coalesce::Debouncer;
use crate::connection::{ConnectionManager, ConnectionStatus, ObserverId};
use crate::observability::{log_event_with_fields, Event, MetricsRegistry};
use crate::store::{UnreadCounts, UnreadSource};

/// Why a refresh ran
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefreshReason {
    /// First refresh when the loop starts
    Initial,
    /// Polling interval elapsed
    Poll,
    /// Channel came back after being down
    Reconnect,
    /// Push path reported new messages
    Push,
    /// Requested by the application
    Manual,
}

impl RefreshReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshReason::Initial => "initial",
            RefreshReason::Poll => "poll",
            RefreshReason::Reconnect => "reconnect",
            RefreshReason::Push => "push",
            RefreshReason::Manual => "manual",
        }
    }
}

impl fmt::Display for RefreshReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Loop timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnreadOptions {
    pub poll_interval: Duration,
    pub push_debounce: Duration,
    pub push_max_wait: Duration,
}

impl Default for UnreadOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            push_debounce: Duration::from_millis(250),
            push_max_wait: Duration::from_millis(1_000),
        }
    }
}

/// Unread-count observer
pub type UnreadCallback = Arc<dyn Fn(UnreadCounts) + Send + Sync>;

struct Refresher {
    user_id: String,
    source: Arc<dyn UnreadSource>,
    metrics: Arc<MetricsRegistry>,
    on_change: UnreadCallback,
}

impl Refresher {
    async fn refresh(&self, reason: RefreshReason) {
        let reason_str = reason.as_str();
        match self.source.unread_counts(&self.user_id).await {
            Ok(counts) => {
                self.metrics.increment_unread_refreshes();
                let total = counts.total().to_string();
                log_event_with_fields(
                    Event::UnreadRefreshed,
                    &[("user_id", &self.user_id), ("reason", reason_str), ("total", &total)],
                );
                (self.on_change)(counts);
            }
            Err(e) => {
                // The next poll retries; counts stay as last reported.
                self.metrics.increment_unread_refresh_failures();
                let error = e.to_string();
                log_event_with_fields(
                    Event::UnreadRefreshFailed,
                    &[("user_id", &self.user_id), ("reason", reason_str), ("error", &error)],
                );
            }
        }
    }
}

/// Tracks whether a `Connected` status is a reconnect
#[derive(Debug, Default)]
struct ReconnectDetector {
    seen_connected: bool,
    was_down: bool,
}

impl ReconnectDetector {
    /// True when `status` is `Connected` after a down status that followed
    /// an earlier connect
    fn observe(&mut self, status: ConnectionStatus) -> bool {
        match status {
            ConnectionStatus::Connected => {
                let reconnected = self.seen_connected && self.was_down;
                self.seen_connected = true;
                self.was_down = false;
                reconnected
            }
            status if status.is_down() => {
                self.was_down = true;
                false
            }
            _ => false,
        }
    }
}

async fn run(
    refresher: Refresher,
    poll_interval: Duration,
    mut requests: mpsc::UnboundedReceiver<RefreshReason>,
    mut statuses: mpsc::UnboundedReceiver<ConnectionStatus>,
) {
    refresher.refresh(RefreshReason::Initial).await;

    let mut ticker = interval_at(Instant::now() + poll_interval, poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut detector = ReconnectDetector::default();

    loop {
        tokio::select! {
            _ = ticker.tick() => refresher.refresh(RefreshReason::Poll).await,
            request = requests.recv() => match request {
                Some(reason) => refresher.refresh(reason).await,
                None => break,
            },
            Some(status) = statuses.recv() => {
                if detector.observe(status) {
                    refresher.refresh(RefreshReason::Reconnect).await;
                }
            }
        }
    }
}

/// Background loop keeping one user's unread counts fresh
pub struct UnreadReconciler {
    requests: mpsc::UnboundedSender<RefreshReason>,
    statuses: mpsc::UnboundedSender<ConnectionStatus>,
    push: Debouncer<()>,
    task: JoinHandle<()>,
    closed: AtomicBool,
}

impl UnreadReconciler {
    /// Start the loop; the initial refresh runs right away.
    pub fn start(
        user_id: impl Into<String>,
        source: Arc<dyn UnreadSource>,
        options: UnreadOptions,
        metrics: Arc<MetricsRegistry>,
        on_change: impl Fn(UnreadCounts) + Send + Sync + 'static,
    ) -> Self {
        let (requests, request_rx) = mpsc::unbounded_channel();
        let (statuses, status_rx) = mpsc::unbounded_channel();

        let refresher = Refresher {
            user_id: user_id.into(),
            source,
            metrics,
            on_change: Arc::new(on_change),
        };
        let task = tokio::spawn(run(refresher, options.poll_interval, request_rx, status_rx));

        let push_requests = requests.clone();
        let push = Debouncer::new(options.push_debounce, Some(options.push_max_wait), move |()| {
            let _ = push_requests.send(RefreshReason::Push);
        });

        Self {
            requests,
            statuses,
            push,
            task,
            closed: AtomicBool::new(false),
        }
    }

    /// Push path saw a new message for this user
    pub fn notify_push(&self) {
        self.push.call(());
    }

    /// Refresh right away
    pub fn refresh_now(&self) {
        let _ = self.requests.send(RefreshReason::Manual);
    }

    /// Feed one connection status; `Connected` after a down status forces
    /// a refresh
    pub fn on_connection_status(&self, status: ConnectionStatus) {
        let _ = self.statuses.send(status);
    }

    /// Follow `connection`'s status transitions
    pub fn watch_connection(&self, connection: &ConnectionManager) -> ObserverId {
        let statuses = self.statuses.clone();
        connection.on_status(move |status| {
            let _ = statuses.send(status);
        })
    }

    /// Stop polling and drop pending push refreshes. Idempotent.
    pub fn cleanup(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.push.cancel();
        self.task.abort();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for UnreadReconciler {
    fn drop(&mut self) {
        self.cleanup();
    }
}
