//! Presence publisher and observer for one topic

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::record::{PresenceRecord, PresenceStatus};
use crate::coalesce::Throttler;
use crate::connection::{ChannelEvent, ConnectionManager, ConnectionStatus};
use crate::observability::{log_event_with_fields, Event};
use crate::ratelimit::{RateLimiterRegistry, ACTION_PRESENCE};

/// Users on a topic keyed by user id; `status` is the effective status
pub type PresenceMap = BTreeMap<String, PresenceRecord>;

/// Presence-map observer
pub type PresenceCallback = Arc<dyn Fn(PresenceMap) + Send + Sync>;

/// Presence settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceOptions {
    /// Coalescing interval for sync bursts
    pub throttle: Duration,
    /// Records not refreshed for this long read as offline
    pub stale_after: Duration,
}

impl Default for PresenceOptions {
    fn default() -> Self {
        Self {
            throttle: Duration::from_millis(500),
            stale_after: Duration::from_secs(60),
        }
    }
}

struct ObserverState {
    local: Option<PresenceRecord>,
    latest: Vec<PresenceRecord>,
    listener: Option<JoinHandle<()>>,
    refresher: Option<JoinHandle<()>>,
    closed: bool,
}

struct Inner {
    topic: String,
    connection: ConnectionManager,
    limiter: Arc<RateLimiterRegistry>,
    stale_after: chrono::Duration,
    on_change: PresenceCallback,
    syncs: Throttler<Vec<PresenceRecord>>,
    state: Mutex<ObserverState>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, ObserverState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn effective(&self, records: &[PresenceRecord]) -> PresenceMap {
        let now = Utc::now();
        records
            .iter()
            .map(|record| {
                let mut shown = record.clone();
                shown.status = record.effective_status(self.stale_after, now);
                (shown.user_id.clone(), shown)
            })
            .collect()
    }

    fn publish(&self, records: Vec<PresenceRecord>) {
        let map = {
            let mut state = self.state();
            if state.closed {
                return;
            }
            let map = self.effective(&records);
            state.latest = records;
            map
        };
        (self.on_change)(map);
    }

    /// Publish the local record, if any, through the limiter
    fn track(&self) {
        let record = {
            let state = self.state();
            if state.closed {
                return;
            }
            match &state.local {
                Some(record) => record.clone(),
                None => return,
            }
        };
        if !self.limiter.admit(&self.topic, ACTION_PRESENCE) {
            return;
        }
        self.send(&record);
    }

    /// Keepalive: re-stamp and re-send the local record while connected so
    /// peers never see it go stale. Runs at a fixed rate, so it skips the
    /// limiter.
    fn refresh(&self) {
        if self.connection.status() != ConnectionStatus::Connected {
            return;
        }
        let record = {
            let mut state = self.state();
            if state.closed {
                return;
            }
            match state.local.as_mut() {
                Some(record) => {
                    record.touch();
                    record.clone()
                }
                None => return,
            }
        };
        self.send(&record);
    }

    fn send(&self, record: &PresenceRecord) {
        if let Err(e) = self.connection.track_presence(record) {
            let reason = e.to_string();
            log_event_with_fields(
                Event::PresenceTrackFailed,
                &[("topic", &self.topic), ("reason", &reason)],
            );
        }
    }
}

/// Publishes local presence and reports the topic's presence map
pub struct PresenceObserver {
    inner: Arc<Inner>,
}

impl PresenceObserver {
    /// Observe presence on `connection`, which must bind presence syncs.
    /// With a `local` record, it is tracked on every (re)connect.
    pub fn new(
        topic: impl Into<String>,
        local: Option<PresenceRecord>,
        connection: ConnectionManager,
        mut events: mpsc::UnboundedReceiver<ChannelEvent>,
        limiter: Arc<RateLimiterRegistry>,
        options: PresenceOptions,
        on_change: impl Fn(PresenceMap) + Send + Sync + 'static,
    ) -> Self {
        let stale_after = chrono::Duration::from_std(options.stale_after)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let publisher = weak.clone();
            Inner {
                topic: topic.into(),
                connection,
                limiter,
                stale_after,
                on_change: Arc::new(on_change),
                syncs: Throttler::new(options.throttle, move |records| {
                    if let Some(inner) = publisher.upgrade() {
                        inner.publish(records);
                    }
                }),
                state: Mutex::new(ObserverState {
                    local,
                    latest: Vec::new(),
                    listener: None,
                    refresher: None,
                    closed: false,
                }),
            }
        });

        let weak = Arc::downgrade(&inner);
        inner.connection.on_status(move |status| {
            if status == ConnectionStatus::Connected {
                if let Some(inner) = weak.upgrade() {
                    inner.track();
                }
            }
        });

        let weak = Arc::downgrade(&inner);
        let listener = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                if let ChannelEvent::PresenceSync(records) = event {
                    inner.syncs.call(records);
                }
            }
        });
        let publishes = inner.state().local.is_some();
        let refresher = publishes
            .then(|| spawn_refresher(Arc::downgrade(&inner), options.stale_after / 2));
        {
            let mut state = inner.state();
            state.listener = Some(listener);
            state.refresher = refresher;
        }

        Self { inner }
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    /// Change the local status and publish it
    pub fn set_status(&self, status: PresenceStatus) {
        {
            let mut state = self.inner.state();
            if let Some(local) = state.local.as_mut() {
                local.status = status;
                local.touch();
            }
        }
        self.inner.track();
    }

    /// Current presence map, staleness evaluated now
    pub fn presence(&self) -> PresenceMap {
        let state = self.inner.state();
        self.inner.effective(&state.latest)
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.inner.connection
    }

    /// Stop reporting and tear down the channel. Idempotent.
    pub fn cleanup(&self) {
        let tasks = {
            let mut state = self.inner.state();
            if state.closed {
                return;
            }
            state.closed = true;
            [state.listener.take(), state.refresher.take()]
        };
        for task in tasks.into_iter().flatten() {
            task.abort();
        }
        self.inner.syncs.cancel();
        self.inner.connection.cleanup();
    }
}

fn spawn_refresher(inner: Weak<Inner>, period: Duration) -> JoinHandle<()> {
    let period = period.max(Duration::from_millis(1));
    tokio::spawn(async move {
        let mut ticks = interval_at(Instant::now() + period, period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticks.tick().await;
            let Some(inner) = inner.upgrade() else { break };
            inner.refresh();
        }
    })
}

impl Drop for PresenceObserver {
    fn drop(&mut self) {
        self.cleanup();
    }
}
