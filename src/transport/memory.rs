//! # In-Memory Transport
//!
//! A scriptable, in-process transport. Every subscriber of a topic shares
//! one fan-out map; the test (or simulation) decides when subscriptions are
//! confirmed, failed, timed out or closed.
//!
//! Delivery through this transport is immediate and lossless; loss and
//! duplication are injected by the caller.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use serde_json::Value;

use super::errors::{TransportError, TransportResult};
use super::event::{ChangeRecord, ChannelBindings, SubscribeStatus, TransportEvent};
use super::{SubscriptionHandle, Transport, TransportSink};
use crate::presence::PresenceRecord;

/// One outbound broadcast recorded by the transport
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub topic: String,
    pub event: String,
    pub payload: Value,
}

#[derive(Debug)]
struct LiveSubscription {
    topic: String,
    bindings: ChannelBindings,
    sink: TransportSink,
}

#[derive(Debug, Default)]
struct MemoryState {
    live: HashMap<u64, LiveSubscription>,
    /// Status replies for upcoming subscribes, per topic
    scripted: HashMap<String, VecDeque<SubscribeStatus>>,
    subscribe_calls: HashMap<String, usize>,
    sent: Vec<SentMessage>,
    tracked: HashMap<String, HashMap<String, PresenceRecord>>,
    reject_subscribes: usize,
}

/// In-process transport
#[derive(Debug)]
pub struct MemoryTransport {
    next_id: AtomicU64,
    auto_confirm: AtomicBool,
    refuse_sends: AtomicBool,
    state: Mutex<MemoryState>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    /// Subscriptions are confirmed immediately
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            auto_confirm: AtomicBool::new(true),
            refuse_sends: AtomicBool::new(false),
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Subscriptions wait for `confirm` / `fail` / `time_out` / `close`
    pub fn manual() -> Self {
        let transport = Self::new();
        transport.set_auto_confirm(false);
        transport
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_auto_confirm(&self, enabled: bool) {
        self.auto_confirm.store(enabled, Ordering::SeqCst);
    }

    /// Make `send` / `track_presence` fail with `NotConnected`
    pub fn set_refuse_sends(&self, refuse: bool) {
        self.refuse_sends.store(refuse, Ordering::SeqCst);
    }

    /// Reply to the next subscribes on `topic` with these statuses, in order
    pub fn script(&self, topic: &str, statuses: impl IntoIterator<Item = SubscribeStatus>) {
        self.state()
            .scripted
            .entry(topic.to_string())
            .or_default()
            .extend(statuses);
    }

    /// Reject the next `count` subscribe calls synchronously
    pub fn reject_next_subscribes(&self, count: usize) {
        self.state().reject_subscribes = count;
    }

    fn push_status(&self, topic: &str, status: SubscribeStatus) -> usize {
        let state = self.state();
        state
            .live
            .values()
            .filter(|sub| sub.topic == topic)
            .filter(|sub| sub.sink.send(TransportEvent::Status(status.clone())).is_ok())
            .count()
    }

    /// Confirm every live subscription on `topic`
    pub fn confirm(&self, topic: &str) -> usize {
        self.push_status(topic, SubscribeStatus::Subscribed)
    }

    pub fn fail(&self, topic: &str, reason: &str) -> usize {
        self.push_status(topic, SubscribeStatus::ChannelError(reason.to_string()))
    }

    pub fn time_out(&self, topic: &str) -> usize {
        self.push_status(topic, SubscribeStatus::TimedOut)
    }

    /// Close every live subscription on `topic` from the server side
    pub fn close(&self, topic: &str) -> usize {
        let mut state = self.state();
        let ids: Vec<u64> = state
            .live
            .iter()
            .filter(|(_, sub)| sub.topic == topic)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            if let Some(sub) = state.live.remove(id) {
                let _ = sub.sink.send(TransportEvent::Status(SubscribeStatus::Closed));
            }
        }
        ids.len()
    }

    fn fan_out(&self, topic: &str, event: TransportEvent, skip: Option<u64>) -> usize {
        let state = self.state();
        state
            .live
            .iter()
            .filter(|(id, sub)| sub.topic == topic && Some(**id) != skip)
            .filter(|(_, sub)| sub.bindings.wants(&event))
            .filter(|(_, sub)| sub.sink.send(event.clone()).is_ok())
            .count()
    }

    /// Server-originated broadcast to every subscriber of `topic`
    pub fn broadcast(&self, topic: &str, event: &str, payload: Value) -> usize {
        self.fan_out(
            topic,
            TransportEvent::Broadcast {
                event: event.to_string(),
                payload,
            },
            None,
        )
    }

    /// Change-feed notification to every subscriber of `topic`
    pub fn change(&self, topic: &str, record: ChangeRecord) -> usize {
        self.fan_out(topic, TransportEvent::Change(record), None)
    }

    /// Push the current presence view of `topic` to its subscribers
    pub fn presence_sync(&self, topic: &str) -> usize {
        let records: Vec<PresenceRecord> = self
            .state()
            .tracked
            .get(topic)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        self.fan_out(topic, TransportEvent::PresenceSync(records), None)
    }

    /// Remove a user from the presence view of `topic` and sync
    pub fn untrack(&self, topic: &str, user_id: &str) {
        if let Some(view) = self.state().tracked.get_mut(topic) {
            view.remove(user_id);
        }
        self.presence_sync(topic);
    }

    /// Live transport subscriptions on `topic`
    pub fn live_count(&self, topic: &str) -> usize {
        self.state().live.values().filter(|s| s.topic == topic).count()
    }

    /// Subscribe calls ever made for `topic`
    pub fn subscribe_count(&self, topic: &str) -> usize {
        self.state().subscribe_calls.get(topic).copied().unwrap_or(0)
    }

    /// Everything sent on `topic`
    pub fn sent(&self, topic: &str) -> Vec<SentMessage> {
        self.state()
            .sent
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Sends of `event` on `topic`
    pub fn sent_count(&self, topic: &str, event: &str) -> usize {
        self.state()
            .sent
            .iter()
            .filter(|m| m.topic == topic && m.event == event)
            .count()
    }
}

impl Transport for MemoryTransport {
    fn subscribe(
        &self,
        topic: &str,
        bindings: &ChannelBindings,
        sink: TransportSink,
    ) -> TransportResult<SubscriptionHandle> {
        if topic.is_empty() {
            return Err(TransportError::InvalidTopic(topic.to_string()));
        }

        let mut state = self.state();
        *state.subscribe_calls.entry(topic.to_string()).or_default() += 1;

        if state.reject_subscribes > 0 {
            state.reject_subscribes -= 1;
            return Err(TransportError::NotConnected);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let reply = state
            .scripted
            .get_mut(topic)
            .and_then(|queue| queue.pop_front())
            .or_else(|| {
                self.auto_confirm
                    .load(Ordering::SeqCst)
                    .then_some(SubscribeStatus::Subscribed)
            });

        if let Some(status) = reply {
            let _ = sink.send(TransportEvent::Status(status));
        }

        state.live.insert(
            id,
            LiveSubscription {
                topic: topic.to_string(),
                bindings: bindings.clone(),
                sink,
            },
        );

        Ok(SubscriptionHandle {
            id,
            topic: topic.to_string(),
        })
    }

    fn unsubscribe(&self, handle: &SubscriptionHandle) {
        self.state().live.remove(&handle.id);
    }

    fn send(&self, handle: &SubscriptionHandle, event: &str, payload: Value) -> TransportResult<()> {
        if self.refuse_sends.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        {
            let mut state = self.state();
            if !state.live.contains_key(&handle.id) {
                return Err(TransportError::UnknownHandle(handle.id));
            }
            state.sent.push(SentMessage {
                topic: handle.topic.clone(),
                event: event.to_string(),
                payload: payload.clone(),
            });
        }

        // Broadcasts are not echoed to the sender
        self.fan_out(
            &handle.topic,
            TransportEvent::Broadcast {
                event: event.to_string(),
                payload,
            },
            Some(handle.id),
        );
        Ok(())
    }

    fn track_presence(
        &self,
        handle: &SubscriptionHandle,
        record: &PresenceRecord,
    ) -> TransportResult<()> {
        if self.refuse_sends.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        {
            let mut state = self.state();
            if !state.live.contains_key(&handle.id) {
                return Err(TransportError::UnknownHandle(handle.id));
            }
            let mut record = record.clone();
            record.touch();
            state
                .tracked
                .entry(handle.topic.clone())
                .or_default()
                .insert(record.user_id.clone(), record);
        }
        self.presence_sync(&handle.topic);
        Ok(())
    }
}
