//! Channel tracker
//!
//! Explicit topic map owned by one client. Holding a topic a second time
//! runs the older session's full teardown first, so at most one session
//! per topic is live for the client, reconcilers and pipelines included.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::subscription::Teardown;
use crate::connection::{ConnectionControl, ConnectionError, ConnectionStatus};
use crate::observability::{log_event_with_fields, Event};

/// Client-wide status observer: `(topic, status)`
pub type ClientStatusCallback = Arc<dyn Fn(&str, ConnectionStatus) + Send + Sync>;

/// Client-wide terminal failure observer: `(topic, error)`
pub type ClientFailureCallback = Arc<dyn Fn(&str, &ConnectionError) + Send + Sync>;

struct TrackedChannel {
    generation: u64,
    control: ConnectionControl,
    teardown: Teardown,
}

/// Live sessions keyed by topic
#[derive(Default)]
pub struct ChannelTracker {
    channels: Mutex<HashMap<String, TrackedChannel>>,
    observers: Mutex<Vec<ClientStatusCallback>>,
    failure_observers: Mutex<Vec<ClientFailureCallback>>,
    generations: AtomicU64,
}

impl ChannelTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<String, TrackedChannel>> {
        self.channels.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn observers(&self) -> MutexGuard<'_, Vec<ClientStatusCallback>> {
        self.observers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn failure_observers(&self) -> MutexGuard<'_, Vec<ClientFailureCallback>> {
        self.failure_observers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Tear down and forget the session holding `topic`, if any
    pub fn evict(&self, topic: &str) -> bool {
        let evicted = self.channels().remove(topic);
        match evicted {
            Some(old) => {
                old.teardown.run();
                log_event_with_fields(Event::ChannelReplaced, &[("topic", topic)]);
                true
            }
            None => false,
        }
    }

    /// Generation for a session about to be registered
    pub fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Track a session for `topic`; any older holder is torn down
    pub(crate) fn register(
        &self,
        topic: &str,
        generation: u64,
        control: ConnectionControl,
        teardown: Teardown,
    ) {
        let previous = self.channels().insert(
            topic.to_string(),
            TrackedChannel {
                generation,
                control,
                teardown,
            },
        );
        if let Some(old) = previous {
            old.teardown.run();
            log_event_with_fields(Event::ChannelReplaced, &[("topic", topic)]);
        }
    }

    /// Forget `topic` if it is still held by `generation`
    pub fn release(&self, topic: &str, generation: u64) {
        let released = {
            let mut channels = self.channels();
            if channels.get(topic).map(|c| c.generation) == Some(generation) {
                channels.remove(topic)
            } else {
                None
            }
        };
        // Dropped outside the lock
        drop(released);
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.channels().contains_key(topic)
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.channels().keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn status(&self, topic: &str) -> Option<ConnectionStatus> {
        let control = self.channels().get(topic).map(|c| c.control.clone())?;
        control.status()
    }

    fn controls(&self) -> Vec<(String, ConnectionControl)> {
        self.channels()
            .iter()
            .map(|(topic, c)| (topic.clone(), c.control.clone()))
            .collect()
    }

    /// Manual reconnect of one topic; false if the topic is not held
    pub fn reconnect(&self, topic: &str) -> bool {
        let control = self.channels().get(topic).map(|c| c.control.clone());
        match control {
            Some(control) => {
                control.reconnect();
                true
            }
            None => false,
        }
    }

    pub fn pause_all(&self) {
        for (_, control) in self.controls() {
            control.pause();
        }
    }

    pub fn resume_all(&self) {
        for (_, control) in self.controls() {
            control.resume();
        }
    }

    /// Tear down every session
    pub fn close_all(&self) {
        let drained: Vec<TrackedChannel> = self.channels().drain().map(|(_, c)| c).collect();
        for channel in drained {
            channel.teardown.run();
            channel.control.close();
        }
    }

    /// Register an observer and replay the current status of every session
    pub fn add_observer(&self, callback: ClientStatusCallback) {
        self.observers().push(Arc::clone(&callback));

        for (topic, control) in self.controls() {
            if let Some(status) = control.status() {
                callback(&topic, status);
            }
        }
    }

    /// Fan a status transition out to every observer
    pub fn notify(&self, topic: &str, status: ConnectionStatus) {
        let observers: Vec<ClientStatusCallback> = self.observers().clone();
        for observer in observers {
            observer(topic, status);
        }
    }

    /// Register a failure observer and replay every standing failure
    pub fn add_failure_observer(&self, callback: ClientFailureCallback) {
        self.failure_observers().push(Arc::clone(&callback));

        for (topic, control) in self.controls() {
            if let Some(error) = control.failure() {
                callback(&topic, &error);
            }
        }
    }

    /// Fan a terminal failure out to every failure observer
    pub fn notify_failure(&self, topic: &str, error: &ConnectionError) {
        let observers: Vec<ClientFailureCallback> = self.failure_observers().clone();
        for observer in observers {
            observer(topic, error);
        }
    }
}
