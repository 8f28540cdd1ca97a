//! # Dedup Window
//!
//! Bounded FIFO set of recently delivered entity ids.
//!
//! Eviction drops the oldest *inserted* id, not the least recently seen.
//! A re-notified id is still rejected while it is in the window, so FIFO
//! order is sufficient.

use std::collections::{HashSet, VecDeque};

/// Default number of ids remembered per session
pub const DEFAULT_DEDUP_CAPACITY: usize = 100;

/// Bounded set of seen ids with FIFO eviction
#[derive(Debug, Clone)]
pub struct DedupWindow {
    capacity: usize,
    order: VecDeque<String>,
    members: HashSet<String>,
}

impl Default for DedupWindow {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_CAPACITY)
    }
}

impl DedupWindow {
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            members: HashSet::with_capacity(capacity),
        }
    }

    /// Insert `id`; returns false if it was already present.
    pub fn insert(&mut self, id: &str) -> bool {
        if self.members.contains(id) {
            return false;
        }

        while self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }

        self.order.push_back(id.to_string());
        self.members.insert(id.to_string());
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.members.clear();
    }
}
