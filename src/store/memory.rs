//! In-memory store backing tests and the simulation command

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use serde_json::Value;

use super::errors::{FetchError, FetchResult};
use super::{EntityStore, UnreadCounts, UnreadSource};

/// Entities keyed by `(entity_type, id)` plus per-user unread counts
#[derive(Debug, Default)]
pub struct MemoryStore {
    entities: RwLock<HashMap<(String, String), Value>>,
    unread: RwLock<HashMap<String, UnreadCounts>>,
    /// Upcoming fetch_by_id calls to fail
    fail_fetches: AtomicUsize,
    /// Upcoming unread_counts calls to fail
    fail_unread: AtomicUsize,
    fetch_calls: AtomicU64,
    unread_calls: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entities(&self) -> RwLockWriteGuard<'_, HashMap<(String, String), Value>> {
        self.entities.write().unwrap_or_else(|p| p.into_inner())
    }

    fn entities_read(&self) -> RwLockReadGuard<'_, HashMap<(String, String), Value>> {
        self.entities.read().unwrap_or_else(|p| p.into_inner())
    }

    fn unread(&self) -> RwLockWriteGuard<'_, HashMap<String, UnreadCounts>> {
        self.unread.write().unwrap_or_else(|p| p.into_inner())
    }

    pub fn insert(&self, entity_type: &str, id: &str, payload: Value) {
        self.entities()
            .insert((entity_type.to_string(), id.to_string()), payload);
    }

    pub fn remove(&self, entity_type: &str, id: &str) -> Option<Value> {
        self.entities()
            .remove(&(entity_type.to_string(), id.to_string()))
    }

    pub fn set_unread(&self, user_id: &str, conversation_id: &str, count: u64) {
        self.unread()
            .entry(user_id.to_string())
            .or_default()
            .by_conversation
            .insert(conversation_id.to_string(), count);
    }

    pub fn increment_unread(&self, user_id: &str, conversation_id: &str) {
        *self
            .unread()
            .entry(user_id.to_string())
            .or_default()
            .by_conversation
            .entry(conversation_id.to_string())
            .or_default() += 1;
    }

    /// Fail the next `count` fetch_by_id calls
    pub fn fail_next_fetches(&self, count: usize) {
        self.fail_fetches.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` unread_counts calls
    pub fn fail_next_unread(&self, count: usize) {
        self.fail_unread.store(count, Ordering::SeqCst);
    }

    pub fn fetch_calls(&self) -> u64 {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn unread_calls(&self) -> u64 {
        self.unread_calls.load(Ordering::SeqCst)
    }
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn fetch_by_id(&self, entity_type: &str, id: &str) -> FetchResult<Option<Value>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.fail_fetches) {
            return Err(FetchError::Unavailable("injected failure".to_string()));
        }
        Ok(self
            .entities_read()
            .get(&(entity_type.to_string(), id.to_string()))
            .cloned())
    }
}

#[async_trait]
impl UnreadSource for MemoryStore {
    async fn unread_counts(&self, user_id: &str) -> FetchResult<UnreadCounts> {
        self.unread_calls.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.fail_unread) {
            return Err(FetchError::Timeout);
        }
        Ok(self
            .unread
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_fetch_found_and_missing() {
        let store = MemoryStore::new();
        store.insert("message", "m-1", json!({"id": "m-1", "body": "hi"}));

        let found = store.fetch_by_id("message", "m-1").await.unwrap();
        assert_eq!(found.unwrap()["body"], "hi");
        assert!(store.fetch_by_id("message", "m-2").await.unwrap().is_none());
        assert_eq!(store.fetch_calls(), 2);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let store = MemoryStore::new();
        store.fail_next_fetches(1);

        assert!(store.fetch_by_id("message", "m-1").await.is_err());
        assert!(store.fetch_by_id("message", "m-1").await.is_ok());
    }

    #[tokio::test]
    async fn test_unread_counts() {
        let store = MemoryStore::new();
        store.set_unread("u-1", "c-1", 2);
        store.increment_unread("u-1", "c-2");

        let counts = store.unread_counts("u-1").await.unwrap();
        assert_eq!(counts.total(), 3);
        assert_eq!(counts.get("c-2"), 1);
        assert_eq!(store.unread_counts("nobody").await.unwrap().total(), 0);
    }
}
