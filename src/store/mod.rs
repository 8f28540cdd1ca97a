//! # Data-Access Seam
//!
//! Single-shot reads by id and unread-count queries. Both are side-effect
//! free; the delivery layer only ever reads through them.

pub mod errors;
pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use errors::{FetchError, FetchResult};
pub use memory::MemoryStore;

/// Fetch canonical, fully hydrated entities by id
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// `Ok(None)` when the entity does not exist (e.g. deleted after the
    /// notification was emitted)
    async fn fetch_by_id(&self, entity_type: &str, id: &str) -> FetchResult<Option<Value>>;
}

/// Unread counts for one user
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadCounts {
    /// Unread messages per conversation
    pub by_conversation: BTreeMap<String, u64>,
}

impl UnreadCounts {
    pub fn total(&self) -> u64 {
        self.by_conversation.values().sum()
    }

    pub fn get(&self, conversation_id: &str) -> u64 {
        self.by_conversation.get(conversation_id).copied().unwrap_or(0)
    }
}

/// Derive unread counts from the backing store
#[async_trait]
pub trait UnreadSource: Send + Sync {
    async fn unread_counts(&self, user_id: &str) -> FetchResult<UnreadCounts>;
}
