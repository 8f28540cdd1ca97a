//! # Transport Seam
//!
//! The pub/sub transport is an external collaborator. This module fixes the
//! minimum it must offer: topic subscribe/unsubscribe, broadcast send,
//! presence tracking, and an event stream per subscription carrying status,
//! broadcasts, change-feed rows and presence syncs.
//!
//! Events flow back through a `TransportSink` handed over at subscribe
//! time, so every binding is attached before the transport can confirm.
//! All delivery is best-effort and at-least-once.

pub mod errors;
pub mod event;
pub mod memory;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::presence::PresenceRecord;

pub use errors::{TransportError, TransportResult};
pub use event::{
    Binding, ChangeFilter, ChangeKind, ChangeRecord, ChannelBindings, SubscribeStatus,
    TransportEvent,
};
pub use memory::{MemoryTransport, SentMessage};

/// Where the transport pushes events for one subscription
pub type TransportSink = mpsc::UnboundedSender<TransportEvent>;

/// Opaque handle to one live transport subscription
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub id: u64,
    pub topic: String,
}

/// Minimum capabilities consumed from the pub/sub transport
pub trait Transport: Send + Sync {
    /// Open a subscription. Confirmation arrives later on `sink` as
    /// `TransportEvent::Status(SubscribeStatus::Subscribed)`.
    fn subscribe(
        &self,
        topic: &str,
        bindings: &ChannelBindings,
        sink: TransportSink,
    ) -> TransportResult<SubscriptionHandle>;

    /// Detach a subscription. Unknown handles are ignored.
    fn unsubscribe(&self, handle: &SubscriptionHandle);

    /// Fire-and-forget broadcast
    fn send(&self, handle: &SubscriptionHandle, event: &str, payload: Value) -> TransportResult<()>;

    /// Publish local presence for the subscription's topic
    fn track_presence(
        &self,
        handle: &SubscriptionHandle,
        record: &PresenceRecord,
    ) -> TransportResult<()>;
}
