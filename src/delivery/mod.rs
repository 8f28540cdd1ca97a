//! # Deduplicating Delivery
//!
//! Turns at-least-once notifications from two independent paths into
//! at-most-once application callbacks.

mod dedup;
mod pipeline;

pub use dedup::{DedupWindow, DEFAULT_DEDUP_CAPACITY};
pub use pipeline::{
    notification_id, DeliverCallback, DeliveryOutcome, DeliveryPath, DeliveryPipeline,
    PipelineOptions, DEFAULT_FETCH_FAILURE_ALERT_THRESHOLD,
};
