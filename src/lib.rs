//! aerolive - Reliable real-time delivery for AeroDB channels
//!
//! Wraps a best-effort pub/sub transport with:
//! - supervised connections with exponential backoff and heartbeats
//! - at-most-once delivery of hydrated entities from two notification paths
//! - sliding-window rate limiting per `(topic, action)`
//! - typing indicators with timed expiry
//! - throttled presence with staleness detection
//! - periodic unread-count reconciliation
//!
//! `client::RealtimeClient` is the entry point for applications.

pub mod cli;
pub mod client;
pub mod coalesce;
pub mod config;
pub mod connection;
pub mod delivery;
pub mod observability;
pub mod presence;
pub mod ratelimit;
pub mod reconcile;
pub mod store;
pub mod transport;
pub mod typing;

pub use client::{RealtimeClient, Subscription};
pub use config::LiveConfig;
