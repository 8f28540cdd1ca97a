//! # Debounce / Throttle Coalescer
//!
//! Timing-only shaping of bursty streams. Payload content is never
//! inspected; the most recent payload always wins.
//!
//! Both primitives run a small task on the current tokio runtime and stop
//! it on `cancel()` or `Drop`.

pub mod debounce;
pub mod throttle;

use std::sync::Arc;

pub use debounce::Debouncer;
pub use throttle::Throttler;

type Callback<T> = Arc<dyn Fn(T) + Send + Sync>;
