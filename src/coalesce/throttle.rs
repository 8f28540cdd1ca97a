//! Leading + trailing edge throttle

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use super::Callback;

/// Invokes the callback immediately for the first input of a window.
///
/// Inputs arriving inside the window are captured and the last of them is
/// flushed when the window closes, which opens the next window. Nothing is
/// silently dropped: every window ends with the latest payload delivered.
pub struct Throttler<T> {
    inputs: mpsc::UnboundedSender<T>,
    task: JoinHandle<()>,
}

impl<T: Send + 'static> Throttler<T> {
    pub fn new(interval: Duration, callback: impl Fn(T) + Send + Sync + 'static) -> Self {
        let (inputs, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(rx, interval, Arc::new(callback)));
        Self { inputs, task }
    }

    pub fn call(&self, value: T) {
        let _ = self.inputs.send(value);
    }

    /// Discard the trailing payload and stop the timer. Idempotent.
    pub fn cancel(&self) {
        self.task.abort();
    }
}

impl<T> Drop for Throttler<T> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run<T>(mut inputs: mpsc::UnboundedReceiver<T>, interval: Duration, callback: Callback<T>) {
    let mut window_end: Option<Instant> = None;
    let mut trailing: Option<T> = None;

    loop {
        let deadline = window_end.unwrap_or_else(Instant::now);
        tokio::select! {
            input = inputs.recv() => {
                let Some(value) = input else { break };
                let now = Instant::now();
                match window_end {
                    Some(end) if now < end => trailing = Some(value),
                    _ => {
                        callback(value);
                        window_end = Some(now + interval);
                    }
                }
            }
            _ = sleep_until(deadline), if window_end.is_some() => {
                window_end = match trailing.take() {
                    Some(value) => {
                        callback(value);
                        Some(Instant::now() + interval)
                    }
                    None => None,
                };
            }
        }
    }
}
