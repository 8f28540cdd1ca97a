//! Debounce with a starvation bound

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use super::Callback;

/// Delays the callback until `wait` has elapsed since the last input.
///
/// If inputs keep arriving, the callback still fires once `max_wait` has
/// elapsed since the first unflushed input. The most recent payload wins.
pub struct Debouncer<T> {
    inputs: mpsc::UnboundedSender<T>,
    task: JoinHandle<()>,
}

impl<T: Send + 'static> Debouncer<T> {
    /// Spawn a debouncer on the current runtime
    pub fn new(
        wait: Duration,
        max_wait: Option<Duration>,
        callback: impl Fn(T) + Send + Sync + 'static,
    ) -> Self {
        let (inputs, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(rx, wait, max_wait, Arc::new(callback)));
        Self { inputs, task }
    }

    /// Feed one payload
    pub fn call(&self, value: T) {
        // The receiver only disappears after cancel(); dropping is correct then.
        let _ = self.inputs.send(value);
    }

    /// Discard any pending payload and stop the timer. Idempotent.
    pub fn cancel(&self) {
        self.task.abort();
    }

    pub fn is_cancelled(&self) -> bool {
        self.task.is_finished()
    }
}

impl<T> Drop for Debouncer<T> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run<T>(
    mut inputs: mpsc::UnboundedReceiver<T>,
    wait: Duration,
    max_wait: Option<Duration>,
    callback: Callback<T>,
) {
    let mut pending: Option<T> = None;
    let mut deadline = Instant::now();
    let mut hard_deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            input = inputs.recv() => {
                let Some(value) = input else { break };
                let now = Instant::now();
                if pending.is_none() {
                    hard_deadline = max_wait.map(|limit| now + limit);
                }
                pending = Some(value);
                deadline = match hard_deadline {
                    Some(hard) => (now + wait).min(hard),
                    None => now + wait,
                };
            }
            _ = sleep_until(deadline), if pending.is_some() => {
                hard_deadline = None;
                if let Some(value) = pending.take() {
                    callback(value);
                }
            }
        }
    }
}
