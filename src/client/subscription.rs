//! Subscription handles returned to application code

use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;

use crate::presence::{PresenceMap, PresenceObserver, PresenceStatus};
use crate::typing::{TypingSession, TypingUser};

type TeardownFn = Box<dyn FnOnce() + Send>;

/// Run-once teardown shared by a handle and the client's tracker, so a
/// replaced session is torn down whole even while its handle is alive.
#[derive(Clone)]
pub(crate) struct Teardown(Arc<Mutex<Option<TeardownFn>>>);

impl Teardown {
    fn new(teardown: impl FnOnce() + Send + 'static) -> Self {
        Self(Arc::new(Mutex::new(Some(Box::new(teardown)))))
    }

    fn slot(&self) -> MutexGuard<'_, Option<TeardownFn>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn run(&self) {
        let teardown = self.slot().take();
        if let Some(teardown) = teardown {
            teardown();
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.slot().is_none()
    }
}

/// Single cleanup for everything a subscribe call set up.
///
/// `cleanup` runs the teardown once; later calls and drop are no-ops.
pub struct Subscription {
    teardown: Teardown,
}

impl Subscription {
    pub fn new(teardown: impl FnOnce() + Send + 'static) -> Self {
        Self {
            teardown: Teardown::new(teardown),
        }
    }

    pub(crate) fn teardown(&self) -> Teardown {
        self.teardown.clone()
    }

    pub fn cleanup(&self) {
        self.teardown.run();
    }

    pub fn is_closed(&self) -> bool {
        self.teardown.is_done()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cleanup();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Typing subscription: cleanup plus the local outbound signal
pub struct TypingSubscription {
    pub(crate) session: Arc<TypingSession>,
    pub(crate) guard: Subscription,
}

impl TypingSubscription {
    pub fn start_typing(&self) {
        self.session.start_typing();
    }

    pub fn stop_typing(&self) {
        self.session.stop_typing();
    }

    /// Feed an inbound payload directly, bypassing the channel
    pub fn on_broadcast(&self, payload: &Value) {
        self.session.on_broadcast(payload);
    }

    pub fn typing_users(&self) -> Vec<TypingUser> {
        self.session.typing_users()
    }

    pub fn cleanup(&self) {
        self.guard.cleanup();
    }

    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }
}

/// Presence subscription: cleanup plus the local status
pub struct PresenceSubscription {
    pub(crate) observer: Arc<PresenceObserver>,
    pub(crate) guard: Subscription,
}

impl PresenceSubscription {
    pub fn set_status(&self, status: PresenceStatus) {
        self.observer.set_status(status);
    }

    pub fn presence(&self) -> PresenceMap {
        self.observer.presence()
    }

    pub fn cleanup(&self) {
        self.guard.cleanup();
    }

    pub fn is_closed(&self) -> bool {
        self.guard.is_closed()
    }
}
