// src/shutdown.rs
//
// Process-wide cooperative termination signal

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Shared `terminate` flag.
///
/// Accept loops wait on [`Terminate::wait`]; connection workers check
/// [`Terminate::is_set`] on every poll tick. Nothing is interrupted
/// forcibly: a worker finishes its current request before it notices.
#[derive(Clone, Default)]
pub struct Terminate {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Terminate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag and wake every waiter.
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolve once the flag has been raised.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}
