//! The connection-scoped cancellation signal (spec §5 "Cancellation", §9
//! "Cyclic cancellation"). Every task in a `ClientHandler` holds a clone of
//! the same `Shutdown`; any of them can trigger it, and every one of them
//! observes it. Modeled as a single shared flag with many subscribers, not
//! a parent/child hierarchy, which is what keeps it acyclic.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

#[derive(Clone)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

struct Inner {
    triggered: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                triggered: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Fires the shared signal. Idempotent: triggering an already-triggered
    /// `Shutdown` is a no-op.
    pub fn trigger(&self) {
        if !self.inner.triggered.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    /// Resolves once the signal has fired. Safe to call repeatedly and from
    /// any number of tasks; resolves immediately if already triggered.
    pub async fn cancelled(&self) {
        loop {
            if self.is_triggered() {
                return;
            }
            let notified = self.inner.notify.notified();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
