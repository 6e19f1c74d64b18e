//! Cooperative cancellation for evaluation runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Cloneable cancellation token shared between a caller, the evaluator, and
/// every in-flight kernel dispatch of a run.
///
/// Cancelling is sticky: once set, the signal stays cancelled for its whole
/// lifetime. Clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation and wake every pending `cancelled()` wait.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolve once cancellation has been requested. Returns immediately if
    /// the signal is already cancelled.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.inner.notify.notified();
            // The flag may have flipped between the check above and the
            // waiter registration; recheck before parking.
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}
