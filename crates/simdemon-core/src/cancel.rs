//! Cooperative cancellation with ordered cleanup callbacks
//!
//! [`CancelToken`] wraps a [`tokio_util::sync::CancellationToken`] so it can be
//! awaited, combined with timeouts and split into child tokens, and adds
//! callbacks that run exactly once when the token is cancelled.

use std::sync::{Arc, Mutex};

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

type Callback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct Callbacks {
    fired: bool,
    pending: Vec<Callback>,
}

/// Write-once cancellation flag shared by a build and everything it spawned
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: CancellationToken,
    callbacks: Arc<Mutex<Callbacks>>,
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the token and run registered callbacks in registration order.
    ///
    /// Subsequent calls are no-ops.
    pub fn cancel(&self) {
        let pending = {
            let mut callbacks = self.callbacks.lock().unwrap_or_else(|e| e.into_inner());
            if callbacks.fired {
                return;
            }
            callbacks.fired = true;
            std::mem::take(&mut callbacks.pending)
        };

        self.inner.cancel();
        for callback in pending {
            callback();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Register cleanup to run on cancellation.
    ///
    /// Runs immediately on the calling thread if the token is already cancelled.
    pub fn on_cancel(&self, callback: impl FnOnce() + Send + 'static) {
        {
            let mut callbacks = self.callbacks.lock().unwrap_or_else(|e| e.into_inner());
            if !callbacks.fired {
                callbacks.pending.push(Box::new(callback));
                return;
            }
        }
        callback();
    }

    /// Resolves once the token is cancelled
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.inner.cancelled()
    }

    /// Token cancelled together with this one, but cancellable on its own.
    ///
    /// Callbacks registered on the child run when either side cancels.
    pub fn child_token(&self) -> CancelToken {
        let child = CancelToken {
            inner: self.inner.child_token(),
            callbacks: Arc::new(Mutex::new(Callbacks::default())),
        };
        let weak = Arc::downgrade(&child.callbacks);
        let inner = child.inner.clone();
        self.on_cancel(move || {
            if let Some(callbacks) = weak.upgrade() {
                CancelToken { inner, callbacks }.cancel();
            }
        });
        child
    }
}
