//! Caller-owned cancellation handles.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

type CancelCallback = Box<dyn FnOnce() + Send>;

struct TokenInner {
    fired: AtomicBool,
    callbacks: Mutex<Vec<CancelCallback>>,
}

/// Cancellation signal for one conversion request.
///
/// May fire before or after the request starts executing; firing after the
/// request completed is a no-op (the result slot's first writer wins).
/// Clones share the same signal.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                fired: AtomicBool::new(false),
                callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.fired.load(Ordering::SeqCst)
    }

    /// Fire the token. Registered callbacks run once, on the calling
    /// thread; later `cancel` calls are no-ops.
    pub fn cancel(&self) {
        if self.inner.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        let callbacks: Vec<_> = {
            let mut callbacks = self.inner.callbacks.lock().unwrap();
            callbacks.drain(..).collect()
        };
        for callback in callbacks {
            callback();
        }
    }

    /// Register a callback to run when the token fires. A callback
    /// registered after the fact runs immediately.
    pub fn on_cancel(&self, callback: impl FnOnce() + Send + 'static) {
        if self.is_cancelled() {
            callback();
            return;
        }
        let mut callbacks = self.inner.callbacks.lock().unwrap();
        // The token may have fired while we took the lock.
        if self.is_cancelled() {
            drop(callbacks);
            callback();
        } else {
            callbacks.push(Box::new(callback));
        }
    }
}
