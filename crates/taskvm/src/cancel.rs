//! Cancellation tokens
//!
//! A [`CancelToken`] is a cloneable one-shot flag. Callbacks registered on it
//! run exactly once when it fires, and [`CancelToken::cancelled`] gives root
//! functions an awaitable view of the same flag.

use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

type Callback = Box<dyn FnOnce() + Send + 'static>;

struct CancelInner {
    cancelled: AtomicBool,
    callbacks: Mutex<Vec<(u64, Callback)>>,
    next_id: AtomicU64,
}

/// Cloneable cancellation flag with callback registration
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl CancelToken {
    /// Create a token that has not fired
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancelInner {
                cancelled: AtomicBool::new(false),
                callbacks: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Fire the token. Only the first call runs the registered callbacks.
    pub fn cancel(&self) {
        let callbacks = {
            let mut callbacks = self.inner.callbacks.lock();
            if self.inner.cancelled.swap(true, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut *callbacks)
        };

        for (_, callback) in callbacks {
            callback();
        }
    }

    /// Whether the token has fired
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Run `callback` when the token fires.
    ///
    /// If the token has already fired the callback runs immediately on the
    /// calling thread. Dropping the returned registration unregisters it.
    pub fn register<F>(&self, callback: F) -> CancelRegistration
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut callbacks = self.inner.callbacks.lock();
            if !self.inner.cancelled.load(Ordering::Acquire) {
                callbacks.push((id, Box::new(callback)));
                return CancelRegistration {
                    inner: Some(Arc::clone(&self.inner)),
                    id,
                };
            }
        }

        callback();
        CancelRegistration { inner: None, id }
    }

    /// Future that resolves once the token fires
    pub fn cancelled(&self) -> Cancelled {
        Cancelled {
            token: self.clone(),
            registration: None,
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Handle to a registered cancellation callback
#[must_use = "dropping the registration unregisters the callback"]
pub struct CancelRegistration {
    inner: Option<Arc<CancelInner>>,
    id: u64,
}

impl Drop for CancelRegistration {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.callbacks.lock().retain(|(id, _)| *id != self.id);
        }
    }
}

/// Future returned by [`CancelToken::cancelled`]
pub struct Cancelled {
    token: CancelToken,
    registration: Option<CancelRegistration>,
}

impl Future for Cancelled {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.token.is_cancelled() {
            self.registration = None;
            return Poll::Ready(());
        }

        let waker = cx.waker().clone();
        let registration = self.token.register(move || waker.wake());
        self.registration = Some(registration);

        if self.token.is_cancelled() {
            self.registration = None;
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_cancel_runs_callbacks_once() {
        let token = CancelToken::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let _reg = token.register(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        token.cancel();
        token.cancel();

        assert!(token.is_cancelled());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_register_after_cancel_runs_immediately() {
        let token = CancelToken::new();
        token.cancel();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let _reg = token.register(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropped_registration_does_not_fire() {
        let token = CancelToken::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let reg = token.register(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        drop(reg);

        token.cancel();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_clones_share_state() {
        let token = CancelToken::new();
        let other = token.clone();
        other.cancel();
        assert!(token.is_cancelled());
    }
}
