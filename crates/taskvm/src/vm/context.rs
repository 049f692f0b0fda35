//! Handle passed to root functions

use super::VmId;
use crate::cancel::CancelToken;
use crate::scheduler::{Continuation, Scheduler, VmScheduler};
use crate::timer::{Sleep, TimerService};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

/// The root function's view of its instance
///
/// Everything a root function posts through this context (directly or via
/// the futures it returns) is routed by the instance's [`VmScheduler`].
#[derive(Clone)]
pub struct VmContext {
    id: VmId,
    scheduler: Arc<VmScheduler>,
    timer: Arc<TimerService>,
    graceful_cancel: CancelToken,
    abort_requested: Arc<AtomicBool>,
}

impl VmContext {
    pub(crate) fn new(
        scheduler: Arc<VmScheduler>,
        timer: Arc<TimerService>,
        graceful_cancel: CancelToken,
        abort_requested: Arc<AtomicBool>,
    ) -> Self {
        Self {
            id: scheduler.id(),
            scheduler,
            timer,
            graceful_cancel,
            abort_requested,
        }
    }

    /// Instance identity
    pub fn id(&self) -> VmId {
        self.id
    }

    /// The scheduler bound to this instance
    pub fn scheduler(&self) -> Arc<dyn Scheduler> {
        self.scheduler.clone()
    }

    /// Post a continuation to this instance
    pub fn post<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.scheduler.post(Continuation::new(callback));
    }

    /// Suspend once, letting every continuation posted so far run first
    pub fn yield_now(&self) -> YieldNow {
        YieldNow { yielded: false }
    }

    /// Suspend for `duration`. Counted as an outstanding operation while pending.
    pub fn sleep(&self, duration: Duration) -> Tracked<Sleep> {
        Tracked::new(self.timer.sleep(duration), self.scheduler.clone())
    }

    /// Wrap `future` so it counts as an outstanding operation until dropped
    pub fn track<F>(&self, future: F) -> Tracked<F>
    where
        F: Future + Unpin,
    {
        Tracked::new(future, self.scheduler.clone())
    }

    /// Token the caller fires to ask the root function to wind down
    pub fn graceful_cancel(&self) -> &CancelToken {
        &self.graceful_cancel
    }

    /// Whether `abort` has been requested on this instance
    pub fn is_abort_requested(&self) -> bool {
        self.abort_requested.load(Ordering::Acquire)
    }

    /// Number of tracked operations currently in flight
    pub fn outstanding_operations(&self) -> usize {
        self.scheduler.outstanding_operations()
    }
}

/// Future returned by [`VmContext::yield_now`]
#[derive(Debug, Default)]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        // Re-queues the root behind everything already posted
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

/// A future counted in its scheduler's outstanding operations
pub struct Tracked<F> {
    inner: F,
    scheduler: Arc<dyn Scheduler>,
}

impl<F> Tracked<F> {
    fn new(inner: F, scheduler: Arc<dyn Scheduler>) -> Self {
        scheduler.operation_started();
        Self { inner, scheduler }
    }
}

impl<F: Future + Unpin> Future for Tracked<F> {
    type Output = F::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<F::Output> {
        Pin::new(&mut self.inner).poll(cx)
    }
}

impl<F> Drop for Tracked<F> {
    fn drop(&mut self) {
        self.scheduler.operation_completed();
    }
}
