//! The root future and its waker
//!
//! Waking the root never polls it directly: it posts one resume continuation
//! through the instance's scheduler. Repeated wakes before that continuation
//! runs are coalesced.

use super::result::{Outcome, ResultBox};
use crate::error::TaskError;
use crate::scheduler::{panic_message, Continuation, VmScheduler};
use parking_lot::Mutex;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};

type BoxedRoot<T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'static>>;

/// A root future bound to its instance's scheduler and result box
pub(crate) struct RootTask<T, E> {
    /// None once the future has produced its output or panicked
    future: Mutex<Option<BoxedRoot<T, E>>>,
    /// A resume continuation is already in flight
    scheduled: AtomicBool,
    /// Another poll was requested while the future was locked
    repoll: AtomicBool,
    scheduler: Arc<VmScheduler>,
    result: Arc<ResultBox<T, E>>,
}

impl<T, E> RootTask<T, E>
where
    T: Send + 'static,
    E: Send + Sync + 'static,
{
    /// Wrap `future` and schedule its first poll
    pub(crate) fn launch<F>(future: F, scheduler: Arc<VmScheduler>, result: Arc<ResultBox<T, E>>)
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        let task = Arc::new(Self {
            future: Mutex::new(Some(Box::pin(future))),
            scheduled: AtomicBool::new(false),
            repoll: AtomicBool::new(false),
            scheduler,
            result,
        });
        task.schedule();
    }

    fn schedule(self: &Arc<Self>) {
        if self.scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let task = Arc::clone(self);
        self.scheduler.post(Continuation::new(move || task.resume()));
    }

    /// Poll the root. Runs on whichever thread executes the resume
    /// continuation: the VM thread, or the pump once the VM has shut down.
    ///
    /// A resume that finds a poll already in progress (on another thread, or
    /// further up this thread's stack through an inline fallback) only raises
    /// `repoll`; the active poller polls again once it releases the future.
    fn resume(self: &Arc<Self>) {
        // Cleared first so a wake during this poll schedules another resume
        self.scheduled.store(false, Ordering::Release);
        self.repoll.store(true, Ordering::SeqCst);

        while self.repoll.load(Ordering::SeqCst) {
            let Some(mut slot) = self.future.try_lock() else {
                return;
            };
            self.repoll.store(false, Ordering::SeqCst);
            let Some(future) = slot.as_mut() else {
                return;
            };

            let waker = Waker::from(Arc::clone(self));
            let mut cx = Context::from_waker(&waker);
            let outcome =
                match panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx))) {
                    Ok(Poll::Pending) => continue,
                    Ok(Poll::Ready(output)) => Outcome::from_result(output),
                    Err(payload) => {
                        Outcome::Failed(TaskError::Panicked(panic_message(payload.as_ref())))
                    }
                };
            *slot = None;
            drop(slot);

            if !self.result.try_complete(outcome) {
                log::debug!(
                    "vm {}: root finished after terminal state, discarding outcome",
                    self.scheduler.id()
                );
            }
            return;
        }
    }
}

impl<T, E> Wake for RootTask<T, E>
where
    T: Send + 'static,
    E: Send + Sync + 'static,
{
    fn wake(self: Arc<Self>) {
        self.schedule();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.schedule();
    }
}
