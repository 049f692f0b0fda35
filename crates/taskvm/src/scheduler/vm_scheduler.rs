//! Per-instance scheduling context

use super::{Continuation, DispatchQueue, OrphanPump, Route, Scheduler};
use crate::error::ContinuationFault;
use crate::vm::VmId;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Routes an instance's continuations to its dispatch queue, or to the
/// orphan pump once the queue has closed.
pub struct VmScheduler {
    id: VmId,
    queue: Arc<DispatchQueue>,
    pump: Arc<OrphanPump>,
    /// Outstanding asynchronous steps
    outstanding: AtomicUsize,
    /// Continuations that went to the pump instead of the queue
    forwarded: AtomicU64,
}

impl VmScheduler {
    /// Create the scheduler for instance `id`
    pub fn new(id: VmId, queue: Arc<DispatchQueue>, pump: Arc<OrphanPump>) -> Self {
        Self {
            id,
            queue,
            pump,
            outstanding: AtomicUsize::new(0),
            forwarded: AtomicU64::new(0),
        }
    }

    /// Owning instance
    pub fn id(&self) -> VmId {
        self.id
    }

    /// The owning dispatch queue
    pub fn queue(&self) -> &Arc<DispatchQueue> {
        &self.queue
    }

    /// The pump closed-queue traffic goes to
    pub fn pump(&self) -> &Arc<OrphanPump> {
        &self.pump
    }

    /// Deliver `continuation` to the queue if open, else to the pump.
    ///
    /// The open check and the pump hand-off share the queue lock, so a
    /// continuation racing the dispatcher's shutdown is delivered exactly once.
    pub fn post(&self, continuation: Continuation) {
        let id = self.id;
        let pump = &self.pump;
        match self
            .queue
            .post_or_forward(continuation, |c| pump.post_action(id, c))
        {
            Route::Queued => {}
            Route::Forwarded => {
                self.forwarded.fetch_add(1, Ordering::Relaxed);
                log::trace!("vm {}: queue closed, continuation forwarded to pump", id);
            }
            Route::Rejected(continuation) => {
                log::warn!("vm {}: queue closed and pump stopped; running continuation inline", id);
                if let Err(message) = continuation.run_guarded() {
                    log::error!("{}", ContinuationFault { origin: id, message });
                }
            }
        }
    }

    /// Number of asynchronous steps currently in flight
    pub fn outstanding_operations(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Number of continuations forwarded to the pump
    pub fn forwarded_count(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }
}

impl Scheduler for VmScheduler {
    fn schedule(&self, continuation: Continuation) {
        self.post(continuation);
    }

    fn operation_started(&self) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
    }

    fn operation_completed(&self) {
        // Saturate rather than wrap on an unbalanced completion
        let _ = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

impl Drop for VmScheduler {
    fn drop(&mut self) {
        // Nothing can post under this id any more
        self.pump.remove_context(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::{Duration, Instant};

    fn setup() -> (Arc<OrphanPump>, Arc<DispatchQueue>, VmScheduler) {
        let pump = OrphanPump::start("taskvm-pump-test").unwrap();
        let queue = Arc::new(DispatchQueue::new());
        let scheduler = VmScheduler::new(VmId::new(), queue.clone(), pump.clone());
        (pump, queue, scheduler)
    }

    fn counter_continuation(counter: &Arc<AtomicUsize>) -> Continuation {
        let counter = counter.clone();
        Continuation::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_open_queue_receives_posts() {
        let (_pump, queue, scheduler) = setup();
        let counter = Arc::new(AtomicUsize::new(0));

        scheduler.schedule(counter_continuation(&counter));
        scheduler.schedule(counter_continuation(&counter));

        assert_eq!(queue.len(), 2);
        assert_eq!(scheduler.forwarded_count(), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        let mut batch = VecDeque::new();
        queue.take(&mut batch);
        for c in batch {
            c.run();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_closed_queue_goes_to_pump() {
        let (_pump, queue, scheduler) = setup();
        assert!(queue.close_if_empty());

        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.schedule(counter_continuation(&counter));

        let start = Instant::now();
        while counter.load(Ordering::SeqCst) == 0 && start.elapsed() < Duration::from_secs(1) {
            thread::sleep(Duration::from_millis(5));
        }
        thread::sleep(Duration::from_millis(30));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.forwarded_count(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_runs_inline_when_everything_is_down() {
        let (pump, queue, scheduler) = setup();
        assert!(queue.close_if_empty());
        pump.shutdown();

        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.schedule(counter_continuation(&counter));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_operation_counter() {
        let (_pump, _queue, scheduler) = setup();
        scheduler.operation_started();
        scheduler.operation_started();
        assert_eq!(scheduler.outstanding_operations(), 2);
        scheduler.operation_completed();
        scheduler.operation_completed();
        scheduler.operation_completed();
        assert_eq!(scheduler.outstanding_operations(), 0);
    }

    #[test]
    fn test_racing_posts_delivered_exactly_once() {
        let (pump, queue, scheduler) = setup();
        let scheduler = Arc::new(scheduler);
        let counter = Arc::new(AtomicUsize::new(0));
        const POSTERS: usize = 4;
        const PER_POSTER: usize = 250;

        let posters: Vec<_> = (0..POSTERS)
            .map(|_| {
                let scheduler = scheduler.clone();
                let counter = counter.clone();
                thread::spawn(move || {
                    for _ in 0..PER_POSTER {
                        scheduler.schedule(counter_continuation(&counter));
                    }
                })
            })
            .collect();

        // Drain locally and close at the first moment the queue is empty
        let mut batch = VecDeque::new();
        loop {
            queue.take(&mut batch);
            if batch.is_empty() {
                if queue.close_if_empty() {
                    break;
                }
                continue;
            }
            for c in batch.drain(..) {
                c.run();
            }
            thread::yield_now();
        }
        assert!(pump.is_running());

        for poster in posters {
            poster.join().unwrap();
        }

        let expected = POSTERS * PER_POSTER;
        let start = Instant::now();
        while counter.load(Ordering::SeqCst) < expected && start.elapsed() < Duration::from_secs(2) {
            thread::sleep(Duration::from_millis(5));
        }
        thread::sleep(Duration::from_millis(30));
        assert_eq!(counter.load(Ordering::SeqCst), expected);
    }
}
