//! Timer thread for sleeping root functions
//!
//! Instead of polling for expired sleeps, this timer thread waits for the
//! next deadline using condvar timeouts and fires the stored wakers from its
//! own thread. Those wakers post resume continuations back into the owning
//! VM, which is the usual way a resumption crosses threads.

use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crate::error::TaskVmError;

/// Shared between a [`Sleep`] future and the timer heap
struct SleepSlot {
    state: Mutex<SlotState>,
}

struct SlotState {
    fired: bool,
    waker: Option<Waker>,
}

impl SleepSlot {
    fn new(waker: Waker) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SlotState {
                fired: false,
                waker: Some(waker),
            }),
        })
    }

    fn fire(&self) {
        let waker = {
            let mut state = self.state.lock();
            state.fired = true;
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// Entry in the timer heap
struct SleepEntry {
    /// When to fire
    wake_at: Instant,
    /// Registration order, breaks ties between equal deadlines
    seq: u64,
    slot: Arc<SleepSlot>,
}

// Reverse ordering for min-heap (earliest wake time first)
impl Ord for SleepEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .wake_at
            .cmp(&self.wake_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for SleepEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for SleepEntry {
    fn eq(&self, other: &Self) -> bool {
        self.wake_at == other.wake_at && self.seq == other.seq
    }
}

impl Eq for SleepEntry {}

/// Timer thread state
struct TimerState {
    /// Pending sleeps, sorted by wake time (min-heap)
    sleeping: BinaryHeap<SleepEntry>,
    next_seq: u64,
}

/// Timer thread shared by every instance of a runtime
pub struct TimerService {
    /// Internal state protected by mutex
    state: Mutex<TimerState>,
    /// Condvar to wake the timer thread when an entry is added or on shutdown
    notify: Condvar,
    /// Shutdown signal
    shutdown: AtomicBool,
    /// Thread handle
    handle: Mutex<Option<JoinHandle<()>>>,
    thread_id: Mutex<Option<ThreadId>>,
}

impl TimerService {
    /// Create a timer service (not yet started)
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(TimerState {
                sleeping: BinaryHeap::new(),
                next_seq: 0,
            }),
            notify: Condvar::new(),
            shutdown: AtomicBool::new(false),
            handle: Mutex::new(None),
            thread_id: Mutex::new(None),
        })
    }

    /// Start the timer thread
    pub fn start(self: &Arc<Self>, name: &str) -> Result<(), TaskVmError> {
        let mut handle_slot = self.handle.lock();
        if handle_slot.is_some() {
            return Ok(());
        }

        let timer = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || timer.run_loop())
            .map_err(|source| TaskVmError::Spawn {
                name: name.to_string(),
                source,
            })?;

        *self.thread_id.lock() = Some(handle.thread().id());
        *handle_slot = Some(handle);
        Ok(())
    }

    /// Stop the timer thread. Pending sleeps complete immediately.
    pub fn stop(&self) {
        {
            let _state = self.state.lock();
            if self.shutdown.swap(true, AtomicOrdering::AcqRel) {
                return;
            }
            self.notify.notify_one();
        }

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if Some(thread::current().id()) != *self.thread_id.lock() {
                let _ = handle.join();
            }
        }

        // Sleeps registered on a timer that never started are released here
        self.fire_all();
    }

    /// Whether [`TimerService::stop`] has been called
    pub fn is_stopped(&self) -> bool {
        self.shutdown.load(AtomicOrdering::Acquire)
    }

    /// Future that completes after `duration`
    pub fn sleep(self: &Arc<Self>, duration: Duration) -> Sleep {
        self.sleep_until(Instant::now() + duration)
    }

    /// Future that completes at `deadline`
    pub fn sleep_until(self: &Arc<Self>, deadline: Instant) -> Sleep {
        Sleep {
            deadline,
            timer: Arc::clone(self),
            slot: None,
        }
    }

    /// Register a slot to fire at a specific time. Returns false after shutdown.
    fn register(&self, wake_at: Instant, slot: Arc<SleepSlot>) -> bool {
        let mut state = self.state.lock();
        if self.shutdown.load(AtomicOrdering::Acquire) {
            return false;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.sleeping.push(SleepEntry { wake_at, seq, slot });
        // It might need to wake earlier than currently scheduled
        self.notify.notify_one();
        true
    }

    /// Timer thread main loop
    fn run_loop(&self) {
        log::debug!("timer thread started");
        let mut due = Vec::new();

        loop {
            {
                let mut state = self.state.lock();

                // Checked under the lock so a stop() notification cannot be lost
                if self.shutdown.load(AtomicOrdering::Acquire) {
                    break;
                }

                let now = Instant::now();
                while state
                    .sleeping
                    .peek()
                    .is_some_and(|entry| entry.wake_at <= now)
                {
                    if let Some(entry) = state.sleeping.pop() {
                        due.push(entry.slot);
                    }
                }

                if due.is_empty() {
                    match state.sleeping.peek().map(|entry| entry.wake_at) {
                        // Wakes early if a new entry is added
                        Some(next) => {
                            self.notify.wait_until(&mut state, next);
                        }
                        None => self.notify.wait(&mut state),
                    }
                    continue;
                }
            }

            // Wakers post into dispatch queues, never under the timer lock
            for slot in due.drain(..) {
                slot.fire();
            }
        }

        self.fire_all();
        log::debug!("timer thread shutting down");
    }

    fn fire_all(&self) {
        let pending: Vec<_> = self.state.lock().sleeping.drain().collect();
        for entry in pending {
            entry.slot.fire();
        }
    }

    /// Number of pending sleeps
    pub fn sleeping_count(&self) -> usize {
        self.state.lock().sleeping.len()
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Future returned by [`TimerService::sleep`]
pub struct Sleep {
    deadline: Instant,
    timer: Arc<TimerService>,
    slot: Option<Arc<SleepSlot>>,
}

impl Sleep {
    /// When this sleep completes
    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if Instant::now() >= self.deadline {
            return Poll::Ready(());
        }

        match &self.slot {
            Some(slot) => {
                let mut state = slot.state.lock();
                if state.fired {
                    return Poll::Ready(());
                }
                match &state.waker {
                    Some(waker) if waker.will_wake(cx.waker()) => {}
                    _ => state.waker = Some(cx.waker().clone()),
                }
                Poll::Pending
            }
            None => {
                let slot = SleepSlot::new(cx.waker().clone());
                if !self.timer.register(self.deadline, Arc::clone(&slot)) {
                    return Poll::Ready(());
                }
                self.slot = Some(slot);
                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::task::Wake;

    struct CountingWaker(AtomicUsize);

    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, AtomicOrdering::SeqCst);
        }
    }

    fn counting_waker() -> (Arc<CountingWaker>, Waker) {
        let counter = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let waker = Waker::from(Arc::clone(&counter));
        (counter, waker)
    }

    #[test]
    fn test_timer_creation() {
        let timer = TimerService::new();
        assert_eq!(timer.sleeping_count(), 0);
        assert!(!timer.is_stopped());
    }

    #[test]
    fn test_sleep_registers_on_first_poll() {
        let timer = TimerService::new();
        let (_counter, waker) = counting_waker();
        let mut cx = Context::from_waker(&waker);

        let mut sleep = timer.sleep(Duration::from_secs(60));
        assert!(Pin::new(&mut sleep).poll(&mut cx).is_pending());
        assert_eq!(timer.sleeping_count(), 1);

        // Re-polling does not register twice
        assert!(Pin::new(&mut sleep).poll(&mut cx).is_pending());
        assert_eq!(timer.sleeping_count(), 1);
    }

    #[test]
    fn test_timer_fires_waker() {
        let timer = TimerService::new();
        timer.start("taskvm-timer-test").unwrap();

        let (counter, waker) = counting_waker();
        let mut cx = Context::from_waker(&waker);
        let mut sleep = timer.sleep(Duration::from_millis(30));
        assert!(Pin::new(&mut sleep).poll(&mut cx).is_pending());

        thread::sleep(Duration::from_millis(150));

        assert_eq!(counter.0.load(AtomicOrdering::SeqCst), 1);
        assert!(Pin::new(&mut sleep).poll(&mut cx).is_ready());

        timer.stop();
    }

    #[test]
    fn test_timer_multiple_sleeps() {
        let timer = TimerService::new();
        timer.start("taskvm-timer-test").unwrap();

        let (counter, waker) = counting_waker();
        let mut cx = Context::from_waker(&waker);
        let mut sleeps = vec![
            timer.sleep(Duration::from_millis(90)),
            timer.sleep(Duration::from_millis(30)),
            timer.sleep(Duration::from_millis(60)),
        ];
        for sleep in &mut sleeps {
            assert!(Pin::new(sleep).poll(&mut cx).is_pending());
        }

        thread::sleep(Duration::from_millis(250));

        assert_eq!(counter.0.load(AtomicOrdering::SeqCst), 3);
        assert_eq!(timer.sleeping_count(), 0);

        timer.stop();
    }

    #[test]
    fn test_timer_stop_releases_sleepers() {
        let timer = TimerService::new();
        timer.start("taskvm-timer-test").unwrap();

        let (counter, waker) = counting_waker();
        let mut cx = Context::from_waker(&waker);
        let mut sleep = timer.sleep(Duration::from_secs(60));
        assert!(Pin::new(&mut sleep).poll(&mut cx).is_pending());

        timer.stop();

        assert_eq!(counter.0.load(AtomicOrdering::SeqCst), 1);
        assert!(Pin::new(&mut sleep).poll(&mut cx).is_ready());
    }

    #[test]
    fn test_sleep_after_stop_is_ready() {
        let timer = TimerService::new();
        timer.stop();

        let (_counter, waker) = counting_waker();
        let mut cx = Context::from_waker(&waker);
        let mut sleep = timer.sleep(Duration::from_secs(60));
        assert!(Pin::new(&mut sleep).poll(&mut cx).is_ready());
    }
}
