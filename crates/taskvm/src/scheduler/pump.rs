//! Orphan continuation pump
//!
//! One background thread per runtime that executes continuations whose origin
//! instance has already closed its dispatch queue. Entries are keyed by the
//! origin's [`VmId`]; removing an origin moves its pending entries into a
//! shared unowned bucket so none are lost.

use super::{Continuation, Scheduler};
use crate::error::{ContinuationFault, TaskVmError};
use crate::vm::VmId;
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

/// Pump statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PumpStats {
    /// Continuations executed by the pump thread
    pub executed: u64,

    /// Continuations that panicked
    pub faults: u64,

    /// Origins that currently have a queue
    pub origins: usize,

    /// Entries waiting to run (per-origin plus unowned)
    pub pending: usize,
}

struct PumpState {
    origins: FxHashMap<VmId, VecDeque<Continuation>>,
    unowned: VecDeque<(VmId, Continuation)>,
    /// New work since the last snapshot
    pending: bool,
    shutdown: bool,
}

struct PumpShared {
    state: Mutex<PumpState>,
    signal: Condvar,
    executed: AtomicU64,
    faults: AtomicU64,
}

/// Background executor for continuations whose instance has shut down
pub struct OrphanPump {
    shared: Arc<PumpShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
    thread_id: Option<ThreadId>,
}

impl OrphanPump {
    /// Create the pump and start its thread
    pub fn start(thread_name: &str) -> Result<Arc<Self>, TaskVmError> {
        let shared = Arc::new(PumpShared {
            state: Mutex::new(PumpState {
                origins: FxHashMap::default(),
                unowned: VecDeque::new(),
                pending: false,
                shutdown: false,
            }),
            signal: Condvar::new(),
            executed: AtomicU64::new(0),
            faults: AtomicU64::new(0),
        });

        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(thread_name.to_string())
            .spawn(move || Self::run_loop(&worker))
            .map_err(|source| TaskVmError::Spawn {
                name: thread_name.to_string(),
                source,
            })?;

        Ok(Arc::new(Self {
            shared,
            thread_id: Some(handle.thread().id()),
            handle: Mutex::new(Some(handle)),
        }))
    }

    /// Queue `continuation` under `origin` and wake the pump thread.
    ///
    /// After shutdown the continuation is handed back to the caller, which
    /// must run it itself.
    pub fn post_action(&self, origin: VmId, continuation: Continuation) -> Result<(), Continuation> {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return Err(continuation);
        }
        state.origins.entry(origin).or_default().push_back(continuation);
        state.pending = true;
        self.shared.signal.notify_one();
        Ok(())
    }

    /// Forget `origin`. Entries still queued under it move to the unowned
    /// bucket and run on the next pass.
    pub fn remove_context(&self, origin: VmId) {
        let mut state = self.shared.state.lock();
        let Some(entries) = state.origins.remove(&origin) else {
            return;
        };
        if entries.is_empty() {
            return;
        }

        log::trace!("pump: moving {} entries of vm {} to unowned", entries.len(), origin);
        state.unowned.extend(entries.into_iter().map(|c| (origin, c)));
        state.pending = true;
        self.shared.signal.notify_one();
    }

    /// Scheduler that posts straight to this pump under `origin`
    pub fn scheduler(self: &Arc<Self>, origin: VmId) -> PumpScheduler {
        PumpScheduler {
            pump: Arc::clone(self),
            origin,
        }
    }

    /// Whether the pump is still accepting work
    pub fn is_running(&self) -> bool {
        !self.shared.state.lock().shutdown
    }

    /// Whether the current thread is the pump thread
    pub fn is_pump_thread(&self) -> bool {
        self.thread_id == Some(thread::current().id())
    }

    /// Current statistics
    pub fn stats(&self) -> PumpStats {
        let state = self.shared.state.lock();
        PumpStats {
            executed: self.shared.executed.load(Ordering::Relaxed),
            faults: self.shared.faults.load(Ordering::Relaxed),
            origins: state.origins.len(),
            pending: state.unowned.len()
                + state.origins.values().map(VecDeque::len).sum::<usize>(),
        }
    }

    /// Stop accepting work, run everything already queued, and join the
    /// pump thread (unless called from the pump thread itself).
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            self.shared.signal.notify_one();
        }

        if self.is_pump_thread() {
            return;
        }
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }

    /// Pump thread main loop
    fn run_loop(shared: &PumpShared) {
        log::debug!("orphan pump started");

        loop {
            let batch = {
                let mut state = shared.state.lock();
                while !state.pending && !state.shutdown {
                    shared.signal.wait(&mut state);
                }
                if !state.pending {
                    break;
                }
                state.pending = false;

                // Unowned entries are older than anything still keyed
                let mut batch: Vec<(VmId, Continuation)> = state.unowned.drain(..).collect();
                for (origin, entries) in state.origins.iter_mut() {
                    batch.extend(entries.drain(..).map(|c| (*origin, c)));
                }
                batch
            };

            log::trace!("pump: executing {} orphaned continuations", batch.len());
            for (origin, continuation) in batch {
                shared.executed.fetch_add(1, Ordering::Relaxed);
                if let Err(message) = continuation.run_guarded() {
                    shared.faults.fetch_add(1, Ordering::Relaxed);
                    let fault = ContinuationFault { origin, message };
                    log::error!("{}", fault);
                }
            }
        }

        log::debug!("orphan pump shutting down");
    }
}

impl Drop for OrphanPump {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// [`Scheduler`] bound to one origin key of an [`OrphanPump`]
pub struct PumpScheduler {
    pump: Arc<OrphanPump>,
    origin: VmId,
}

impl PumpScheduler {
    /// Origin key this scheduler posts under
    pub fn origin(&self) -> VmId {
        self.origin
    }
}

impl Scheduler for PumpScheduler {
    fn schedule(&self, continuation: Continuation) {
        if let Err(continuation) = self.pump.post_action(self.origin, continuation) {
            log::warn!("pump stopped; running continuation of vm {} inline", self.origin);
            if let Err(message) = continuation.run_guarded() {
                log::error!("{}", ContinuationFault { origin: self.origin, message });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    fn counter_continuation(counter: &Arc<AtomicUsize>) -> Continuation {
        let counter = counter.clone();
        Continuation::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        done()
    }

    #[test]
    fn test_post_action_executes_once() {
        let pump = OrphanPump::start("taskvm-pump-test").unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        pump.post_action(VmId::new(), counter_continuation(&counter))
            .unwrap();

        assert!(wait_until(Duration::from_secs(1), || counter.load(Ordering::SeqCst) == 1));
        thread::sleep(Duration::from_millis(30));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(pump.stats().executed, 1);
    }

    #[test]
    fn test_runs_on_pump_thread() {
        let pump = OrphanPump::start("taskvm-pump-test").unwrap();
        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        pump.post_action(
            VmId::new(),
            Continuation::new(move || {
                *s.lock() = thread::current().name().map(str::to_string);
            }),
        )
        .unwrap();

        assert!(wait_until(Duration::from_secs(1), || seen.lock().is_some()));
        assert_eq!(seen.lock().as_deref(), Some("taskvm-pump-test"));
    }

    #[test]
    fn test_per_origin_fifo() {
        let pump = OrphanPump::start("taskvm-pump-test").unwrap();
        let origin = VmId::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..20 {
            let log = log.clone();
            pump.post_action(origin, Continuation::new(move || log.lock().push(i)))
                .unwrap();
        }

        assert!(wait_until(Duration::from_secs(1), || log.lock().len() == 20));
        assert_eq!(*log.lock(), (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_fault_does_not_stop_pump() {
        let pump = OrphanPump::start("taskvm-pump-test").unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let origin = VmId::new();

        pump.post_action(origin, Continuation::new(|| panic!("handshake failed")))
            .unwrap();
        pump.post_action(origin, counter_continuation(&counter))
            .unwrap();

        assert!(wait_until(Duration::from_secs(1), || counter.load(Ordering::SeqCst) == 1));
        let stats = pump.stats();
        assert_eq!(stats.executed, 2);
        assert_eq!(stats.faults, 1);
    }

    #[test]
    fn test_remove_context_keeps_entries() {
        let pump = OrphanPump::start("taskvm-pump-test").unwrap();
        let origin = VmId::new();
        let counter = Arc::new(AtomicUsize::new(0));

        // Hold the pump thread busy so entries pile up under the origin
        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        let g = gate.clone();
        pump.post_action(
            VmId::new(),
            Continuation::new(move || {
                let (open, signal) = &*g;
                let mut open = open.lock();
                while !*open {
                    signal.wait(&mut open);
                }
            }),
        )
        .unwrap();
        thread::sleep(Duration::from_millis(20));

        const K: usize = 7;
        for _ in 0..K {
            pump.post_action(origin, counter_continuation(&counter))
                .unwrap();
        }
        pump.remove_context(origin);

        {
            let (open, signal) = &*gate;
            *open.lock() = true;
            signal.notify_all();
        }

        assert!(wait_until(Duration::from_secs(1), || counter.load(Ordering::SeqCst) == K));
        thread::sleep(Duration::from_millis(30));
        assert_eq!(counter.load(Ordering::SeqCst), K);
    }

    #[test]
    fn test_shutdown_drains_pending() {
        let pump = OrphanPump::start("taskvm-pump-test").unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            pump.post_action(VmId::new(), counter_continuation(&counter))
                .unwrap();
        }

        pump.shutdown();

        assert_eq!(counter.load(Ordering::SeqCst), 10);
        assert!(!pump.is_running());
        assert!(pump.post_action(VmId::new(), counter_continuation(&counter)).is_err());
    }

    #[test]
    fn test_pump_scheduler_runs_inline_after_shutdown() {
        let pump = OrphanPump::start("taskvm-pump-test").unwrap();
        let scheduler = pump.scheduler(VmId::new());
        pump.shutdown();

        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.schedule(counter_continuation(&counter));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
