//! Dedicated-thread VM instance and its dispatcher loop

use super::context::VmContext;
use super::result::{Outcome, ResultBox};
use super::root::RootTask;
use super::VmId;
use crate::cancel::{CancelRegistration, CancelToken};
use crate::error::{ContinuationFault, TaskError, TaskVmError};
use crate::runtime::Runtime;
use crate::scheduler::{panic_message, Continuation, DispatchQueue, VmScheduler};
use crossbeam::channel::{self, RecvTimeoutError};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

/// Cancellation tokens supplied at start
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Handed to the root function through [`VmContext::graceful_cancel`]
    pub graceful_cancel: Option<CancelToken>,

    /// Firing this token calls `abort(true)` on the instance
    pub abort_cancel: Option<CancelToken>,
}

/// Fired once the dedicated thread has left its dispatcher loop
struct ExitSignal {
    exited: Mutex<bool>,
    signal: Condvar,
}

impl ExitSignal {
    fn new() -> Self {
        Self {
            exited: Mutex::new(false),
            signal: Condvar::new(),
        }
    }

    fn fire(&self) {
        let mut exited = self.exited.lock();
        *exited = true;
        self.signal.notify_all();
    }

    fn is_fired(&self) -> bool {
        *self.exited.lock()
    }

    fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut exited = self.exited.lock();
        while !*exited {
            match deadline {
                Some(deadline) => {
                    if self.signal.wait_until(&mut exited, deadline).timed_out() {
                        break;
                    }
                }
                None => self.signal.wait(&mut exited),
            }
        }
        *exited
    }
}

/// State shared between the handle, the dedicated thread and abort callbacks
struct VmShared<T, E> {
    id: VmId,
    result: Arc<ResultBox<T, E>>,
    queue: Arc<DispatchQueue>,
    abort_requested: Arc<AtomicBool>,
    exit: ExitSignal,
    thread_id: Mutex<Option<ThreadId>>,
}

impl<T, E> VmShared<T, E> {
    fn request_abort(&self) {
        if !self.abort_requested.swap(true, Ordering::AcqRel) {
            log::debug!("vm {}: abort requested", self.id);
        }
        self.queue.notify();
    }

    fn is_vm_thread(&self) -> bool {
        *self.thread_id.lock() == Some(thread::current().id())
    }
}

/// Handle to a root function running on its own dedicated thread
///
/// `T` is the root function's value type and `E` its error type. The handle
/// can be shared across threads; dropping it does not stop the instance.
pub struct VmInstance<T, E> {
    shared: Arc<VmShared<T, E>>,
}

impl<T, E> VmInstance<T, E>
where
    T: Send + 'static,
    E: Send + Sync + 'static,
{
    /// Spawn the dedicated thread and run `root_fn(ctx, input)` on it.
    ///
    /// Blocks until the thread has installed its scheduler and is entering its
    /// dispatcher loop.
    pub fn start<I, F, Fut>(
        runtime: &Runtime,
        root_fn: F,
        input: I,
        options: StartOptions,
    ) -> Result<Self, TaskVmError>
    where
        I: Send + 'static,
        F: FnOnce(VmContext, I) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        if runtime.is_shut_down() {
            return Err(TaskVmError::RuntimeShutDown);
        }

        let id = VmId::new();
        let config = runtime.config();
        let shared = Arc::new(VmShared {
            id,
            result: Arc::new(ResultBox::new()),
            queue: Arc::new(DispatchQueue::new()),
            abort_requested: Arc::new(AtomicBool::new(false)),
            exit: ExitSignal::new(),
            thread_id: Mutex::new(None),
        });

        // Owned by the dedicated thread so it lives exactly as long as the loop
        let abort_registration = options.abort_cancel.as_ref().map(|token| {
            let weak: Weak<VmShared<T, E>> = Arc::downgrade(&shared);
            token.register(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.request_abort();
                }
            })
        });

        let (ready_tx, ready_rx) = channel::bounded::<()>(1);
        let thread_name = format!("{}-{}", config.thread_name_prefix, id.as_u64());
        let mut builder = thread::Builder::new().name(thread_name.clone());
        if let Some(size) = config.stack_size {
            builder = builder.stack_size(size);
        }

        let thread_shared = Arc::clone(&shared);
        let pump = Arc::clone(runtime.pump());
        let timer = Arc::clone(runtime.timer());
        let graceful_cancel = options.graceful_cancel.unwrap_or_default();

        let handle = builder
            .spawn(move || {
                let _abort_registration: Option<CancelRegistration> = abort_registration;
                let scheduler = Arc::new(VmScheduler::new(
                    thread_shared.id,
                    Arc::clone(&thread_shared.queue),
                    pump,
                ));
                let ctx = VmContext::new(
                    Arc::clone(&scheduler),
                    timer,
                    graceful_cancel,
                    Arc::clone(&thread_shared.abort_requested),
                );

                let launch_scheduler = Arc::clone(&scheduler);
                let launch_result = Arc::clone(&thread_shared.result);
                scheduler.post(Continuation::new(move || {
                    launch(root_fn, ctx, input, launch_scheduler, launch_result)
                }));

                signal_ready(thread_shared.id, ready_tx);

                run_dispatcher(&thread_shared);
                drop(scheduler);
                thread_shared.exit.fire();
                log::debug!("vm {}: thread exited", thread_shared.id);
            })
            .map_err(|source| TaskVmError::Spawn {
                name: thread_name,
                source,
            })?;

        *shared.thread_id.lock() = Some(handle.thread().id());
        // The thread is never joined; the exit signal replaces it
        drop(handle);

        match ready_rx.recv_timeout(config.init_timeout()) {
            Ok(()) => {}
            Err(RecvTimeoutError::Timeout) => {
                shared.request_abort();
                return Err(TaskVmError::InitTimeout(config.init_timeout()));
            }
            Err(RecvTimeoutError::Disconnected) => return Err(TaskVmError::InitFailed),
        }

        log::debug!("vm {}: started", id);
        Ok(Self { shared })
    }

    /// Instance identity
    pub fn id(&self) -> VmId {
        self.shared.id
    }

    /// Block until the instance is terminal, `timeout` elapses or `cancel`
    /// fires.
    ///
    /// Returns `Ok(None)` when the wait ended before a terminal state; the
    /// instance keeps running.
    pub fn get_result(
        &self,
        timeout: Option<Duration>,
        cancel: Option<&CancelToken>,
    ) -> Result<Option<T>, TaskError<E>>
    where
        T: Clone,
    {
        if !self.shared.result.wait(timeout, cancel) {
            return Ok(None);
        }
        match self.shared.result.snapshot() {
            Some(Ok(value)) => Ok(Some(value)),
            Some(Err(err)) => Err(err),
            None => Ok(None),
        }
    }

    /// Like [`VmInstance::get_result`], but a failure yields `T::default()`.
    /// [`VmInstance::has_error`] still reports the failure.
    pub fn get_result_ignore_errors(
        &self,
        timeout: Option<Duration>,
        cancel: Option<&CancelToken>,
    ) -> Option<T>
    where
        T: Clone + Default,
    {
        match self.get_result(timeout, cancel) {
            Ok(value) => value,
            Err(_) => Some(T::default()),
        }
    }

    /// Block until terminal, `timeout` or `cancel`. Returns whether terminal.
    pub fn wait(&self, timeout: Option<Duration>, cancel: Option<&CancelToken>) -> bool {
        self.shared.result.wait(timeout, cancel)
    }

    /// Request cooperative termination.
    ///
    /// The dispatcher finalizes the instance as aborted at its next wake unless
    /// it is already terminal; a continuation already running is not
    /// interrupted. Unless `no_wait`, blocks until the dedicated thread exits.
    /// Calling this again has no further effect on the instance's state.
    pub fn abort(&self, no_wait: bool) {
        self.shared.request_abort();
        if no_wait {
            return;
        }
        if self.shared.is_vm_thread() {
            log::warn!("vm {}: abort(no_wait = false) from its own thread, not waiting", self.shared.id);
            return;
        }
        self.shared.exit.wait(None);
    }

    /// Block until the dedicated thread has exited or `timeout` elapses
    pub fn wait_thread_exit(&self, timeout: Option<Duration>) -> bool {
        self.shared.exit.wait(timeout)
    }

    /// Whether the instance reached a terminal state
    pub fn is_completed(&self) -> bool {
        self.shared.result.is_completed()
    }

    /// Whether the terminal state is the abort marker
    pub fn is_aborted(&self) -> bool {
        self.shared.result.is_aborted()
    }

    /// Whether the terminal state is a failure (including abort)
    pub fn has_error(&self) -> bool {
        self.shared.result.has_error()
    }

    /// The terminal failure, if any
    pub fn error(&self) -> Option<TaskError<E>> {
        self.shared.result.error()
    }

    /// The terminal value, if any
    pub fn result(&self) -> Option<T>
    where
        T: Clone,
    {
        self.shared.result.value()
    }

    /// Whether `abort` has been requested
    pub fn is_abort_requested(&self) -> bool {
        self.shared.abort_requested.load(Ordering::Acquire)
    }

    /// Whether the dedicated thread has exited
    pub fn is_thread_exited(&self) -> bool {
        self.shared.exit.is_fired()
    }
}

impl<T, E> Clone for VmInstance<T, E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Complete the init handshake. Returns false if the starter already gave up
/// waiting (its init timeout elapsed).
fn signal_ready(id: VmId, ready: channel::Sender<()>) -> bool {
    match ready.send(()) {
        Ok(()) => true,
        Err(_) => {
            log::debug!("vm {}: starter gave up before the handshake", id);
            false
        }
    }
}

/// First continuation of every instance: build the root future and hand it
/// to a [`RootTask`]. A panic while building it is the root's failure.
fn launch<T, E, I, F, Fut>(
    root_fn: F,
    ctx: VmContext,
    input: I,
    scheduler: Arc<VmScheduler>,
    result: Arc<ResultBox<T, E>>,
) where
    T: Send + 'static,
    E: Send + Sync + 'static,
    F: FnOnce(VmContext, I) -> Fut,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
{
    match panic::catch_unwind(AssertUnwindSafe(move || root_fn(ctx, input))) {
        Ok(future) => RootTask::launch(future, scheduler, result),
        Err(payload) => {
            result.try_complete(Outcome::Failed(TaskError::Panicked(panic_message(
                payload.as_ref(),
            ))));
        }
    }
}

/// The dispatcher loop
///
/// Drains the queue in FIFO order until the instance is terminal and the
/// queue is observed empty under its lock, then closes it. Everything accepted
/// while open therefore runs on this thread; later posts go to the pump.
fn run_dispatcher<T, E>(shared: &VmShared<T, E>)
where
    T: Send + 'static,
    E: Send + Sync + 'static,
{
    let id = shared.id;
    let mut batch = VecDeque::new();

    loop {
        shared.queue.wait_and_take(&mut batch);

        if shared.abort_requested.load(Ordering::Acquire)
            && shared.result.try_complete(Outcome::Failed(TaskError::Aborted))
        {
            log::debug!("vm {}: finalized as aborted", id);
        }

        run_batch(id, &mut batch);

        if shared.result.is_completed() && shared.queue.close_if_empty() {
            break;
        }
    }
    log::debug!("vm {}: dispatch queue closed", id);
}

fn run_batch(id: VmId, batch: &mut VecDeque<Continuation>) {
    if batch.is_empty() {
        return;
    }
    log::trace!("vm {}: dispatching {} continuations", id, batch.len());
    while let Some(continuation) = batch.pop_front() {
        if let Err(message) = continuation.run_guarded() {
            log::error!("{}", ContinuationFault { origin: id, message });
        }
    }
}
