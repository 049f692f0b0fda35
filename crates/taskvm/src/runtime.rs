//! Process-wide services shared by VM instances
//!
//! A [`Runtime`] owns the orphan pump and the timer thread. Every instance
//! started from it forwards late continuations to the same pump.

use crate::config::TaskVmConfig;
use crate::error::TaskVmError;
use crate::scheduler::OrphanPump;
use crate::timer::TimerService;
use crate::vm::{StartOptions, VmContext, VmInstance};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared services for VM instances
pub struct Runtime {
    config: Arc<TaskVmConfig>,
    pump: Arc<OrphanPump>,
    timer: Arc<TimerService>,
    shut_down: AtomicBool,
}

impl Runtime {
    /// Validate `config` and start the pump and timer threads
    pub fn new(config: TaskVmConfig) -> Result<Self, TaskVmError> {
        config.validate()?;

        let pump = OrphanPump::start(&config.pump_thread_name)?;
        let timer = TimerService::new();
        if let Err(err) = timer.start(&config.timer_thread_name) {
            pump.shutdown();
            return Err(err);
        }

        log::debug!(
            "runtime started (pump: {}, timer: {})",
            config.pump_thread_name,
            config.timer_thread_name
        );

        Ok(Self {
            config: Arc::new(config),
            pump,
            timer,
            shut_down: AtomicBool::new(false),
        })
    }

    /// Active configuration
    pub fn config(&self) -> &TaskVmConfig {
        &self.config
    }

    /// The orphan pump
    pub fn pump(&self) -> &Arc<OrphanPump> {
        &self.pump
    }

    /// The timer service
    pub fn timer(&self) -> &Arc<TimerService> {
        &self.timer
    }

    /// Start `root_fn(ctx, input)` on a new instance with no cancellation tokens
    pub fn spawn<T, E, I, F, Fut>(&self, root_fn: F, input: I) -> Result<VmInstance<T, E>, TaskVmError>
    where
        T: Send + 'static,
        E: Send + Sync + 'static,
        I: Send + 'static,
        F: FnOnce(VmContext, I) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        VmInstance::start(self, root_fn, input, StartOptions::default())
    }

    /// Whether [`Runtime::shutdown`] has been called
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Stop the timer and the pump.
    ///
    /// Pending sleeps complete immediately and queued orphans run before the
    /// pump exits. Continuations forwarded afterwards run on the posting
    /// thread. Instances already started keep running.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.timer.stop();
        self.pump.shutdown();
        log::debug!("runtime shut down");
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}
