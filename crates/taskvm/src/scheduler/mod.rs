//! Continuation scheduling
//!
//! Every resumption produced by a root function is a [`Continuation`] handed
//! to a [`Scheduler`]. Two schedulers exist: [`VmScheduler`] delivers into the
//! owning instance's [`DispatchQueue`] and falls back to the [`OrphanPump`]
//! once that queue has closed; [`PumpScheduler`] posts straight to the pump.

mod continuation;
mod pump;
mod queue;
mod vm_scheduler;

pub use continuation::Continuation;
pub use pump::{OrphanPump, PumpScheduler, PumpStats};
pub use queue::{DispatchQueue, Route};
pub use vm_scheduler::VmScheduler;

pub(crate) use continuation::panic_message;

/// Receives "resume this continuation" requests
pub trait Scheduler: Send + Sync {
    /// Deliver a continuation for execution. Never blocks on the work itself
    /// and never discards the continuation.
    fn schedule(&self, continuation: Continuation);

    /// An asynchronous step has started (observability only)
    fn operation_started(&self) {}

    /// An asynchronous step has finished (observability only)
    fn operation_completed(&self) {}
}
