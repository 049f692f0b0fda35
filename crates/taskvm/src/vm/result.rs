//! Single-assignment result holder
//!
//! The terminal flag and the stored value are the same `Option` behind one
//! mutex, so a reader can never observe "completed" without the outcome.

use crate::cancel::CancelToken;
use crate::error::TaskError;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Terminal outcome of an instance
pub enum Outcome<T, E> {
    /// The root function returned a value
    Value(T),
    /// The root function failed, panicked, or the instance was aborted
    Failed(TaskError<E>),
}

impl<T, E> Outcome<T, E> {
    /// Map a root function's return value
    pub fn from_result(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => Outcome::Value(value),
            Err(err) => Outcome::Failed(TaskError::User(Arc::new(err))),
        }
    }
}

/// Outcome slot plus completion signal
pub struct ResultBox<T, E> {
    slot: Mutex<Option<Outcome<T, E>>>,
    signal: Condvar,
}

impl<T, E> ResultBox<T, E> {
    /// Create an empty box
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            signal: Condvar::new(),
        }
    }

    /// Store `outcome` and wake all waiters, unless an outcome is already
    /// stored. Returns whether this call won.
    pub fn try_complete(&self, outcome: Outcome<T, E>) -> bool {
        let mut slot = self.slot.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(outcome);
        self.signal.notify_all();
        true
    }

    /// Whether an outcome has been stored
    pub fn is_completed(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Whether the stored outcome is the abort marker
    pub fn is_aborted(&self) -> bool {
        matches!(&*self.slot.lock(), Some(Outcome::Failed(TaskError::Aborted)))
    }

    /// Whether the stored outcome is any failure
    pub fn has_error(&self) -> bool {
        matches!(&*self.slot.lock(), Some(Outcome::Failed(_)))
    }

    /// The stored failure, if any
    pub fn error(&self) -> Option<TaskError<E>> {
        match &*self.slot.lock() {
            Some(Outcome::Failed(err)) => Some(err.clone()),
            _ => None,
        }
    }

    /// The stored value, if any
    pub fn value(&self) -> Option<T>
    where
        T: Clone,
    {
        match &*self.slot.lock() {
            Some(Outcome::Value(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// The stored outcome as a `Result`, if completed
    pub fn snapshot(&self) -> Option<Result<T, TaskError<E>>>
    where
        T: Clone,
    {
        match &*self.slot.lock() {
            Some(Outcome::Value(value)) => Some(Ok(value.clone())),
            Some(Outcome::Failed(err)) => Some(Err(err.clone())),
            None => None,
        }
    }

    fn wake_waiters(&self) {
        // Taking the lock orders this wake after a waiter's cancel check
        let _slot = self.slot.lock();
        self.signal.notify_all();
    }
}

impl<T, E> ResultBox<T, E>
where
    T: Send + 'static,
    E: Send + Sync + 'static,
{
    /// Block until completed, `timeout` elapses, or `cancel` fires.
    ///
    /// Returns whether the box is completed. Never changes the outcome.
    pub fn wait(self: &Arc<Self>, timeout: Option<Duration>, cancel: Option<&CancelToken>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let _registration = cancel.map(|token| {
            let this = Arc::clone(self);
            token.register(move || this.wake_waiters())
        });

        let mut slot = self.slot.lock();
        loop {
            if slot.is_some() {
                return true;
            }
            if cancel.is_some_and(CancelToken::is_cancelled) {
                return false;
            }
            match deadline {
                Some(deadline) => {
                    if self.signal.wait_until(&mut slot, deadline).timed_out() {
                        return slot.is_some();
                    }
                }
                None => self.signal.wait(&mut slot),
            }
        }
    }
}

impl<T, E> Default for ResultBox<T, E> {
    fn default() -> Self {
        Self::new()
    }
}
