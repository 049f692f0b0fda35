//! Deferred units of work

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

/// "Resume this suspended step"
///
/// The callback owns whatever argument it needs; executing it consumes it.
pub struct Continuation {
    callback: Box<dyn FnOnce() + Send + 'static>,
}

impl Continuation {
    /// Wrap a callback
    pub fn new<F>(callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            callback: Box::new(callback),
        }
    }

    /// Execute the callback on the current thread
    pub fn run(self) {
        (self.callback)()
    }

    /// Execute the callback, converting a panic into its message
    pub(crate) fn run_guarded(self) -> Result<(), String> {
        let callback = self.callback;
        panic::catch_unwind(AssertUnwindSafe(move || callback()))
            .map_err(|payload| panic_message(payload.as_ref()))
    }
}

impl fmt::Debug for Continuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Continuation")
    }
}

/// Render a panic payload as text
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
