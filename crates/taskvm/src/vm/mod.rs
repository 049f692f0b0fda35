//! Thread-hosted VM instances
//!
//! A [`VmInstance`] owns one dedicated thread running a dispatcher loop. The
//! root future is polled only from continuations, so each resumption runs on
//! that thread while the dispatch queue is open.

mod context;
mod instance;
mod result;
mod root;

pub use context::{Tracked, VmContext, YieldNow};
pub use instance::{StartOptions, VmInstance};
pub use result::{Outcome, ResultBox};

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for a VM instance
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VmId(u64);

static NEXT_VM_ID: AtomicU64 = AtomicU64::new(1);

impl VmId {
    /// Generate a new unique VmId
    pub fn new() -> Self {
        VmId(NEXT_VM_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for VmId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
