//! TaskVm: thread-hosted task execution engine
//!
//! A [`VmInstance`] runs one root future to completion on its own dedicated
//! thread. Every resumption the future generates is routed back to that thread
//! through the instance's [`VmScheduler`], and callers on other threads get a
//! blocking handle to the outcome:
//! - **VM**: dispatcher loop, result box, abort path (`vm` module)
//! - **Scheduler**: continuations, dispatch queues, orphan pump (`scheduler` module)
//! - **Runtime**: the shared services every instance is started against
//!
//! # Example
//!
//! ```rust,ignore
//! use taskvm::{Runtime, TaskVmConfig, VmInstance, StartOptions};
//! use std::time::Duration;
//!
//! let runtime = Runtime::new(TaskVmConfig::default())?;
//! let vm = VmInstance::start(
//!     &runtime,
//!     |ctx, x: u32| async move {
//!         ctx.sleep(Duration::from_millis(50)).await;
//!         Ok::<_, std::io::Error>(x * 2)
//!     },
//!     21,
//!     StartOptions::default(),
//! )?;
//! assert_eq!(vm.get_result(None, None)?, Some(42));
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod cancel;
pub mod config;
pub mod error;
pub mod runtime;
pub mod scheduler;
pub mod timer;
pub mod vm;

pub use cancel::{CancelRegistration, CancelToken, Cancelled};
pub use config::TaskVmConfig;
pub use error::{ConfigError, ContinuationFault, TaskError, TaskVmError};
pub use runtime::Runtime;
pub use scheduler::{Continuation, DispatchQueue, OrphanPump, PumpStats, Scheduler, VmScheduler};
pub use timer::{Sleep, TimerService};
pub use vm::{Outcome, ResultBox, StartOptions, VmContext, VmId, VmInstance, YieldNow};
