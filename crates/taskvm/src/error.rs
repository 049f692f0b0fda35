//! Error types
//!
//! Three families that never mix: [`TaskError`] is the terminal outcome of a
//! root function as seen by result callers, [`ContinuationFault`] describes a
//! continuation that panicked (logged, never surfaced), and [`TaskVmError`] /
//! [`ConfigError`] cover the engine's own setup failures.

use crate::vm::VmId;
use std::fmt;
use std::sync::Arc;

/// Terminal failure of a root function
#[derive(thiserror::Error)]
pub enum TaskError<E> {
    /// The root function returned an error
    #[error("{0}")]
    User(Arc<E>),

    /// The root function panicked while being polled
    #[error("root function panicked: {0}")]
    Panicked(String),

    /// The instance was aborted before the root function finished
    #[error("task vm aborted")]
    Aborted,
}

impl<E> TaskError<E> {
    /// Whether this is the abort marker
    pub fn is_aborted(&self) -> bool {
        matches!(self, TaskError::Aborted)
    }

    /// The root function's own error, if that is what this is
    pub fn user_error(&self) -> Option<&E> {
        match self {
            TaskError::User(err) => Some(err),
            _ => None,
        }
    }
}

impl<E> Clone for TaskError<E> {
    fn clone(&self) -> Self {
        match self {
            TaskError::User(err) => TaskError::User(Arc::clone(err)),
            TaskError::Panicked(msg) => TaskError::Panicked(msg.clone()),
            TaskError::Aborted => TaskError::Aborted,
        }
    }
}

impl<E: fmt::Debug> fmt::Debug for TaskError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::User(err) => f.debug_tuple("User").field(err).finish(),
            TaskError::Panicked(msg) => f.debug_tuple("Panicked").field(msg).finish(),
            TaskError::Aborted => f.write_str("Aborted"),
        }
    }
}

/// A continuation panicked while being executed
#[derive(Debug, Clone, thiserror::Error)]
#[error("continuation from vm {origin} panicked: {message}")]
pub struct ContinuationFault {
    /// Instance the continuation was posted against
    pub origin: VmId,
    /// Panic payload rendered as text
    pub message: String,
}

/// Engine errors raised while starting instances or services
#[derive(Debug, thiserror::Error)]
pub enum TaskVmError {
    /// The OS refused to spawn a thread
    #[error("failed to spawn thread '{name}': {source}")]
    Spawn {
        /// Thread name that was requested
        name: String,
        /// Underlying OS error
        source: std::io::Error,
    },

    /// The dedicated thread did not finish its init handshake in time
    #[error("vm thread did not signal readiness within {0:?}")]
    InitTimeout(std::time::Duration),

    /// The dedicated thread exited before finishing its init handshake
    #[error("vm thread exited during initialization")]
    InitFailed,

    /// The runtime has been shut down
    #[error("runtime has been shut down")]
    RuntimeShutDown,

    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Reading the config file failed
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// The config text is not valid JSON for [`crate::TaskVmConfig`]
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// A value is out of range
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("boom")]
    struct Boom;

    #[test]
    fn test_user_error_display_is_verbatim() {
        let err: TaskError<Boom> = TaskError::User(Arc::new(Boom));
        assert_eq!(err.to_string(), "boom");
        assert!(err.user_error().is_some());
        assert!(!err.is_aborted());
    }

    #[test]
    fn test_abort_is_distinct() {
        let err: TaskError<Boom> = TaskError::Aborted;
        assert!(err.is_aborted());
        assert!(err.user_error().is_none());
        assert_eq!(err.to_string(), "task vm aborted");
    }

    #[test]
    fn test_clone_shares_user_error() {
        let err: TaskError<Boom> = TaskError::User(Arc::new(Boom));
        let copy = err.clone();
        match (&err, &copy) {
            (TaskError::User(a), TaskError::User(b)) => assert!(Arc::ptr_eq(a, b)),
            _ => panic!("clone changed variant"),
        }
    }
}
