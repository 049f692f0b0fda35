//! Runtime configuration

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration shared by a [`crate::Runtime`] and the instances it starts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskVmConfig {
    /// Prefix for dedicated VM thread names (`{prefix}-{id}`)
    pub thread_name_prefix: String,

    /// Stack size for dedicated VM threads in bytes (None = platform default)
    pub stack_size: Option<usize>,

    /// How long `VmInstance::start` waits for the init handshake
    pub init_timeout_ms: u64,

    /// Name of the orphan pump thread
    pub pump_thread_name: String,

    /// Name of the timer thread
    pub timer_thread_name: String,
}

impl Default for TaskVmConfig {
    fn default() -> Self {
        Self {
            thread_name_prefix: "taskvm".to_string(),
            stack_size: None,
            init_timeout_ms: 5_000,
            pump_thread_name: "taskvm-orphan-pump".to_string(),
            timer_thread_name: "taskvm-timer".to_string(),
        }
    }
}

impl TaskVmConfig {
    /// Parse a config from JSON. Missing fields take their defaults.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.init_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "init_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if let Some(size) = self.stack_size {
            // Below this the dispatcher itself cannot run reliably
            if size < 64 * 1024 {
                return Err(ConfigError::Invalid(format!(
                    "stack_size {} is below the 64 KiB minimum",
                    size
                )));
            }
        }
        if self.thread_name_prefix.is_empty() {
            return Err(ConfigError::Invalid(
                "thread_name_prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Init handshake timeout as a duration
    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }
}
