//! Runtime configuration

use strand_core::constants::{DEFAULT_STACK_SIZE, MAX_WORKERS};
use strand_core::env::env_get;
use strand_core::error::{RuntimeError, RuntimeResult};

/// Configuration for an I/O manager.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Total threads serving the scheduler (including the caller when
    /// `use_caller` is set)
    pub threads: usize,

    /// Whether the constructing thread participates as a worker
    pub use_caller: bool,

    /// Scheduler name; worker threads are named `{name}_{i}`
    pub name: String,

    /// Stack size for every coroutine the scheduler creates
    pub stack_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            threads: 1,
            use_caller: true,
            name: "strand".to_string(),
            stack_size: env_get("STRAND_STACK_SIZE", DEFAULT_STACK_SIZE),
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn threads(mut self, n: usize) -> Self {
        self.threads = n;
        self
    }

    pub fn use_caller(mut self, v: bool) -> Self {
        self.use_caller = v;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    pub fn validate(&self) -> RuntimeResult<()> {
        if self.threads == 0 {
            return Err(RuntimeError::Platform(libc::EINVAL));
        }
        if self.threads > MAX_WORKERS {
            return Err(RuntimeError::Platform(libc::EINVAL));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(RuntimeConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_threads_rejected() {
        assert!(RuntimeConfig::default().threads(0).validate().is_err());
    }
}
