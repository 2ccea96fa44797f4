//! # strand-core
//!
//! Core types for the strand coroutine runtime.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! All platform-specific implementations live in `strand-runtime`.
//!
//! ## Modules
//!
//! - `id` - coroutine identifier type
//! - `state` - coroutine run-state and return-target enums
//! - `error` - error types
//! - `env` - environment variable utilities

pub mod env;
pub mod error;
pub mod id;
pub mod state;

// Re-exports for convenience
pub use env::{env_get, env_get_bool, env_get_opt};
pub use error::{RuntimeError, RuntimeResult, StackError};
pub use id::CoId;
pub use state::{CoState, ReturnTarget};

/// Constants shared across the runtime
pub mod constants {
    /// Default coroutine stack size (128 KiB)
    pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

    /// Guard page size at the low end of every stack (4 KiB)
    pub const GUARD_SIZE: usize = 4096;

    /// Maximum worker threads per scheduler
    pub const MAX_WORKERS: usize = 64;

    /// Readiness-wait event buffer size
    pub const MAX_EVENTS: usize = 256;

    /// Upper bound on one readiness wait (ms); the idle loop never sleeps
    /// longer than this even with no timer armed
    pub const MAX_IDLE_TIMEOUT_MS: u64 = 5000;

    /// Thread-affinity value meaning "any worker"
    pub const ANY_THREAD: i32 = -1;
}
