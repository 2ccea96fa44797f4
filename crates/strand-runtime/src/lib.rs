//! # strand-runtime
//!
//! Coroutine runtime with synchronous-style I/O over non-blocking kernel
//! primitives. Application code writes straight-line blocking calls; the
//! shims suspend the calling coroutine on would-block, register interest
//! with epoll, and resume it on readiness or timer expiry. Many coroutines
//! multiplex over a small pool of worker threads.
//!
//! This crate provides:
//! - Stackful coroutines (architecture-specific context switch assembly)
//! - mmap'd guard-paged stacks
//! - The M:N scheduler with per-thread workers and a shared FIFO
//! - The I/O manager: epoll wait loop, per-fd registration, timer set
//! - The fd attribute table driving transparent-blocking decisions
//! - Blocking-call shims (sleep/socket/connect/read/write/... facade)

pub mod arch;
pub mod config;
pub mod coroutine;
pub mod fd_table;
pub mod hook;
pub mod io_manager;
pub mod scheduler;
pub mod stack;
pub mod thread;
pub mod timer;
pub mod tls;

// Re-exports
pub use config::RuntimeConfig;
pub use coroutine::{yield_now, Coroutine};
pub use fd_table::{FdAttr, FdTable, TIMEOUT_NEVER};
pub use hook::{is_hook_enable, set_hook_enable};
pub use io_manager::{Event, IoManager};
pub use scheduler::{Schedule, Scheduler, Task};
pub use timer::{Timer, TimerManager};

// Architecture detection
cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub use arch::x86_64 as current_arch;
    } else if #[cfg(target_arch = "aarch64")] {
        pub use arch::aarch64 as current_arch;
    } else {
        compile_error!("Unsupported architecture");
    }
}
