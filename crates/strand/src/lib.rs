//! # strand - stackful coroutine runtime
//!
//! User-space M:N coroutine runtime with synchronous-style I/O on top of
//! non-blocking kernel primitives. Application code writes straight-line
//! blocking calls (connect, read, write, sleep); the runtime transparently
//! suspends the calling coroutine on would-block, registers the descriptor
//! with epoll, and resumes the coroutine when it becomes ready or a timer
//! fires.
//!
//! ## Quick start
//!
//! ```no_run
//! use strand::{hook, IoManager};
//!
//! fn main() {
//!     let iom = IoManager::new(4, false, "echo").unwrap();
//!
//!     iom.schedule_call(|| {
//!         let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
//!         // bind/listen, then accept parks this coroutine instead of the
//!         // worker thread:
//!         let client = hook::accept(fd, std::ptr::null_mut(), std::ptr::null_mut());
//!         let mut buf = [0u8; 1024];
//!         let n = hook::recv(client, &mut buf, 0);
//!         if n > 0 {
//!             hook::send(client, &buf[..n as usize], 0);
//!         }
//!         hook::close(client);
//!     });
//!
//!     // ... later
//!     iom.stop();
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                   application code                   │
//! │        hook::{connect, read, write, sleep, ...}      │
//! └──────────────────────────────────────────────────────┘
//!                           │ would-block: register + yield
//!                           ▼
//! ┌──────────────────────────────────────────────────────┐
//! │  IoManager: task FIFO · worker threads · timer set   │
//! │        idle coroutine blocks in epoll_wait           │
//! └──────────────────────────────────────────────────────┘
//!                           │ readiness / expiry
//!                           ▼
//!            coroutine rescheduled, syscall retried
//! ```

pub use strand_core::{CoId, CoState, ReturnTarget, RuntimeError, RuntimeResult};
pub use strand_runtime::hook;
pub use strand_runtime::{
    yield_now, Coroutine, Event, FdTable, IoManager, RuntimeConfig, Schedule, Scheduler, Task,
    Timer, TimerManager,
};
