//! Worker OS-thread wrapper
//!
//! Thin wrapper around an OS thread carrying a kernel thread id and a name.
//! The constructor blocks on a startup barrier until the new thread has
//! published its tid, so callers always observe a populated id.

use std::cell::RefCell;
use std::sync::mpsc;
use std::thread::JoinHandle;

use strand_core::error::{RuntimeError, RuntimeResult};

/// Linux thread names are capped at 15 bytes plus the NUL.
const MAX_NAME_LEN: usize = 15;

thread_local! {
    static THREAD_NAME: RefCell<String> = RefCell::new(String::from("UNKNOWN"));
}

/// Kernel thread id of the calling thread.
#[inline]
pub fn gettid() -> libc::pid_t {
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}

/// Name of the calling thread as the runtime knows it.
pub fn current_thread_name() -> String {
    THREAD_NAME.with(|n| n.borrow().clone())
}

/// Record a name for the calling thread (truncated to 15 bytes).
pub fn set_current_thread_name(name: &str) {
    let name = truncate_name(name);
    THREAD_NAME.with(|n| *n.borrow_mut() = name);
}

fn truncate_name(name: &str) -> String {
    if name.len() <= MAX_NAME_LEN {
        return name.to_string();
    }
    let mut end = MAX_NAME_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}

/// A named OS thread with its kernel tid.
pub struct OsThread {
    id: libc::pid_t,
    name: String,
    handle: Option<JoinHandle<()>>,
}

impl OsThread {
    /// Spawn a named thread running `f`.
    ///
    /// Blocks until the thread has started and reported its tid. The OS-level
    /// thread name mirrors `name` (truncated to 15 bytes).
    pub fn spawn<F>(name: &str, f: F) -> RuntimeResult<OsThread>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = truncate_name(name);
        let thread_name = name.clone();
        let (tx, rx) = mpsc::channel();

        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                set_current_thread_name(&thread_name);
                // Publish the tid before running the body; the constructor
                // is blocked on this.
                let _ = tx.send(gettid());
                f();
            })
            .map_err(|e| RuntimeError::Platform(e.raw_os_error().unwrap_or(libc::EAGAIN)))?;

        let id = rx
            .recv()
            .expect("worker thread exited before reporting its id");

        Ok(OsThread {
            id,
            name,
            handle: Some(handle),
        })
    }

    /// Kernel thread id, valid from the moment the constructor returns.
    #[inline]
    pub fn id(&self) -> libc::pid_t {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the thread to finish. Idempotent: later calls are no-ops.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for OsThread {
    fn drop(&mut self) {
        // Dropping the JoinHandle detaches the thread, matching the
        // destructor contract: no implicit join.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_spawn_reports_tid_and_name() {
        let ran = Arc::new(AtomicBool::new(false));
        let r = ran.clone();
        let mut t = OsThread::spawn("strand-test", move || {
            assert_eq!(current_thread_name(), "strand-test");
            r.store(true, Ordering::SeqCst);
        })
        .unwrap();

        assert!(t.id() > 0);
        assert_eq!(t.name(), "strand-test");
        t.join();
        assert!(ran.load(Ordering::SeqCst));
        // join is idempotent
        t.join();
    }

    #[test]
    fn test_long_names_truncate() {
        let mut t = OsThread::spawn("a-very-long-worker-thread-name", || {
            assert_eq!(current_thread_name().len(), 15);
        })
        .unwrap();
        assert_eq!(t.name().len(), 15);
        t.join();
    }
}
