//! Thread-local runtime state
//!
//! Each OS thread tracks: the coroutine it is currently running, its root
//! coroutine (the thread's original execution context), the scheduler
//! coroutine installed by the worker loop, and the I/O manager the worker
//! belongs to.

use std::cell::RefCell;
use std::sync::{Arc, Weak};

use crate::coroutine::Coroutine;
use crate::io_manager::IoManager;

thread_local! {
    /// Coroutine currently executing on this thread
    static CURRENT_CO: RefCell<Option<Arc<Coroutine>>> = const { RefCell::new(None) };

    /// This thread's root coroutine (created on first use)
    static ROOT_CO: RefCell<Option<Arc<Coroutine>>> = const { RefCell::new(None) };

    /// Scheduler coroutine for this worker; set for the worker loop's duration
    static SCHEDULER_CO: RefCell<Option<Arc<Coroutine>>> = const { RefCell::new(None) };

    /// I/O manager this worker thread belongs to
    static CURRENT_IOM: RefCell<Weak<IoManager>> = const { RefCell::new(Weak::new()) };
}

/// This thread's root coroutine, created on first access.
///
/// The root represents the thread's original context; it has no stack of its
/// own and is considered RUNNING whenever control is not in a coroutine.
pub fn root() -> Arc<Coroutine> {
    ROOT_CO.with(|cell| {
        let mut slot = cell.borrow_mut();
        if slot.is_none() {
            let root = Coroutine::new_root();
            *slot = Some(root.clone());
            CURRENT_CO.with(|c| {
                let mut cur = c.borrow_mut();
                if cur.is_none() {
                    *cur = Some(root);
                }
            });
        }
        slot.as_ref().expect("root coroutine just initialized").clone()
    })
}

/// The coroutine currently running on this thread (the root if none).
pub fn current() -> Arc<Coroutine> {
    let _ = root();
    CURRENT_CO.with(|cell| {
        cell.borrow()
            .as_ref()
            .expect("current coroutine initialized by root()")
            .clone()
    })
}

pub(crate) fn set_current(co: Arc<Coroutine>) {
    CURRENT_CO.with(|cell| *cell.borrow_mut() = Some(co));
}

/// Scheduler coroutine for this worker, if the worker loop installed one.
pub fn scheduler_co() -> Option<Arc<Coroutine>> {
    SCHEDULER_CO.with(|cell| cell.borrow().clone())
}

pub(crate) fn set_scheduler_co(co: Arc<Coroutine>) {
    SCHEDULER_CO.with(|cell| *cell.borrow_mut() = Some(co));
}

pub(crate) fn clear_scheduler_co() {
    SCHEDULER_CO.with(|cell| *cell.borrow_mut() = None);
}

/// True when control is inside a non-root coroutine.
pub fn in_coroutine() -> bool {
    CURRENT_CO.with(|cell| {
        cell.borrow()
            .as_ref()
            .map(|co| !co.id().is_root())
            .unwrap_or(false)
    })
}

/// The I/O manager owning this worker thread, if any.
pub fn current_io_manager() -> Option<Arc<IoManager>> {
    CURRENT_IOM.with(|cell| cell.borrow().upgrade())
}

pub(crate) fn set_current_io_manager(iom: &Arc<IoManager>) {
    CURRENT_IOM.with(|cell| *cell.borrow_mut() = Arc::downgrade(iom));
}

pub(crate) fn clear_current_io_manager() {
    CURRENT_IOM.with(|cell| *cell.borrow_mut() = Weak::new());
}
