//! Stackful coroutines with explicit yield/resume
//!
//! A coroutine owns a guard-paged stack and a saved register context. Resume
//! switches from the calling context (a thread's root coroutine or a worker's
//! scheduler coroutine) into the coroutine; yield switches back to whichever
//! of the two the coroutine was created to return to.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use strand_core::error::RuntimeResult;
use strand_core::{CoId, CoState, ReturnTarget};

use crate::current_arch::{context_switch, init_context, SavedContext};
use crate::stack::Stack;
use crate::tls;

/// A stackful coroutine.
///
/// State machine: created READY, READY -> RUNNING on resume, RUNNING -> READY
/// on yield, RUNNING -> TERM when the entry callable returns. A TERM
/// coroutine is never resumed again.
pub struct Coroutine {
    id: CoId,
    state: AtomicU8,
    target: ReturnTarget,
    stack: Option<Stack>,
    ctx: UnsafeCell<SavedContext>,
    entry: UnsafeCell<Option<Box<dyn FnOnce() + Send>>>,
    /// Back-reference to the owning Arc, for publishing into thread-locals
    weak_self: Weak<Coroutine>,
    /// True once the saved context is valid to switch into. Cleared by the
    /// resumer for the duration of a run and republished when the coroutine
    /// has fully switched out, so a wakeup raced from another worker cannot
    /// load a half-saved context.
    suspended: AtomicBool,
}

// The context and entry cells are only touched by the thread that currently
// runs (or resumes) the coroutine; the runtime hands a coroutine to at most
// one worker at a time.
unsafe impl Send for Coroutine {}
unsafe impl Sync for Coroutine {}

impl Coroutine {
    /// Create a coroutine running `entry` on a fresh `stack_size`-byte stack.
    ///
    /// `target` picks where yield hands control back to: the worker's
    /// scheduler coroutine (scheduler-owned tasks) or the thread's root
    /// coroutine (caller-owned).
    pub fn new(
        entry: impl FnOnce() + Send + 'static,
        stack_size: usize,
        target: ReturnTarget,
    ) -> RuntimeResult<Arc<Coroutine>> {
        let stack = Stack::new(stack_size)?;
        let co = Arc::new_cyclic(|weak| Coroutine {
            id: CoId::next(),
            state: AtomicU8::new(CoState::Ready as u8),
            target,
            stack: Some(stack),
            ctx: UnsafeCell::new(SavedContext::zeroed()),
            entry: UnsafeCell::new(Some(Box::new(entry))),
            weak_self: weak.clone(),
            suspended: AtomicBool::new(true),
        });

        let top = co.stack.as_ref().expect("stack just allocated").top();
        // Safety: ctx points into the Arc we just built; the stack top is a
        // valid mapped address. The raw self pointer handed to the trampoline
        // stays valid because the resumer holds an Arc for the whole run.
        unsafe {
            init_context(
                co.ctx.get(),
                top,
                coroutine_main as usize,
                Arc::as_ptr(&co) as usize,
            );
        }
        Ok(co)
    }

    /// Root coroutine for a thread: no stack, considered RUNNING from birth.
    pub(crate) fn new_root() -> Arc<Coroutine> {
        Arc::new_cyclic(|weak| Coroutine {
            id: CoId::ROOT,
            state: AtomicU8::new(CoState::Running as u8),
            target: ReturnTarget::Root,
            stack: None,
            ctx: UnsafeCell::new(SavedContext::zeroed()),
            entry: UnsafeCell::new(None),
            weak_self: weak.clone(),
            suspended: AtomicBool::new(false),
        })
    }

    #[inline]
    pub fn id(&self) -> CoId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> CoState {
        self.state.load(Ordering::Acquire).into()
    }

    #[inline]
    pub fn target(&self) -> ReturnTarget {
        self.target
    }

    #[inline]
    pub(crate) fn set_state(&self, s: CoState) {
        self.state.store(s as u8, Ordering::Release);
    }

    /// Switch into this coroutine from the current thread's root or
    /// scheduler coroutine. Returns when the coroutine yields or terminates.
    ///
    /// # Panics
    ///
    /// Panics if the coroutine is not READY; resuming a TERM coroutine is a
    /// programmer error.
    pub fn resume(&self) {
        let state = self.state();
        assert!(
            state.is_resumable(),
            "resume on {} coroutine {}",
            state,
            self.id
        );

        let this = self
            .weak_self
            .upgrade()
            .expect("resume on a coroutine with no live owner");
        let prev = tls::current();
        debug_assert!(
            !Arc::ptr_eq(&prev, &this),
            "coroutine {} resumed itself",
            self.id
        );

        // If the wakeup raced ahead of the previous runner, wait for that
        // runner to finish switching out before loading the context.
        while !self.suspended.swap(false, Ordering::Acquire) {
            std::hint::spin_loop();
        }

        self.set_state(CoState::Running);
        tls::set_current(this);
        // Safety: prev is suspended right here and its context cell is not
        // touched until something switches back to it; self's context is
        // complete per the handshake above and no other thread runs it.
        unsafe {
            context_switch(prev.ctx.get(), self.ctx.get());
        }
        // Back from the coroutine: it yielded (READY) or finished (TERM).
        // Its saved context is now complete; let the next resumer in.
        self.suspended.store(true, Ordering::Release);
    }

    /// The coroutine a yield from `self` hands control to.
    fn switch_target(&self) -> Arc<Coroutine> {
        match self.target {
            // No scheduler coroutine installed means we were resumed straight
            // from the thread root; return there.
            ReturnTarget::Scheduler => tls::scheduler_co().unwrap_or_else(tls::root),
            ReturnTarget::Root => tls::root(),
        }
    }
}

impl std::fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coroutine")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("target", &self.target)
            .finish()
    }
}

/// Suspend the currently running coroutine, handing control back to the
/// scheduler or root coroutine it was created to return to.
///
/// Calling this from the root coroutine is a no-op apart from an OS-level
/// yield, since the root has nowhere to go.
pub fn yield_now() {
    let cur = tls::current();
    if cur.id().is_root() {
        std::thread::yield_now();
        return;
    }

    let dst = cur.switch_target();
    debug_assert!(!Arc::ptr_eq(&cur, &dst));

    // A terminating coroutine keeps TERM; everyone else goes back to READY.
    if !cur.state().is_term() {
        cur.set_state(CoState::Ready);
    }

    tls::set_current(dst.clone());
    // Safety: cur's context cell is only written by this switch; dst's saved
    // context was filled when dst suspended itself in resume().
    unsafe {
        context_switch(cur.ctx.get(), dst.ctx.get());
    }
    // Resumed again.
}

/// Entry wrapper for every coroutine: run the user callable, flip to TERM,
/// and make the final switch out.
extern "C" fn coroutine_main(arg: usize) {
    // Safety: arg is the Arc'd Coroutine the resumer is keeping alive for the
    // duration of this run.
    let co = unsafe { &*(arg as *const Coroutine) };

    let entry = unsafe { (*co.entry.get()).take() };
    if let Some(f) = entry {
        f();
    }

    co.set_state(CoState::Term);
    yield_now();
    unreachable!("terminated coroutine {} was resumed", co.id());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use strand_core::constants::DEFAULT_STACK_SIZE;

    #[test]
    fn test_resume_and_yield_round_trip() {
        let steps = Arc::new(AtomicUsize::new(0));
        let s = steps.clone();

        let co = Coroutine::new(
            move || {
                s.fetch_add(1, Ordering::SeqCst);
                yield_now();
                s.fetch_add(1, Ordering::SeqCst);
            },
            DEFAULT_STACK_SIZE,
            ReturnTarget::Root,
        )
        .unwrap();

        assert_eq!(co.state(), CoState::Ready);
        co.resume();
        assert_eq!(steps.load(Ordering::SeqCst), 1);
        assert_eq!(co.state(), CoState::Ready);

        co.resume();
        assert_eq!(steps.load(Ordering::SeqCst), 2);
        assert_eq!(co.state(), CoState::Term);
    }

    #[test]
    fn test_nested_coroutines_interleave() {
        let trace = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let t1 = trace.clone();
        let a = Coroutine::new(
            move || {
                t1.lock().push("a1");
                yield_now();
                t1.lock().push("a2");
            },
            DEFAULT_STACK_SIZE,
            ReturnTarget::Root,
        )
        .unwrap();

        let t2 = trace.clone();
        let b = Coroutine::new(
            move || {
                t2.lock().push("b1");
                yield_now();
                t2.lock().push("b2");
            },
            DEFAULT_STACK_SIZE,
            ReturnTarget::Root,
        )
        .unwrap();

        a.resume();
        b.resume();
        a.resume();
        b.resume();

        assert_eq!(*trace.lock(), vec!["a1", "b1", "a2", "b2"]);
        assert!(a.state().is_term());
        assert!(b.state().is_term());
    }

    #[test]
    #[should_panic(expected = "resume on TERM coroutine")]
    fn test_resume_term_panics() {
        let co = Coroutine::new(|| {}, DEFAULT_STACK_SIZE, ReturnTarget::Root).unwrap();
        co.resume();
        assert!(co.state().is_term());
        co.resume();
    }

    #[test]
    fn test_root_is_current_by_default() {
        let cur = tls::current();
        assert!(cur.id().is_root());
        assert_eq!(cur.state(), CoState::Running);
        // Yield from the root is a no-op
        yield_now();
        assert!(tls::current().id().is_root());
    }
}
