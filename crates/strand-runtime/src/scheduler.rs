//! M:N task scheduler
//!
//! A FIFO of tasks served by a pool of worker threads, each running a
//! cooperative coroutine loop. `Schedule` is the customization surface: the
//! base behavior (no-op tickle, sleep-a-second idle) is what the plain
//! `Scheduler` uses; the I/O manager overrides all three hooks.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use strand_core::constants::ANY_THREAD;
use strand_core::{CoState, ReturnTarget};

use crate::coroutine::{self, Coroutine};
use crate::thread::{gettid, set_current_thread_name, OsThread};
use crate::timer::TimerCallback;
use crate::tls;

/// Callable form of a task; shared so a single callable can be scheduled
/// from timer fire paths that run more than once.
pub type TaskFn = TimerCallback;

/// What a task runs: an existing coroutine or a callable that gets wrapped
/// in a fresh one at dispatch.
pub enum TaskKind {
    Co(Arc<Coroutine>),
    Call(TaskFn),
}

/// A unit of scheduler work with optional thread affinity.
pub struct Task {
    kind: TaskKind,
    /// Kernel tid this task must run on; `ANY_THREAD` for any worker.
    thread: i32,
}

impl Task {
    pub fn from_coroutine(co: Arc<Coroutine>) -> Task {
        debug_assert!(
            !co.id().is_root(),
            "root coroutines must not be enqueued as tasks"
        );
        Task {
            kind: TaskKind::Co(co),
            thread: ANY_THREAD,
        }
    }

    pub fn from_fn(f: TaskFn) -> Task {
        Task {
            kind: TaskKind::Call(f),
            thread: ANY_THREAD,
        }
    }

    pub fn call(f: impl Fn() + Send + Sync + 'static) -> Task {
        Task::from_fn(Arc::new(f))
    }

    /// Pin the task to a worker by kernel tid.
    pub fn with_thread(mut self, tid: i32) -> Task {
        self.thread = tid;
        self
    }
}

/// Shared scheduler internals: queue, counters, worker handles.
pub struct SchedulerCore {
    name: String,
    tasks: Mutex<VecDeque<Task>>,
    thread_count: usize,
    active_threads: AtomicUsize,
    idle_threads: AtomicUsize,
    stop_requested: AtomicBool,
    started: AtomicBool,
    workers: Mutex<Vec<OsThread>>,
    use_caller: bool,
    /// Caller-thread scheduler coroutine; present only with `use_caller`
    caller_co: Mutex<Option<Arc<Coroutine>>>,
    stack_size: usize,
}

impl SchedulerCore {
    /// `threads` includes the caller when `use_caller` is set, so the spawned
    /// worker count drops by one in that mode.
    pub fn new(threads: usize, use_caller: bool, name: &str, stack_size: usize) -> SchedulerCore {
        assert!(threads > 0, "scheduler needs at least one thread");
        let thread_count = if use_caller { threads - 1 } else { threads };
        if use_caller {
            set_current_thread_name(name);
        }
        SchedulerCore {
            name: name.to_string(),
            tasks: Mutex::new(VecDeque::new()),
            thread_count,
            active_threads: AtomicUsize::new(0),
            idle_threads: AtomicUsize::new(0),
            stop_requested: AtomicBool::new(false),
            started: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
            use_caller,
            caller_co: Mutex::new(None),
            stack_size,
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    #[inline]
    pub fn idle_threads(&self) -> usize {
        self.idle_threads.load(Ordering::Acquire)
    }

    /// Base stop predicate: stop was requested, the queue is drained and no
    /// worker is mid-task.
    pub fn base_stopping(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
            && self.tasks.lock().is_empty()
            && self.active_threads.load(Ordering::Acquire) == 0
    }

    #[inline]
    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }
}

/// Scheduler behavior hooks. The worker loop and the public operations are
/// generic over this, standing in for the virtual methods of a base class.
pub trait Schedule: Send + Sync + Sized + 'static {
    fn core(&self) -> &SchedulerCore;

    /// Wake a sleeping worker. The base scheduler has nothing to wake.
    fn tickle(&self) {}

    /// Body of the per-worker idle coroutine: runs whenever the queue is
    /// empty, yielding once per pass. Takes a weak handle and revalidates it
    /// every pass, so a blocked pass never pins the scheduler alive; a
    /// failed upgrade means shutdown. The base version just naps.
    fn idle(this: &Weak<Self>) {
        loop {
            let Some(s) = this.upgrade() else { return };
            if s.stopping() {
                return;
            }
            drop(s);
            std::thread::sleep(Duration::from_secs(1));
            coroutine::yield_now();
        }
    }

    fn stopping(&self) -> bool {
        self.core().base_stopping()
    }

    /// Install per-thread context at worker start.
    fn install_thread(_s: &Arc<Self>) {}

    /// Tear down per-thread context at worker exit.
    fn uninstall_thread(&self) {}
}

/// Enqueue a task; wakes a worker if the queue was empty.
pub fn schedule<S: Schedule>(s: &S, task: Task) {
    let need_tickle = {
        let mut q = s.core().tasks.lock();
        let was_empty = q.is_empty();
        q.push_back(task);
        was_empty
    };
    if need_tickle {
        s.tickle();
    }
}

/// Spawn the worker threads. Idempotent; refuses after `stop`.
pub fn start<S: Schedule>(s: &Arc<S>) {
    let core = s.core();
    if core.stop_requested.load(Ordering::Acquire) {
        log::warn!("{}: start() after stop() ignored", core.name);
        return;
    }
    if core.started.swap(true, Ordering::AcqRel) {
        return;
    }

    // Workers get weak handles only: destruction implies stop+join, so the
    // last user-held Arc going away must actually bring the count to zero.
    let mut workers = core.workers.lock();
    debug_assert!(workers.is_empty());
    for i in 0..core.thread_count {
        let weak: Weak<S> = Arc::downgrade(s);
        let name = format!("{}_{}", core.name, i);
        let worker = OsThread::spawn(&name, move || worker_loop(weak))
            .expect("failed to spawn scheduler worker");
        workers.push(worker);
    }
    drop(workers);

    if core.use_caller {
        // The caller's scheduler coroutine drains the queue during stop().
        let weak: Weak<S> = Arc::downgrade(s);
        let co = Coroutine::new(
            move || worker_loop(weak),
            core.stack_size,
            ReturnTarget::Root,
        )
        .expect("failed to create caller scheduler coroutine");
        *core.caller_co.lock() = Some(co);
    }
}

/// Request stop, wake everyone, drain on the caller (if participating) and
/// join the workers. Must not be called from a worker thread.
pub fn stop<S: Schedule>(s: &S) {
    if s.stopping() {
        return;
    }
    let core = s.core();
    core.stop_requested.store(true, Ordering::Release);

    for _ in 0..core.thread_count {
        s.tickle();
    }

    let caller_co = core.caller_co.lock().take();
    if let Some(co) = caller_co {
        s.tickle();
        if !co.state().is_term() {
            co.resume();
        }
    }

    // A drop-triggered stop can run on a worker thread (the worker held the
    // final strong reference); that thread detaches instead of joining
    // itself and finishes its exit after the scheduler is gone.
    let self_tid = gettid();
    let mut workers = std::mem::take(&mut *core.workers.lock());
    for w in workers.iter_mut() {
        if w.id() == self_tid {
            continue;
        }
        w.join();
    }
}

/// The worker loop. Runs on each spawned worker thread's root coroutine and,
/// in `use_caller` mode, inside the caller's scheduler coroutine.
///
/// Holds the scheduler only through a weak handle, upgraded once per
/// iteration and released before every blocking idle pass: a failed upgrade
/// means the last user handle was dropped and the worker exits.
pub fn worker_loop<S: Schedule>(weak: Weak<S>) {
    let tid = gettid();

    let (name, stack_size) = {
        let Some(s) = weak.upgrade() else { return };
        S::install_thread(&s);
        crate::hook::set_hook_enable(true);
        // The coroutine we are on (thread root, or the caller's scheduler
        // coroutine) is what scheduler-owned coroutines yield back to.
        tls::set_scheduler_co(tls::current());
        (s.core().name.clone(), s.core().stack_size)
    };
    log::debug!("{}: worker loop starts on thread {}", name, tid);

    let idle_weak = weak.clone();
    let idle_co = Coroutine::new(
        move || S::idle(&idle_weak),
        stack_size,
        ReturnTarget::Scheduler,
    )
    .expect("failed to create idle coroutine");

    loop {
        let Some(s) = weak.upgrade() else { break };
        let core = s.core();

        let mut claimed: Option<Task> = None;
        let mut tickle_me = false;
        {
            let mut q = core.tasks.lock();
            let mut i = 0;
            while i < q.len() {
                let affinity = q[i].thread;
                if affinity != ANY_THREAD && affinity != tid {
                    // Someone else's task is waiting; make sure they wake.
                    tickle_me = true;
                    i += 1;
                    continue;
                }
                claimed = q.remove(i);
                core.active_threads.fetch_add(1, Ordering::AcqRel);
                break;
            }
            tickle_me = tickle_me || (claimed.is_some() && !q.is_empty());
        }

        if tickle_me {
            s.tickle();
        }

        match claimed {
            Some(task) => {
                match task.kind {
                    TaskKind::Co(co) => {
                        if co.state() != CoState::Term {
                            co.resume();
                        }
                    }
                    TaskKind::Call(f) => {
                        let co = Coroutine::new(
                            move || f(),
                            stack_size,
                            ReturnTarget::Scheduler,
                        )
                        .expect("failed to create task coroutine");
                        co.resume();
                    }
                }
                core.active_threads.fetch_sub(1, Ordering::AcqRel);
            }
            None => {
                // Queue empty: hand the thread to the idle coroutine. Once
                // idle terminates (stop observed or scheduler gone) the loop
                // is done.
                if idle_co.state() == CoState::Term {
                    log::debug!("{}: worker loop ends on thread {}", name, tid);
                    break;
                }
                core.idle_threads.fetch_add(1, Ordering::AcqRel);
                // The idle pass blocks; release the handle so a bare drop of
                // the last user Arc can reach zero while workers sleep.
                drop(s);
                idle_co.resume();
                if let Some(s) = weak.upgrade() {
                    s.core().idle_threads.fetch_sub(1, Ordering::AcqRel);
                }
            }
        }
    }

    tls::clear_scheduler_co();
    if let Some(s) = weak.upgrade() {
        s.uninstall_thread();
    }
}

/// The base scheduler: FIFO dispatch with the default do-nothing idle. The
/// I/O manager builds on the same core with real readiness-driven hooks.
pub struct Scheduler {
    core: SchedulerCore,
}

impl Scheduler {
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<Scheduler> {
        Arc::new(Scheduler {
            core: SchedulerCore::new(
                threads,
                use_caller,
                name,
                strand_core::constants::DEFAULT_STACK_SIZE,
            ),
        })
    }
}

impl Schedule for Scheduler {
    fn core(&self) -> &SchedulerCore {
        &self.core
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_tasks_run_on_workers() {
        let sched = Scheduler::new(2, false, "sched-test");
        start(&sched);

        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let d = done.clone();
            schedule(&*sched, Task::call(move || {
                d.fetch_add(1, Ordering::SeqCst);
            }));
        }

        // The base idle sleeps a second per pass; give the workers room.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while done.load(Ordering::SeqCst) < 16 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(done.load(Ordering::SeqCst), 16);

        stop(&*sched);
    }

    #[test]
    fn test_use_caller_drains_on_stop() {
        let sched = Scheduler::new(1, true, "sched-caller");
        start(&sched);

        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let d = done.clone();
            schedule(&*sched, Task::call(move || {
                d.fetch_add(1, Ordering::SeqCst);
            }));
        }
        // No spawned workers in this mode; everything runs on the caller
        // inside stop().
        assert_eq!(done.load(Ordering::SeqCst), 0);
        stop(&*sched);
        assert_eq!(done.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_scheduled_coroutine_resumes_until_term() {
        let sched = Scheduler::new(1, false, "sched-co");
        start(&sched);

        let steps = Arc::new(AtomicUsize::new(0));
        let s2 = steps.clone();
        let co = Coroutine::new(
            move || {
                s2.fetch_add(1, Ordering::SeqCst);
            },
            strand_core::constants::DEFAULT_STACK_SIZE,
            ReturnTarget::Scheduler,
        )
        .unwrap();
        schedule(&*sched, Task::from_coroutine(co.clone()));

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while steps.load(Ordering::SeqCst) < 1 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(steps.load(Ordering::SeqCst), 1);
        assert_eq!(co.state(), CoState::Term);

        stop(&*sched);
    }
}
