//! I/O manager: readiness-driven scheduler
//!
//! Extends the scheduler core with an epoll instance, a self-pipe for
//! cross-thread wakeups and the timer set. Workers with nothing to run sit
//! in the idle coroutine, which blocks in `epoll_wait`, harvests expired
//! timers and ready descriptors, and converts both into scheduler tasks.
//!
//! Registration flow: 1. register an (fd, direction) pair -> 2. wait for
//! readiness -> 3. idle loop schedules the stored coroutine/callable ->
//! 4. the registration is consumed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::{Mutex, RwLock};

use strand_core::constants::{MAX_EVENTS, MAX_IDLE_TIMEOUT_MS};
use strand_core::error::{RuntimeError, RuntimeResult};
use strand_core::CoState;

use crate::config::RuntimeConfig;
use crate::coroutine::{self, Coroutine};
use crate::fd_table::FdTable;
use crate::scheduler::{self, Schedule, SchedulerCore, Task, TaskFn};
use crate::thread::gettid;
use crate::timer::{Timer, TimerCallback, TimerManager};
use crate::tls;

/// A readiness direction on a descriptor.
///
/// The discriminants match the kernel's event bits, so a mask of directions
/// is also a valid epoll interest set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Event {
    Read = libc::EPOLLIN as u32,
    Write = libc::EPOLLOUT as u32,
}

impl Event {
    #[inline]
    pub fn mask(self) -> u32 {
        self as u32
    }
}

/// Waiter stored for one direction of one fd: the scheduler to hand the
/// wakeup to, and either a coroutine or a callable.
struct EventContext {
    scheduler: Weak<IoManager>,
    co: Option<Arc<Coroutine>>,
    cb: Option<TaskFn>,
}

impl EventContext {
    const fn empty() -> EventContext {
        EventContext {
            scheduler: Weak::new(),
            co: None,
            cb: None,
        }
    }

    #[inline]
    fn is_armed(&self) -> bool {
        self.co.is_some() || self.cb.is_some()
    }

    fn reset(&mut self) {
        self.scheduler = Weak::new();
        self.co = None;
        self.cb = None;
    }
}

/// Registered state of one descriptor.
struct FdState {
    /// Mask of currently registered directions; mirrors the kernel's
    /// subscription for this fd
    events: u32,
    read: EventContext,
    write: EventContext,
}

impl FdState {
    fn context_mut(&mut self, dir: Event) -> &mut EventContext {
        match dir {
            Event::Read => &mut self.read,
            Event::Write => &mut self.write,
        }
    }

    /// Fire one direction: drop it from the mask and schedule the stored
    /// coroutine/callable on its recorded scheduler. Caller holds the lock.
    fn trigger(&mut self, dir: Event) {
        assert!(
            self.events & dir.mask() != 0,
            "trigger on unregistered direction {:?}",
            dir
        );
        self.events &= !dir.mask();

        let ctx = self.context_mut(dir);
        let scheduler = std::mem::replace(&mut ctx.scheduler, Weak::new());
        let co = ctx.co.take();
        let cb = ctx.cb.take();

        if let Some(iom) = scheduler.upgrade() {
            if let Some(cb) = cb {
                iom.schedule(Task::from_fn(cb));
            } else if let Some(co) = co {
                iom.schedule(Task::from_coroutine(co));
            }
        }
    }
}

struct FdContext {
    fd: i32,
    state: Mutex<FdState>,
}

impl FdContext {
    fn new(fd: i32) -> FdContext {
        FdContext {
            fd,
            state: Mutex::new(FdState {
                events: 0,
                read: EventContext::empty(),
                write: EventContext::empty(),
            }),
        }
    }
}

/// The I/O manager. Construction spawns the workers; destruction stops and
/// joins them. Workers and parked operations hold only weak references, so
/// dropping the last user handle shuts the runtime down even without an
/// explicit [`IoManager::stop`] call.
pub struct IoManager {
    core: SchedulerCore,
    timers: TimerManager,
    fd_table: FdTable,
    epfd: i32,
    tickle_fds: [i32; 2],
    /// Number of armed (fd, direction) registrations
    pending: AtomicUsize,
    /// Successful cancel_event fires since construction
    cancelled_events: AtomicUsize,
    contexts: RwLock<Vec<Arc<FdContext>>>,
    weak_self: OnceLock<Weak<IoManager>>,
}

impl IoManager {
    /// Build and start an I/O manager with `threads` workers. With
    /// `use_caller` the constructing thread counts as one of them and
    /// participates during `stop()`.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> RuntimeResult<Arc<IoManager>> {
        Self::with_config(RuntimeConfig {
            threads,
            use_caller,
            name: name.to_string(),
            ..RuntimeConfig::default()
        })
    }

    pub fn with_config(config: RuntimeConfig) -> RuntimeResult<Arc<IoManager>> {
        config.validate()?;

        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(RuntimeError::KernelFailure(errno()));
        }

        let mut tickle_fds = [0i32; 2];
        if unsafe { libc::pipe2(tickle_fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } != 0
        {
            let e = errno();
            unsafe { libc::close(epfd) };
            return Err(RuntimeError::KernelFailure(e));
        }

        // The self-pipe's read end is the wakeup mechanism: edge-triggered,
        // drained to empty by whichever idle loop sees it.
        let mut ev = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLET) as u32,
            u64: tickle_fds[0] as u64,
        };
        if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, tickle_fds[0], &mut ev) } != 0 {
            let e = errno();
            unsafe {
                libc::close(epfd);
                libc::close(tickle_fds[0]);
                libc::close(tickle_fds[1]);
            }
            return Err(RuntimeError::KernelFailure(e));
        }

        let iom = Arc::new(IoManager {
            core: SchedulerCore::new(
                config.threads,
                config.use_caller,
                &config.name,
                config.stack_size,
            ),
            timers: TimerManager::new(),
            fd_table: FdTable::new(),
            epfd,
            tickle_fds,
            pending: AtomicUsize::new(0),
            cancelled_events: AtomicUsize::new(0),
            contexts: RwLock::new(Vec::new()),
            weak_self: OnceLock::new(),
        });

        grow_contexts(&mut iom.contexts.write(), 32);

        let _ = iom.weak_self.set(Arc::downgrade(&iom));
        let waker = Arc::downgrade(&iom);
        iom.timers.set_front_waker(move || {
            if let Some(m) = waker.upgrade() {
                m.tickle();
            }
        });

        // The constructing thread can schedule and use the shims right away
        tls::set_current_io_manager(&iom);

        scheduler::start(&iom);
        Ok(iom)
    }

    /// The I/O manager owning the calling thread, if any.
    pub fn current() -> Option<Arc<IoManager>> {
        tls::current_io_manager()
    }

    #[inline]
    pub fn name(&self) -> &str {
        self.core.name()
    }

    #[inline]
    pub fn fd_table(&self) -> &FdTable {
        &self.fd_table
    }

    /// Armed (fd, direction) registrations right now.
    #[inline]
    pub fn pending_event_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Total registrations fired early via [`IoManager::cancel_event`],
    /// e.g. by a receive/send timeout.
    #[inline]
    pub fn cancelled_event_count(&self) -> usize {
        self.cancelled_events.load(Ordering::Acquire)
    }

    pub fn schedule(&self, task: Task) {
        scheduler::schedule(self, task);
    }

    pub fn schedule_call(&self, f: impl Fn() + Send + Sync + 'static) {
        scheduler::schedule(self, Task::call(f));
    }

    /// Spawn the workers. Already done by the constructor; harmless to call
    /// again.
    pub fn start(iom: &Arc<IoManager>) {
        scheduler::start(iom);
    }

    /// Stop the scheduler and join the workers. Safe to call repeatedly;
    /// must not be called from a worker.
    pub fn stop(&self) {
        scheduler::stop(self);
    }

    // ── Timers ──

    pub fn add_timer(&self, ms: u64, cb: TimerCallback, recurring: bool) -> Timer {
        self.timers.add_timer(ms, cb, recurring)
    }

    pub fn add_conditional_timer<W>(
        &self,
        ms: u64,
        cb: TimerCallback,
        witness: Weak<W>,
        recurring: bool,
    ) -> Timer
    where
        W: ?Sized + Send + Sync + 'static,
    {
        self.timers.add_conditional_timer(ms, cb, witness, recurring)
    }

    pub fn has_timer(&self) -> bool {
        self.timers.has_timer()
    }

    // ── Event registration ──

    /// Register interest in `dir` on `fd`. Stores `cb` if given, otherwise
    /// the currently running coroutine, to be scheduled on readiness.
    ///
    /// Fails with [`RuntimeError::AlreadyRegistered`] if the direction is
    /// already armed on this fd.
    pub fn add_event(&self, fd: i32, dir: Event, cb: Option<TaskFn>) -> RuntimeResult<()> {
        let fd_ctx = self.ensure_context(fd);
        let mut st = fd_ctx.state.lock();

        if st.events & dir.mask() != 0 {
            log::error!(
                "{}: add_event: {:?} already registered on fd {}",
                self.name(),
                dir,
                fd
            );
            return Err(RuntimeError::AlreadyRegistered(fd));
        }

        let op = if st.events != 0 {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        let mut ev = libc::epoll_event {
            events: libc::EPOLLET as u32 | st.events | dir.mask(),
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) } != 0 {
            let e = errno();
            log::error!(
                "{}: add_event: epoll_ctl({}, {:?}) failed: {}",
                self.name(),
                fd,
                dir,
                std::io::Error::from_raw_os_error(e)
            );
            return Err(RuntimeError::KernelFailure(e));
        }

        self.pending.fetch_add(1, Ordering::AcqRel);
        st.events |= dir.mask();

        let ctx = st.context_mut(dir);
        debug_assert!(!ctx.is_armed());
        ctx.scheduler = self.weak_self.get().cloned().unwrap_or_default();
        match cb {
            Some(f) => ctx.cb = Some(f),
            None => {
                let cur = tls::current();
                debug_assert_eq!(cur.state(), CoState::Running);
                debug_assert!(
                    !cur.id().is_root(),
                    "add_event without a callback requires a running coroutine"
                );
                ctx.co = Some(cur);
            }
        }
        Ok(())
    }

    /// Drop a registration without firing it.
    pub fn del_event(&self, fd: i32, dir: Event) -> bool {
        let Some(fd_ctx) = self.context(fd) else {
            return false;
        };
        let mut st = fd_ctx.state.lock();
        if st.events & dir.mask() == 0 {
            return false;
        }

        let left = st.events & !dir.mask();
        if !self.epoll_update(fd, left, "del_event") {
            return false;
        }

        self.pending.fetch_sub(1, Ordering::AcqRel);
        st.events = left;
        st.context_mut(dir).reset();
        true
    }

    /// Drop a registration and fire its stored coroutine/callable now.
    pub fn cancel_event(&self, fd: i32, dir: Event) -> bool {
        let Some(fd_ctx) = self.context(fd) else {
            return false;
        };
        let mut st = fd_ctx.state.lock();
        if st.events & dir.mask() == 0 {
            return false;
        }

        let left = st.events & !dir.mask();
        if !self.epoll_update(fd, left, "cancel_event") {
            return false;
        }

        self.pending.fetch_sub(1, Ordering::AcqRel);
        self.cancelled_events.fetch_add(1, Ordering::AcqRel);
        st.trigger(dir);
        true
    }

    /// Deregister the fd entirely, firing every armed direction.
    pub fn cancel_all(&self, fd: i32) -> bool {
        let Some(fd_ctx) = self.context(fd) else {
            return false;
        };
        let mut st = fd_ctx.state.lock();
        if st.events == 0 {
            return false;
        }

        if unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) } != 0
        {
            log::error!(
                "{}: cancel_all: epoll_ctl(DEL, {}) failed: {}",
                self.name(),
                fd,
                std::io::Error::from_raw_os_error(errno())
            );
            return false;
        }

        if st.events & Event::Read.mask() != 0 {
            st.trigger(Event::Read);
            self.pending.fetch_sub(1, Ordering::AcqRel);
        }
        if st.events & Event::Write.mask() != 0 {
            st.trigger(Event::Write);
            self.pending.fetch_sub(1, Ordering::AcqRel);
        }
        assert_eq!(st.events, 0);
        true
    }

    // ── Internals ──

    /// MOD the fd's kernel subscription to `left`, or DEL when empty.
    fn epoll_update(&self, fd: i32, left: u32, who: &str) -> bool {
        let op = if left != 0 {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_DEL
        };
        let mut ev = libc::epoll_event {
            events: libc::EPOLLET as u32 | left,
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) } != 0 {
            log::error!(
                "{}: {}: epoll_ctl({}) failed: {}",
                self.name(),
                who,
                fd,
                std::io::Error::from_raw_os_error(errno())
            );
            return false;
        }
        true
    }

    fn ensure_context(&self, fd: i32) -> Arc<FdContext> {
        let idx = fd as usize;
        {
            let contexts = self.contexts.read();
            if idx < contexts.len() {
                return contexts[idx].clone();
            }
        }
        let mut contexts = self.contexts.write();
        grow_contexts(&mut contexts, std::cmp::max(idx * 3 / 2, idx + 1));
        contexts[idx].clone()
    }

    fn context(&self, fd: i32) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        self.contexts.read().get(fd as usize).cloned()
    }

    fn drain_tickle_pipe(&self) {
        let mut buf = [0u8; 256];
        loop {
            let rt = unsafe {
                libc::read(
                    self.tickle_fds[0],
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if rt <= 0 {
                break;
            }
        }
    }
}

impl Schedule for IoManager {
    fn core(&self) -> &SchedulerCore {
        &self.core
    }

    /// Wake a worker sleeping in `epoll_wait` by writing one byte to the
    /// self-pipe. Skipped when nobody is idle.
    fn tickle(&self) {
        if self.core.idle_threads() == 0 {
            return;
        }
        let byte = [b'T'];
        let rt = unsafe {
            libc::write(
                self.tickle_fds[1],
                byte.as_ptr() as *const libc::c_void,
                1,
            )
        };
        if rt != 1 {
            let e = errno();
            // A full pipe already guarantees a pending wakeup
            if e != libc::EAGAIN {
                log::warn!(
                    "{}: tickle write failed: {}",
                    self.name(),
                    std::io::Error::from_raw_os_error(e)
                );
            }
        }
    }

    fn stopping(&self) -> bool {
        !self.timers.has_timer()
            && self.pending_event_count() == 0
            && self.core.base_stopping()
    }

    /// The readiness wait loop, run inside each worker's idle coroutine.
    /// Upgrades the weak handle around each pass and releases it across the
    /// wait itself, so sleeping workers never keep the manager alive.
    fn idle(this: &Weak<Self>) {
        let mut events =
            vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        loop {
            let Some(s) = this.upgrade() else { break };
            if s.stopping() {
                log::debug!("{}: idle exits on thread {}", s.name(), gettid());
                break;
            }

            let epfd = s.epfd;
            let timeout_ms = s
                .timers
                .next_timeout()
                .map(|d| (d.as_millis() as u64).min(MAX_IDLE_TIMEOUT_MS))
                .unwrap_or(MAX_IDLE_TIMEOUT_MS) as i32;
            // Blocked waiters must not hold the manager: stop() wakes us
            // through the self-pipe, and the epoll fd outlives the join.
            drop(s);

            let n = loop {
                let rt = unsafe {
                    libc::epoll_wait(
                        epfd,
                        events.as_mut_ptr(),
                        MAX_EVENTS as i32,
                        timeout_ms,
                    )
                };
                if rt < 0 {
                    let e = errno();
                    if e == libc::EINTR {
                        continue;
                    }
                    log::error!(
                        "idle: epoll_wait failed: {}",
                        std::io::Error::from_raw_os_error(e)
                    );
                    break 0;
                }
                break rt;
            };

            let Some(s) = this.upgrade() else { break };

            // Expired timers become ordinary tasks
            let mut cbs: Vec<TimerCallback> = Vec::new();
            s.timers.drain_expired(&mut cbs);
            for cb in cbs {
                s.schedule(Task::from_fn(cb));
            }

            for ev in events.iter().take(n as usize) {
                if ev.u64 == s.tickle_fds[0] as u64 {
                    // Edge-triggered: drain until empty
                    s.drain_tickle_pipe();
                    continue;
                }

                let fd = ev.u64 as i32;
                let Some(fd_ctx) = s.context(fd) else {
                    continue;
                };
                let mut st = fd_ctx.state.lock();

                // An error or hangup readies every registered direction
                let mut revents = ev.events;
                if revents & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                    revents |= (libc::EPOLLIN | libc::EPOLLOUT) as u32 & st.events;
                }

                let mut ready = 0u32;
                if revents & libc::EPOLLIN as u32 != 0 {
                    ready |= Event::Read.mask();
                }
                if revents & libc::EPOLLOUT as u32 != 0 {
                    ready |= Event::Write.mask();
                }
                if st.events & ready == 0 {
                    continue;
                }

                let left = st.events & !ready;
                if !s.epoll_update(fd_ctx.fd, left, "idle") {
                    continue;
                }

                if ready & Event::Read.mask() != 0 {
                    st.trigger(Event::Read);
                    s.pending.fetch_sub(1, Ordering::AcqRel);
                }
                if ready & Event::Write.mask() != 0 {
                    st.trigger(Event::Write);
                    s.pending.fetch_sub(1, Ordering::AcqRel);
                }
            }

            drop(s);
            // Let the worker loop run whatever we just scheduled
            coroutine::yield_now();
        }
    }

    fn install_thread(s: &Arc<Self>) {
        tls::set_current_io_manager(s);
    }

    fn uninstall_thread(&self) {
        tls::clear_current_io_manager();
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        scheduler::stop(self);
        unsafe {
            libc::close(self.epfd);
            libc::close(self.tickle_fds[0]);
            libc::close(self.tickle_fds[1]);
        }
    }
}

fn grow_contexts(contexts: &mut Vec<Arc<FdContext>>, size: usize) {
    let start = contexts.len();
    if size <= start {
        return;
    }
    contexts.reserve(size - start);
    for fd in start..size {
        contexts.push(Arc::new(FdContext::new(fd as i32)));
    }
}

#[inline]
fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}
