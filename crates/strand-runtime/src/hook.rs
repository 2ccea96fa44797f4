//! Blocking-call shims
//!
//! Same-shape wrappers for the blocking libc surface. With the per-thread
//! hook flag off (or no I/O manager on the thread, or the fd not a tracked
//! socket, or user-requested non-blocking), each wrapper is the raw call.
//! Otherwise a would-block result suspends the calling coroutine: the shim
//! arms an optional timeout timer, registers the (fd, direction) pair with
//! the I/O manager, yields, and retries once readiness or cancellation
//! resumes it. Return values and errno follow the host syscall contracts.
//!
//! This is an explicit facade, not a dynamic-symbol override: application
//! code calls these by name and the runtime never re-enters itself through
//! an interposed libc.

use std::cell::Cell;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::coroutine;
use crate::fd_table::TIMEOUT_NEVER;
use crate::io_manager::{Event, IoManager};
use crate::scheduler::{Task, TaskFn};
use crate::tls;

thread_local! {
    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };
}

/// Whether shims on this thread emulate blocking via the runtime.
pub fn is_hook_enable() -> bool {
    HOOK_ENABLED.with(|c| c.get())
}

/// Enable or disable shim interception for the calling thread.
pub fn set_hook_enable(flag: bool) {
    HOOK_ENABLED.with(|c| c.set(flag));
}

/// Default timeout applied by `connect`; never by default.
static CONNECT_TIMEOUT_MS: AtomicU64 = AtomicU64::new(TIMEOUT_NEVER);

/// Set the process-wide default connect timeout in milliseconds.
pub fn set_connect_timeout(ms: u64) {
    CONNECT_TIMEOUT_MS.store(ms, Ordering::Release);
}

/// Shared between a pending operation and its timeout callback.
struct OpState {
    /// 0, or the errno the operation was cancelled with
    cancelled: AtomicI32,
}

impl OpState {
    fn new() -> OpState {
        OpState {
            cancelled: AtomicI32::new(0),
        }
    }
}

#[inline]
fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

#[inline]
fn set_errno(e: i32) {
    unsafe { *libc::__errno_location() = e };
}

/// Core of every data-path shim: try the raw call, and on would-block
/// register + park until readiness, timeout or close cancels the wait.
fn do_io<F>(fd: i32, dir: Event, name: &str, mut raw: F) -> isize
where
    F: FnMut() -> isize,
{
    if !is_hook_enable() {
        return raw();
    }
    let Some(iom) = IoManager::current() else {
        return raw();
    };
    let Some(attr) = iom.fd_table().get(fd, false) else {
        return raw();
    };
    if attr.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !attr.is_socket() || attr.user_nonblock() {
        return raw();
    }

    let timeout = attr.timeout(dir);
    let op_state = Arc::new(OpState::new());

    loop {
        // A close may have landed while we were parked
        if attr.is_closed() {
            set_errno(libc::EBADF);
            return -1;
        }

        let mut n = raw();
        while n == -1 && errno() == libc::EINTR {
            n = raw();
        }
        if n != -1 || errno() != libc::EAGAIN {
            return n;
        }

        // Would block. Arm the per-direction timeout (elided if the
        // operation completes first), register interest, and park.
        let timer = if timeout != TIMEOUT_NEVER {
            let state = Arc::downgrade(&op_state);
            let wiom = Arc::downgrade(&iom);
            let cb: TaskFn = Arc::new(move || {
                let Some(st) = state.upgrade() else { return };
                if st.cancelled.load(Ordering::Acquire) != 0 {
                    return;
                }
                st.cancelled.store(libc::ETIMEDOUT, Ordering::Release);
                if let Some(m) = wiom.upgrade() {
                    m.cancel_event(fd, dir);
                }
            });
            Some(iom.add_conditional_timer(timeout, cb, Arc::downgrade(&op_state), false))
        } else {
            None
        };

        match iom.add_event(fd, dir, None) {
            Err(e) => {
                log::error!("{}: add_event({}, {:?}) failed: {}", name, fd, dir, e);
                if let Some(t) = timer {
                    t.cancel();
                }
                return -1;
            }
            Ok(()) => {
                coroutine::yield_now();
                // Resumed by readiness, cancel_event or cancel_all
                if let Some(t) = &timer {
                    t.cancel();
                }
                let cancelled = op_state.cancelled.load(Ordering::Acquire);
                if cancelled != 0 {
                    set_errno(cancelled);
                    return -1;
                }
            }
        }
    }
}

// ── Sleeping ──

fn timed_park(iom: &Arc<IoManager>, ms: u64) {
    let co = tls::current();
    let wiom = Arc::downgrade(iom);
    iom.add_timer(
        ms,
        Arc::new(move || {
            if let Some(m) = wiom.upgrade() {
                m.schedule(Task::from_coroutine(co.clone()));
            }
        }),
        false,
    );
    coroutine::yield_now();
}

pub fn sleep(seconds: u32) -> u32 {
    let ms = seconds as u64 * 1000;
    if !is_hook_enable() || !tls::in_coroutine() {
        std::thread::sleep(Duration::from_millis(ms));
        return 0;
    }
    match IoManager::current() {
        Some(iom) => timed_park(&iom, ms),
        None => std::thread::sleep(Duration::from_millis(ms)),
    }
    0
}

pub fn usleep(usec: u32) -> i32 {
    if !is_hook_enable() || !tls::in_coroutine() {
        std::thread::sleep(Duration::from_micros(usec as u64));
        return 0;
    }
    match IoManager::current() {
        Some(iom) => timed_park(&iom, usec as u64 / 1000),
        None => std::thread::sleep(Duration::from_micros(usec as u64)),
    }
    0
}

pub fn nanosleep(req: &libc::timespec, rem: Option<&mut libc::timespec>) -> i32 {
    if !is_hook_enable() || !tls::in_coroutine() {
        let rem_ptr = rem.map(|r| r as *mut _).unwrap_or(std::ptr::null_mut());
        return unsafe { libc::nanosleep(req, rem_ptr) };
    }
    let ms = req.tv_sec as u64 * 1000 + req.tv_nsec as u64 / 1_000_000;
    match IoManager::current() {
        Some(iom) => timed_park(&iom, ms),
        None => std::thread::sleep(Duration::from_millis(ms)),
    }
    0
}

// ── Socket lifecycle ──

pub fn socket(domain: i32, ty: i32, protocol: i32) -> i32 {
    if !is_hook_enable() {
        return unsafe { libc::socket(domain, ty, protocol) };
    }
    let fd = unsafe { libc::socket(domain, ty, protocol) };
    if fd == -1 {
        log::error!("socket() failed: {}", std::io::Error::last_os_error());
        return fd;
    }
    // First observation: probes the fd and forces kernel non-blocking
    if let Some(iom) = IoManager::current() {
        iom.fd_table().get(fd, true);
    }
    fd
}

pub fn connect_with_timeout(
    fd: i32,
    addr: *const libc::sockaddr,
    addrlen: libc::socklen_t,
    timeout_ms: u64,
) -> i32 {
    if !is_hook_enable() {
        return unsafe { libc::connect(fd, addr, addrlen) };
    }
    let Some(iom) = IoManager::current() else {
        return unsafe { libc::connect(fd, addr, addrlen) };
    };
    let Some(attr) = iom.fd_table().get(fd, false) else {
        set_errno(libc::EBADF);
        return -1;
    };
    if attr.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !attr.is_socket() || attr.user_nonblock() {
        return unsafe { libc::connect(fd, addr, addrlen) };
    }

    let n = unsafe { libc::connect(fd, addr, addrlen) };
    if n == 0 {
        return 0;
    }
    if n != -1 || errno() != libc::EINPROGRESS {
        return n;
    }

    // Connection in progress: wait for writability
    let op_state = Arc::new(OpState::new());
    let timer = if timeout_ms != TIMEOUT_NEVER {
        let state = Arc::downgrade(&op_state);
        let wiom = Arc::downgrade(&iom);
        let cb: TaskFn = Arc::new(move || {
            let Some(st) = state.upgrade() else { return };
            if st.cancelled.load(Ordering::Acquire) != 0 {
                return;
            }
            st.cancelled.store(libc::ETIMEDOUT, Ordering::Release);
            if let Some(m) = wiom.upgrade() {
                m.cancel_event(fd, Event::Write);
            }
        });
        Some(iom.add_conditional_timer(timeout_ms, cb, Arc::downgrade(&op_state), false))
    } else {
        None
    };

    match iom.add_event(fd, Event::Write, None) {
        Ok(()) => {
            coroutine::yield_now();
            if let Some(t) = &timer {
                t.cancel();
            }
            let cancelled = op_state.cancelled.load(Ordering::Acquire);
            if cancelled != 0 {
                set_errno(cancelled);
                return -1;
            }
        }
        Err(e) => {
            if let Some(t) = timer {
                t.cancel();
            }
            log::error!("connect: add_event({}, WRITE) failed: {}", fd, e);
        }
    }

    // Writable: the handshake finished one way or the other
    let mut error: i32 = 0;
    let mut len = std::mem::size_of::<i32>() as libc::socklen_t;
    let rt = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut error as *mut i32 as *mut libc::c_void,
            &mut len,
        )
    };
    if rt == -1 {
        return -1;
    }
    if error == 0 {
        0
    } else {
        set_errno(error);
        -1
    }
}

pub fn connect(fd: i32, addr: *const libc::sockaddr, addrlen: libc::socklen_t) -> i32 {
    connect_with_timeout(fd, addr, addrlen, CONNECT_TIMEOUT_MS.load(Ordering::Acquire))
}

pub fn accept(fd: i32, addr: *mut libc::sockaddr, addrlen: *mut libc::socklen_t) -> i32 {
    let new_fd = do_io(fd, Event::Read, "accept", || unsafe {
        libc::accept(fd, addr, addrlen) as isize
    }) as i32;
    if new_fd >= 0 {
        // Track the accepted socket like one made through socket()
        if let Some(iom) = IoManager::current() {
            iom.fd_table().get(new_fd, true);
        }
    }
    new_fd
}

pub fn close(fd: i32) -> i32 {
    if !is_hook_enable() {
        return unsafe { libc::close(fd) };
    }
    if let Some(iom) = IoManager::current() {
        if iom.fd_table().get(fd, false).is_some() {
            // Mark the record closed before firing waiters, so a resumed
            // operation observes EBADF instead of re-registering on an fd
            // that is about to go away
            iom.fd_table().del(fd);
            iom.cancel_all(fd);
        }
    }
    unsafe { libc::close(fd) }
}

// ── Reads ──

pub fn read(fd: i32, buf: &mut [u8]) -> isize {
    let ptr = buf.as_mut_ptr();
    let len = buf.len();
    do_io(fd, Event::Read, "read", || unsafe {
        libc::read(fd, ptr as *mut libc::c_void, len)
    })
}

pub fn readv(fd: i32, iov: *const libc::iovec, iovcnt: i32) -> isize {
    do_io(fd, Event::Read, "readv", || unsafe {
        libc::readv(fd, iov, iovcnt)
    })
}

pub fn recv(fd: i32, buf: &mut [u8], flags: i32) -> isize {
    let ptr = buf.as_mut_ptr();
    let len = buf.len();
    do_io(fd, Event::Read, "recv", || unsafe {
        libc::recv(fd, ptr as *mut libc::c_void, len, flags)
    })
}

pub fn recvfrom(
    fd: i32,
    buf: &mut [u8],
    flags: i32,
    src_addr: *mut libc::sockaddr,
    addrlen: *mut libc::socklen_t,
) -> isize {
    let ptr = buf.as_mut_ptr();
    let len = buf.len();
    do_io(fd, Event::Read, "recvfrom", || unsafe {
        libc::recvfrom(fd, ptr as *mut libc::c_void, len, flags, src_addr, addrlen)
    })
}

pub fn recvmsg(fd: i32, msg: *mut libc::msghdr, flags: i32) -> isize {
    do_io(fd, Event::Read, "recvmsg", || unsafe {
        libc::recvmsg(fd, msg, flags)
    })
}

// ── Writes ──

pub fn write(fd: i32, buf: &[u8]) -> isize {
    let ptr = buf.as_ptr();
    let len = buf.len();
    do_io(fd, Event::Write, "write", || unsafe {
        libc::write(fd, ptr as *const libc::c_void, len)
    })
}

pub fn writev(fd: i32, iov: *const libc::iovec, iovcnt: i32) -> isize {
    do_io(fd, Event::Write, "writev", || unsafe {
        libc::writev(fd, iov, iovcnt)
    })
}

pub fn send(fd: i32, buf: &[u8], flags: i32) -> isize {
    let ptr = buf.as_ptr();
    let len = buf.len();
    do_io(fd, Event::Write, "send", || unsafe {
        libc::send(fd, ptr as *const libc::c_void, len, flags)
    })
}

pub fn sendto(
    fd: i32,
    buf: &[u8],
    flags: i32,
    dest_addr: *const libc::sockaddr,
    addrlen: libc::socklen_t,
) -> isize {
    let ptr = buf.as_ptr();
    let len = buf.len();
    do_io(fd, Event::Write, "sendto", || unsafe {
        libc::sendto(fd, ptr as *const libc::c_void, len, flags, dest_addr, addrlen)
    })
}

pub fn sendmsg(fd: i32, msg: *const libc::msghdr, flags: i32) -> isize {
    do_io(fd, Event::Write, "sendmsg", || unsafe {
        libc::sendmsg(fd, msg, flags)
    })
}

// ── Flag plumbing ──

/// `fcntl` with the non-blocking reconciliation: the kernel flag stays
/// forced on for tracked sockets, while F_GETFL/F_SETFL present the user's
/// apparent flag. `arg` carries both integer and pointer arguments.
pub fn fcntl(fd: i32, cmd: i32, arg: usize) -> i32 {
    match cmd {
        libc::F_SETFL => {
            let mut flags = arg as i32;
            let attr = IoManager::current().and_then(|m| m.fd_table().get(fd, false));
            match attr {
                Some(a) if !a.is_closed() && a.is_socket() => {
                    a.set_user_nonblock(flags & libc::O_NONBLOCK != 0);
                    if a.sys_nonblock() {
                        flags |= libc::O_NONBLOCK;
                    } else {
                        flags &= !libc::O_NONBLOCK;
                    }
                    unsafe { libc::fcntl(fd, cmd, flags) }
                }
                _ => unsafe { libc::fcntl(fd, cmd, arg as i32) },
            }
        }
        libc::F_GETFL => {
            let flags = unsafe { libc::fcntl(fd, cmd) };
            let attr = IoManager::current().and_then(|m| m.fd_table().get(fd, false));
            match attr {
                Some(a) if !a.is_closed() && a.is_socket() => {
                    if a.user_nonblock() {
                        flags | libc::O_NONBLOCK
                    } else {
                        flags & !libc::O_NONBLOCK
                    }
                }
                _ => flags,
            }
        }
        _ => unsafe { libc::fcntl(fd, cmd, arg) },
    }
}

pub fn ioctl(fd: i32, request: libc::c_ulong, arg: *mut libc::c_void) -> i32 {
    if request == libc::FIONBIO as libc::c_ulong {
        let user_nonblock = unsafe { *(arg as *const i32) } != 0;
        if let Some(attr) = IoManager::current().and_then(|m| m.fd_table().get(fd, false)) {
            if !attr.is_closed() && attr.is_socket() {
                attr.set_user_nonblock(user_nonblock);
            }
        }
    }
    unsafe { libc::ioctl(fd, request, arg) }
}

pub fn getsockopt(
    fd: i32,
    level: i32,
    optname: i32,
    optval: *mut libc::c_void,
    optlen: *mut libc::socklen_t,
) -> i32 {
    unsafe { libc::getsockopt(fd, level, optname, optval, optlen) }
}

/// Intercepts SO_RCVTIMEO/SO_SNDTIMEO to drive the shim timeouts, then
/// delegates. A zero timeval means no timeout, per the socket contract.
pub fn setsockopt(
    fd: i32,
    level: i32,
    optname: i32,
    optval: *const libc::c_void,
    optlen: libc::socklen_t,
) -> i32 {
    if is_hook_enable()
        && level == libc::SOL_SOCKET
        && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO)
    {
        if let Some(attr) = IoManager::current().and_then(|m| m.fd_table().get(fd, false)) {
            let tv = unsafe { &*(optval as *const libc::timeval) };
            let ms = tv.tv_sec as u64 * 1000 + tv.tv_usec as u64 / 1000;
            let dir = if optname == libc::SO_RCVTIMEO {
                Event::Read
            } else {
                Event::Write
            };
            attr.set_timeout(dir, if ms == 0 { TIMEOUT_NEVER } else { ms });
        }
    }
    unsafe { libc::setsockopt(fd, level, optname, optval, optlen) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hook_flag_is_per_thread() {
        assert!(!is_hook_enable());
        set_hook_enable(true);
        assert!(is_hook_enable());

        let handle = std::thread::spawn(|| is_hook_enable());
        assert!(!handle.join().unwrap());

        set_hook_enable(false);
    }

    #[test]
    fn test_disabled_shim_is_raw_passthrough() {
        // No hook, no manager: read on a pipe behaves exactly like libc
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        assert_eq!(write(fds[1], b"ab"), 2);

        let mut buf = [0u8; 8];
        assert_eq!(read(fds[0], &mut buf), 2);
        assert_eq!(&buf[..2], b"ab");

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
