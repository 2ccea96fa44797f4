//! Per-descriptor attribute table
//!
//! Tracks, for every fd the runtime has observed: whether it is a socket,
//! the kernel-side and user-visible non-blocking flags, and per-direction
//! timeouts. Owned by the I/O manager and dropped with it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::io_manager::Event;

/// Timeout sentinel meaning "never".
pub const TIMEOUT_NEVER: u64 = u64::MAX;

/// Attributes of one observed fd.
///
/// On first observation the fd is probed with `fstat`. Sockets are forced to
/// kernel-level non-blocking right here; this is part of the contract, not a
/// hidden side effect. The readiness machinery requires it, and the `fcntl`
/// shim keeps reporting the user's apparent flag, so only code that bypasses
/// the shim sees the real kernel flag.
pub struct FdAttr {
    fd: i32,
    initialized: bool,
    is_socket: bool,
    sys_nonblock: AtomicBool,
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    recv_timeout_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
}

impl FdAttr {
    /// Probe `fd` and build its attribute record.
    fn probe(fd: i32) -> FdAttr {
        let mut statbuf: libc::stat = unsafe { std::mem::zeroed() };
        let rt = unsafe { libc::fstat(fd, &mut statbuf) };

        let (initialized, is_socket) = if rt == -1 {
            (false, false)
        } else {
            (true, (statbuf.st_mode & libc::S_IFMT) == libc::S_IFSOCK)
        };

        let mut sys_nonblock = false;
        if is_socket {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
            if flags & libc::O_NONBLOCK == 0 {
                unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
            }
            sys_nonblock = true;
        }

        FdAttr {
            fd,
            initialized,
            is_socket,
            sys_nonblock: AtomicBool::new(sys_nonblock),
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout_ms: AtomicU64::new(TIMEOUT_NEVER),
            send_timeout_ms: AtomicU64::new(TIMEOUT_NEVER),
        }
    }

    #[inline]
    pub fn fd(&self) -> i32 {
        self.fd
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    #[inline]
    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[inline]
    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_sys_nonblock(&self, v: bool) {
        self.sys_nonblock.store(v, Ordering::Release);
    }

    #[inline]
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_user_nonblock(&self, v: bool) {
        self.user_nonblock.store(v, Ordering::Release);
    }

    /// Per-direction timeout in ms; `TIMEOUT_NEVER` disables it.
    pub fn timeout(&self, dir: Event) -> u64 {
        match dir {
            Event::Read => self.recv_timeout_ms.load(Ordering::Acquire),
            Event::Write => self.send_timeout_ms.load(Ordering::Acquire),
        }
    }

    pub fn set_timeout(&self, dir: Event, ms: u64) {
        match dir {
            Event::Read => self.recv_timeout_ms.store(ms, Ordering::Release),
            Event::Write => self.send_timeout_ms.store(ms, Ordering::Release),
        }
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Table of fd attributes, shared/exclusive locked, grown to 1.5x on demand.
pub struct FdTable {
    entries: RwLock<Vec<Option<Arc<FdAttr>>>>,
}

impl FdTable {
    pub fn new() -> FdTable {
        FdTable {
            entries: RwLock::new(vec![None; 64]),
        }
    }

    /// Look up `fd`, probing and inserting a record when `auto_create` is
    /// set. Returns `None` for invalid fds and for unknown fds without
    /// `auto_create`.
    pub fn get(&self, fd: i32, auto_create: bool) -> Option<Arc<FdAttr>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;

        {
            let entries = self.entries.read();
            if idx < entries.len() {
                if let Some(attr) = &entries[idx] {
                    return Some(attr.clone());
                }
                if !auto_create {
                    return None;
                }
            } else if !auto_create {
                return None;
            }
        }

        let mut entries = self.entries.write();
        if idx >= entries.len() {
            let new_len = std::cmp::max(idx * 3 / 2, idx + 1);
            entries.resize(new_len, None);
        }
        // Another thread may have won the race between the locks
        if let Some(attr) = &entries[idx] {
            return Some(attr.clone());
        }
        let attr = Arc::new(FdAttr::probe(fd));
        entries[idx] = Some(attr.clone());
        Some(attr)
    }

    /// Drop the record for `fd`, marking any outstanding references closed.
    pub fn del(&self, fd: i32) {
        if fd < 0 {
            return;
        }
        let mut entries = self.entries.write();
        let idx = fd as usize;
        if idx >= entries.len() {
            return;
        }
        if let Some(attr) = entries[idx].take() {
            attr.mark_closed();
        }
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_fd_without_create() {
        let table = FdTable::new();
        assert!(table.get(5, false).is_none());
        assert!(table.get(-1, true).is_none());
    }

    #[test]
    fn test_socket_probe_forces_nonblock() {
        let table = FdTable::new();
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);

        let attr = table.get(fd, true).unwrap();
        assert!(attr.is_initialized());
        assert!(attr.is_socket());
        assert!(attr.sys_nonblock());
        assert!(!attr.user_nonblock());

        // The kernel flag really is set
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        assert!(flags & libc::O_NONBLOCK != 0);

        // Second lookup returns the same record
        let again = table.get(fd, false).unwrap();
        assert!(Arc::ptr_eq(&attr, &again));

        table.del(fd);
        assert!(attr.is_closed());
        assert!(table.get(fd, false).is_none());
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_non_socket_is_left_alone() {
        let table = FdTable::new();
        // stdin-like fd: use a pipe end
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        let attr = table.get(fds[0], true).unwrap();
        assert!(attr.is_initialized());
        assert!(!attr.is_socket());
        assert!(!attr.sys_nonblock());

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_table_grows_for_large_fds() {
        let table = FdTable::new();
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        assert!(fd >= 0);
        let target = unsafe { libc::fcntl(fd, libc::F_DUPFD, 200) };
        assert!(target >= 200);

        let attr = table.get(target, true).unwrap();
        assert!(attr.is_socket());

        unsafe {
            libc::close(fd);
            libc::close(target);
        }
    }

    #[test]
    fn test_timeouts_default_never() {
        let table = FdTable::new();
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        let attr = table.get(fd, true).unwrap();

        assert_eq!(attr.timeout(Event::Read), TIMEOUT_NEVER);
        assert_eq!(attr.timeout(Event::Write), TIMEOUT_NEVER);

        attr.set_timeout(Event::Read, 100);
        assert_eq!(attr.timeout(Event::Read), 100);
        assert_eq!(attr.timeout(Event::Write), TIMEOUT_NEVER);

        unsafe { libc::close(fd) };
    }
}
