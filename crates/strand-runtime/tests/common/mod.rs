//! Shared helpers for the runtime integration tests
#![allow(dead_code)]

use std::time::{Duration, Instant};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// IPv4 loopback sockaddr for `port` (0 = kernel-assigned).
pub fn localhost(port: u16) -> libc::sockaddr_in {
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: port.to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from_be_bytes([127, 0, 0, 1]).to_be(),
        },
        sin_zero: [0; 8],
    }
}

/// Bind `fd` to 127.0.0.1 on a kernel-assigned port and return the port.
pub fn bind_ephemeral(fd: i32) -> u16 {
    let addr = localhost(0);
    let rt = unsafe {
        libc::bind(
            fd,
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    assert_eq!(rt, 0, "bind failed: {}", std::io::Error::last_os_error());

    let mut bound: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let rt = unsafe {
        libc::getsockname(
            fd,
            &mut bound as *mut libc::sockaddr_in as *mut libc::sockaddr,
            &mut len,
        )
    };
    assert_eq!(rt, 0);
    u16::from_be(bound.sin_port)
}

/// Spin on the main (non-worker) thread until `cond` holds or `timeout`
/// elapses; returns whether the condition was met.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

pub fn last_errno() -> i32 {
    unsafe { *libc::__errno_location() }
}
