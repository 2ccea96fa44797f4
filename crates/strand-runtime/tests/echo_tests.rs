//! End-to-end echo round-trip through the blocking-call shims: a listener
//! coroutine accepts, reads a fixed message and writes it back; a client
//! coroutine connects, sends and reads the echo. Both sides park in the
//! runtime instead of blocking their workers.

mod common;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use strand_runtime::{hook, IoManager};

use common::{bind_ephemeral, init_logging, localhost, wait_until};

const MSG: &[u8] = b"hello";

fn read_exact(fd: i32, want: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(want);
    let mut buf = [0u8; 64];
    while out.len() < want {
        let n = hook::recv(fd, &mut buf, 0);
        assert!(n > 0, "recv failed: {}", std::io::Error::last_os_error());
        out.extend_from_slice(&buf[..n as usize]);
    }
    out
}

fn write_all(fd: i32, mut data: &[u8]) {
    while !data.is_empty() {
        let n = hook::send(fd, data, 0);
        assert!(n > 0, "send failed: {}", std::io::Error::last_os_error());
        data = &data[n as usize..];
    }
}

#[test]
fn echo_round_trip() {
    init_logging();
    let iom = IoManager::new(3, false, "t-echo").unwrap();

    let port = Arc::new(Mutex::new(None::<u16>));
    let echoed = Arc::new(Mutex::new(None::<Vec<u8>>));

    // Listener coroutine
    let p = port.clone();
    iom.schedule_call(move || {
        let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(fd >= 0);

        let opt: i32 = 1;
        unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &opt as *const i32 as *const libc::c_void,
                4,
            );
        }
        let bound = bind_ephemeral(fd);
        assert_eq!(unsafe { libc::listen(fd, 128) }, 0);
        *p.lock() = Some(bound);

        // Parks until the client connects
        let client = hook::accept(fd, std::ptr::null_mut(), std::ptr::null_mut());
        assert!(client >= 0, "accept failed: {}", std::io::Error::last_os_error());

        let msg = read_exact(client, MSG.len());
        assert_eq!(msg, MSG);
        write_all(client, &msg);

        hook::close(client);
        hook::close(fd);
    });

    // Client coroutine
    let p = port.clone();
    let e = echoed.clone();
    iom.schedule_call(move || {
        let bound = loop {
            if let Some(bound) = *p.lock() {
                break bound;
            }
            hook::usleep(5_000);
        };

        let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(fd >= 0);

        let addr = localhost(bound);
        let rt = hook::connect(
            fd,
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        );
        assert_eq!(rt, 0, "connect failed: {}", std::io::Error::last_os_error());

        write_all(fd, MSG);
        let reply = read_exact(fd, MSG.len());
        hook::close(fd);

        *e.lock() = Some(reply);
    });

    assert!(wait_until(Duration::from_secs(5), || echoed.lock().is_some()));
    assert_eq!(echoed.lock().take().unwrap(), MSG);
    assert_eq!(iom.pending_event_count(), 0);

    iom.stop();
}

#[test]
fn connect_reports_refused_connections() {
    init_logging();
    let iom = IoManager::new(2, false, "t-refused").unwrap();

    // Find a port with no listener: bind, note the port, close
    let probe = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    let dead_port = bind_ephemeral(probe);
    unsafe { libc::close(probe) };

    let result = Arc::new(Mutex::new(None::<(i32, i32)>));
    let r = result.clone();
    iom.schedule_call(move || {
        let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(fd >= 0);

        let addr = localhost(dead_port);
        let rt = hook::connect(
            fd,
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        );
        let err = unsafe { *libc::__errno_location() };
        *r.lock() = Some((rt, err));
        hook::close(fd);
    });

    assert!(wait_until(Duration::from_secs(5), || result.lock().is_some()));
    let (rt, err) = result.lock().take().unwrap();
    assert_eq!(rt, -1);
    assert_eq!(err, libc::ECONNREFUSED);

    iom.stop();
}
