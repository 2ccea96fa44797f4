//! Echo client demo
//!
//! Spawns a batch of client coroutines that all connect to an echo server,
//! send a message repeatedly and read the echoes back. Every blocking call
//! goes through the shims, so the whole batch multiplexes over a handful of
//! worker threads.
//!
//! Run an echo server on 127.0.0.1:8080, then:
//!
//! ```text
//! cargo run --example echo_client
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use strand::{hook, IoManager};

const SERVER_PORT: u16 = 8080;
const MESSAGE: &[u8] = b"Hello, Server!";
const NUM_CLIENTS: usize = 100;
const ROUNDS: usize = 50;

fn server_addr() -> libc::sockaddr_in {
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: SERVER_PORT.to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from_be_bytes([127, 0, 0, 1]).to_be(),
        },
        sin_zero: [0; 8],
    }
}

fn client_task(total_requests: &AtomicUsize) {
    let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
    if fd < 0 {
        eprintln!("socket failed: {}", std::io::Error::last_os_error());
        return;
    }

    let addr = server_addr();
    let rt = hook::connect(
        fd,
        &addr as *const libc::sockaddr_in as *const libc::sockaddr,
        std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
    );
    if rt != 0 {
        eprintln!("connect failed: {}", std::io::Error::last_os_error());
        hook::close(fd);
        return;
    }

    let mut buf = [0u8; 1024];
    for _ in 0..ROUNDS {
        let sent = hook::send(fd, MESSAGE, 0);
        if sent < 0 {
            eprintln!("send failed: {}", std::io::Error::last_os_error());
            break;
        }

        let n = hook::recv(fd, &mut buf, 0);
        if n <= 0 {
            eprintln!("recv failed: {}", std::io::Error::last_os_error());
            break;
        }
        total_requests.fetch_add(1, Ordering::Relaxed);
    }

    hook::close(fd);
}

fn main() {
    env_logger::init();

    let iom = IoManager::new(4, false, "echo-client").unwrap();
    let total_requests = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicUsize::new(0));

    println!("connecting {} clients to 127.0.0.1:{}", NUM_CLIENTS, SERVER_PORT);
    for _ in 0..NUM_CLIENTS {
        let total = total_requests.clone();
        let done = finished.clone();
        iom.schedule_call(move || {
            client_task(&total);
            done.fetch_add(1, Ordering::Relaxed);
        });
    }

    while finished.load(Ordering::Relaxed) < NUM_CLIENTS {
        std::thread::sleep(Duration::from_millis(50));
    }
    println!("total echoed requests: {}", total_requests.load(Ordering::Relaxed));

    iom.stop();
}
