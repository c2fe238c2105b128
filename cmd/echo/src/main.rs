//! # fibra TCP echo server
//!
//! The listener and every connection are reactor descriptors. Readiness
//! is delivered to handler callbacks that run in fibers, so handlers may
//! block on fibra primitives without stalling the reactor thread.
//!
//! ## Usage
//!
//!     cargo run -p fibra-echo --release -- [--port 9000] [--groups 2] [--workers 4]
//!
//! ## Try it
//!
//!     echo hello | nc -q1 127.0.0.1 9000

use fibra::{
    kerror, kinfo, kwarn, CleanupReason, Descriptor, DescriptorHandler, EventAction, Interest,
    Reactor, Runtime, RuntimeConfig,
};

use std::net::TcpListener;
use std::os::fd::{FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const RECV_BUF_SIZE: usize = 16 * 1024;

static RUNNING: AtomicBool = AtomicBool::new(true);
static TOTAL_BYTES: AtomicU64 = AtomicU64::new(0);
static TOTAL_CONNECTIONS: AtomicU64 = AtomicU64::new(0);
static ACTIVE_CONNECTIONS: AtomicU64 = AtomicU64::new(0);

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

// ── Connection ──

struct Connection;

impl Connection {
    /// Write all of `data`, yielding while the socket buffer is full.
    fn write_all(fd: i32, mut data: &[u8]) -> Result<(), i32> {
        while !data.is_empty() {
            let n = unsafe { libc::send(fd, data.as_ptr().cast(), data.len(), libc::MSG_NOSIGNAL) };
            if n < 0 {
                match errno() {
                    libc::EAGAIN | libc::EINTR => {
                        fibra::yield_now();
                        continue;
                    }
                    e => return Err(e),
                }
            }
            data = &data[n as usize..];
        }
        Ok(())
    }
}

impl DescriptorHandler for Connection {
    fn on_readable(&self, desc: &Arc<Descriptor>) -> EventAction {
        let mut buf = [0u8; RECV_BUF_SIZE];
        loop {
            let n = unsafe { libc::recv(desc.fd(), buf.as_mut_ptr().cast(), buf.len(), 0) };
            if n == 0 {
                desc.kill(CleanupReason::Disconnect);
                return EventAction::Leaving;
            }
            if n < 0 {
                match errno() {
                    libc::EAGAIN => return EventAction::Ready,
                    libc::EINTR => continue,
                    _ => {
                        desc.kill(CleanupReason::Error);
                        return EventAction::Leaving;
                    }
                }
            }
            let n = n as usize;
            if let Err(e) = Self::write_all(desc.fd(), &buf[..n]) {
                kwarn!("{}: write failed: errno {}", desc.name(), e);
                desc.kill(CleanupReason::Error);
                return EventAction::Leaving;
            }
            TOTAL_BYTES.fetch_add(n as u64, Ordering::Relaxed);
        }
    }

    fn on_error(&self, desc: &Arc<Descriptor>, errno: i32) {
        kwarn!("{}: socket error {}", desc.name(), errno);
    }

    fn on_cleanup(&self, _desc: &Arc<Descriptor>, _reason: CleanupReason) {
        ACTIVE_CONNECTIONS.fetch_sub(1, Ordering::Relaxed);
    }
}

// ── Listener ──

/// Accepts until `EAGAIN` and spreads new connections across groups.
struct Acceptor {
    groups: usize,
    next: AtomicUsize,
}

impl Acceptor {
    fn adopt(&self, fd: OwnedFd) {
        let id = TOTAL_CONNECTIONS.fetch_add(1, Ordering::Relaxed);
        let conn = Descriptor::new(fd, Interest::READ, format!("conn-{}", id), Connection);
        let group = self.next.fetch_add(1, Ordering::Relaxed) % self.groups;
        let attached = Reactor::for_group(group).and_then(|r| r.attach(&conn));
        match attached {
            Ok(()) => {
                ACTIVE_CONNECTIONS.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => kerror!("conn-{}: attach failed: {}", id, e),
        }
    }
}

impl DescriptorHandler for Acceptor {
    fn on_readable(&self, desc: &Arc<Descriptor>) -> EventAction {
        loop {
            let fd = unsafe {
                libc::accept4(
                    desc.fd(),
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };
            if fd < 0 {
                match errno() {
                    libc::EAGAIN => return EventAction::Ready,
                    libc::EINTR | libc::ECONNABORTED => continue,
                    libc::EMFILE | libc::ENFILE => {
                        // Out of descriptors: back off and try again later
                        kwarn!("accept: descriptor table full, pausing");
                        desc.restart_read_in(Duration::from_millis(100));
                        return EventAction::Suppress;
                    }
                    e => {
                        kerror!("accept failed: errno {}", e);
                        return EventAction::Ready;
                    }
                }
            }
            // Safety: accept4 returned a fresh descriptor
            self.adopt(unsafe { OwnedFd::from_raw_fd(fd) });
        }
    }

    fn on_cleanup(&self, desc: &Arc<Descriptor>, reason: CleanupReason) {
        kinfo!("{} closed: {:?}", desc.name(), reason);
    }
}

// ── Main ──

fn parse_args(config: &mut RuntimeConfig) -> u16 {
    let mut port: u16 = fibra::env_get("FIBRA_ECHO_PORT", 9000);
    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1).and_then(|s| s.parse::<usize>().ok());
        match (args[i].as_str(), value) {
            ("--port" | "-p", Some(p)) => port = p as u16,
            ("--groups" | "-g", Some(g)) => config.scheduling_groups = g,
            ("--workers" | "-w", Some(w)) => config.workers_per_group = w,
            (other, _) => {
                eprintln!("fibra-echo: ignoring argument {}", other);
                i += 1;
                continue;
            }
        }
        i += 2;
    }
    port
}

fn main() {
    fibra::init_logging();

    let mut config = RuntimeConfig::from_env().enable_reactor(true);
    let port = parse_args(&mut config);
    let groups = config.scheduling_groups;

    unsafe {
        libc::signal(libc::SIGINT, handle_sigint as usize);
        libc::signal(libc::SIGTERM, handle_sigint as usize);
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    let mut runtime = Runtime::new(config);
    if let Err(e) = runtime.start() {
        eprintln!("fibra-echo: failed to start runtime: {}", e);
        std::process::exit(1);
    }

    let started = Instant::now();
    let stats = fibra::set_periodic_timer(
        Instant::now() + Duration::from_secs(5),
        Duration::from_secs(5),
        move |_| {
            eprintln!(
                "[{:.1}s] active={} total_conns={} bytes={} fibers={}",
                started.elapsed().as_secs_f64(),
                ACTIVE_CONNECTIONS.load(Ordering::Relaxed),
                TOTAL_CONNECTIONS.load(Ordering::Relaxed),
                TOTAL_BYTES.load(Ordering::Relaxed),
                fibra::fiber_count(),
            );
        },
    );

    let served = runtime.block_on(move || {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .and_then(|l| l.set_nonblocking(true).map(|()| l));
        let listener = match listener {
            Ok(l) => l,
            Err(e) => {
                kerror!("bind 0.0.0.0:{} failed: {}", port, e);
                return false;
            }
        };

        let acceptor = Acceptor {
            groups,
            next: AtomicUsize::new(0),
        };
        let desc = Descriptor::new(OwnedFd::from(listener), Interest::READ, "listener", acceptor);
        if let Err(e) = Reactor::current().and_then(|r| r.attach(&desc)) {
            kerror!("listener attach failed: {}", e);
            return false;
        }
        eprintln!("fibra-echo: listening on 0.0.0.0:{} ({} groups)", port, groups);

        while RUNNING.load(Ordering::Relaxed) {
            fibra::sleep_for(Duration::from_millis(100));
        }

        desc.kill(CleanupReason::Shutdown);
        desc.wait_for_cleanup();
        true
    });

    if let Ok(id) = stats {
        fibra::kill_timer(id);
    }
    if let Err(e) = runtime.shutdown() {
        eprintln!("fibra-echo: shutdown: {}", e);
    }

    eprintln!(
        "\nfibra-echo: {} connections, {} bytes echoed",
        TOTAL_CONNECTIONS.load(Ordering::Relaxed),
        TOTAL_BYTES.load(Ordering::Relaxed),
    );
    if !served {
        std::process::exit(1);
    }
}

extern "C" fn handle_sigint(_sig: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}
