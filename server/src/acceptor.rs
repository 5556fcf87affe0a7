//! Accept loop and load balancer.
//!
//! One or more acceptor threads share the listening socket. Each
//! accepted fd is tuned, checked against the connection limit, and
//! handed to the worker with the fewest connections through that
//! worker's single-producer queue; the worker's waker gets it picked up
//! promptly. An fd is never touched by two workers.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::Sender;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, error, trace, warn};

use crate::metrics::{CONNECTIONS_ACCEPTED, CONNECTIONS_ACTIVE, CONNECTIONS_REJECTED};

const LISTENER_TOKEN: Token = Token(0);
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// The slice of a worker the acceptor needs for handoff.
pub struct WorkerRoute {
    pub connections: Arc<AtomicUsize>,
    pub sender: Sender<TcpStream>,
    pub waker: Arc<Waker>,
}

/// Spawn `count` acceptor threads over clones of `listener`.
pub fn spawn_acceptors(
    listener: std::net::TcpListener,
    count: usize,
    routes: Vec<WorkerRoute>,
    max_connections: usize,
    accept_batch: usize,
    stop: Arc<AtomicBool>,
) -> io::Result<Vec<JoinHandle<()>>> {
    assert!(!routes.is_empty(), "acceptor needs at least one worker");
    let routes = Arc::new(routes);
    let mut handles = Vec::with_capacity(count);

    for id in 0..count {
        let std_listener = listener.try_clone()?;
        std_listener.set_nonblocking(true)?;
        let mio_listener = TcpListener::from_std(std_listener);

        let routes = routes.clone();
        let stop = stop.clone();

        let thread = std::thread::Builder::new()
            .name(format!("acceptor-{id}"))
            .spawn(move || {
                if let Err(e) =
                    run_acceptor(id, mio_listener, &routes, max_connections, accept_batch, &stop)
                {
                    error!(acceptor = id, error = %e, "acceptor failed");
                }
            })
            .expect("failed to spawn acceptor thread");
        handles.push(thread);
    }

    Ok(handles)
}

fn run_acceptor(
    id: usize,
    mut listener: TcpListener,
    routes: &[WorkerRoute],
    max_connections: usize,
    accept_batch: usize,
    stop: &AtomicBool,
) -> io::Result<()> {
    let mut poll = Poll::new()?;
    poll.registry()
        .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
    let mut events = Events::with_capacity(64);

    while !stop.load(Ordering::Relaxed) {
        if let Err(e) = poll.poll(&mut events, Some(POLL_TIMEOUT)) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e);
        }

        if events.iter().any(|e| e.token() == LISTENER_TOKEN) {
            // Edge-triggered: a round that stopped at the quota leaves
            // pending connections that will never re-announce, so keep
            // taking rounds until the backlog is drained.
            while accept_round(&listener, routes, max_connections, accept_batch)
                && !stop.load(Ordering::Relaxed)
            {}
        }
    }

    debug!(acceptor = id, "acceptor stopped");
    Ok(())
}

/// Accept up to `accept_batch` connections. Returns true when the
/// quota was exhausted with the backlog possibly non-empty.
fn accept_round(
    listener: &TcpListener,
    routes: &[WorkerRoute],
    max_connections: usize,
    accept_batch: usize,
) -> bool {
    for _ in 0..accept_batch {
        let (stream, addr) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return false,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = %e, "accept failed");
                return false;
            }
        };

        let total: usize = routes.iter().map(|r| r.connections.load(Ordering::Relaxed)).sum();
        if total >= max_connections {
            CONNECTIONS_REJECTED.increment();
            warn!(%addr, total, "connection limit reached, dropping");
            continue; // dropping the stream closes the fd
        }

        tune_socket(&stream);

        // Least-loaded worker wins; ties go to the first.
        let target = routes
            .iter()
            .min_by_key(|r| r.connections.load(Ordering::Relaxed))
            .expect("routes is non-empty");

        target.connections.fetch_add(1, Ordering::Relaxed);
        CONNECTIONS_ACCEPTED.increment();
        CONNECTIONS_ACTIVE.increment();

        if target.sender.send(stream).is_err() {
            // Worker is gone; undo the bookkeeping.
            target.connections.fetch_sub(1, Ordering::Relaxed);
            CONNECTIONS_ACTIVE.decrement();
            continue;
        }
        let _ = target.waker.wake();
        trace!(%addr, "accepted");
    }
    true
}

/// Socket tuning applied to every accepted connection.
fn tune_socket(stream: &TcpStream) {
    use std::os::fd::{AsRawFd, BorrowedFd};

    // SAFETY: the fd is owned by `stream`, which outlives this borrow.
    let fd = unsafe { BorrowedFd::borrow_raw(stream.as_raw_fd()) };
    let sock = socket2::SockRef::from(&fd);
    let _ = sock.set_nodelay(true);
    let _ = sock.set_recv_buffer_size(256 * 1024);
    let _ = sock.set_send_buffer_size(256 * 1024);
    let keepalive = socket2::TcpKeepalive::new().with_time(Duration::from_secs(60));
    let _ = sock.set_tcp_keepalive(&keepalive);
}
