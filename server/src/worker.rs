//! Worker reactors.
//!
//! Each worker is a single-threaded epoll loop (via mio, which is
//! edge-triggered) owning a disjoint set of connections. The acceptor
//! hands fds over through a channel and pokes the worker's waker; from
//! then on the worker is the only thread that touches them.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use slab::Slab;
use tracing::{debug, error, trace, warn};

use crate::acceptor::WorkerRoute;
use crate::affinity::set_cpu_affinity;
use crate::connection::Connection;
use crate::dispatch::DispatchContext;
use crate::metrics::CONNECTIONS_ACTIVE;

/// Reserved token for the cross-thread waker.
const WAKER_TOKEN: Token = Token(usize::MAX);

/// Poll timeout; also bounds how long shutdown takes to observe.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// A running worker as seen from the acceptor and the server loop.
pub struct WorkerHandle {
    pub id: usize,
    /// Connections currently assigned, maintained jointly by the
    /// acceptor (increment at handoff) and the worker (decrement at
    /// close).
    pub connections: Arc<AtomicUsize>,
    pub sender: Sender<TcpStream>,
    pub waker: Arc<Waker>,
    pub thread: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn route(&self) -> WorkerRoute {
        WorkerRoute {
            connections: self.connections.clone(),
            sender: self.sender.clone(),
            waker: self.waker.clone(),
        }
    }
}

/// Spawn the worker pool.
pub fn spawn_workers(
    count: usize,
    pin_workers: bool,
    buffer_size: usize,
    ctx: &DispatchContext,
    stop: &Arc<AtomicBool>,
) -> io::Result<Vec<WorkerHandle>> {
    let cpus = num_cpus::get();
    let mut handles = Vec::with_capacity(count);

    for id in 0..count {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let (sender, receiver) = crossbeam_channel::unbounded();
        let connections = Arc::new(AtomicUsize::new(0));

        let ctx = ctx.clone();
        let stop = stop.clone();
        let conn_count = connections.clone();
        let cpu = pin_workers.then_some(id % cpus);

        let thread = std::thread::Builder::new()
            .name(format!("worker-{id}"))
            .spawn(move || {
                if let Some(cpu) = cpu {
                    if let Err(e) = set_cpu_affinity(cpu) {
                        warn!(worker = id, cpu, error = %e, "failed to pin worker");
                    }
                }
                run_worker(id, poll, receiver, ctx, stop, conn_count, buffer_size);
            })
            .expect("failed to spawn worker thread");

        handles.push(WorkerHandle {
            id,
            connections,
            sender,
            waker,
            thread,
        });
    }

    Ok(handles)
}

fn run_worker(
    id: usize,
    mut poll: Poll,
    receiver: Receiver<TcpStream>,
    ctx: DispatchContext,
    stop: Arc<AtomicBool>,
    conn_count: Arc<AtomicUsize>,
    buffer_size: usize,
) {
    let mut events = Events::with_capacity(1024);
    let mut conns: Slab<Connection> = Slab::with_capacity(256);
    let mut scratch = vec![0u8; 64 * 1024];

    while !stop.load(Ordering::Relaxed) {
        if let Err(e) = poll.poll(&mut events, Some(POLL_TIMEOUT)) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!(worker = id, error = %e, "poll failed");
            break;
        }

        for event in events.iter() {
            let token = event.token();
            if token == WAKER_TOKEN {
                continue; // add-queue is drained after the event loop
            }
            handle_event(
                poll.registry(),
                &mut conns,
                token,
                event.is_readable() || event.is_read_closed(),
                event.is_writable(),
                event.is_error(),
                &ctx,
                &mut scratch,
                &conn_count,
            );
        }

        // Pick up connections the acceptor assigned to us.
        while let Ok(stream) = receiver.try_recv() {
            register_connection(poll.registry(), &mut conns, stream, buffer_size, &conn_count);
        }
    }

    // Shutdown: drop every owned connection.
    let open = conns.len();
    for (_, conn) in conns.iter_mut() {
        let _ = poll.registry().deregister(&mut conn.stream);
        conn_count.fetch_sub(1, Ordering::Relaxed);
        CONNECTIONS_ACTIVE.decrement();
    }
    debug!(worker = id, dropped = open, "worker stopped");
}

fn register_connection(
    registry: &Registry,
    conns: &mut Slab<Connection>,
    stream: TcpStream,
    buffer_size: usize,
    conn_count: &AtomicUsize,
) {
    let entry = conns.vacant_entry();
    let token = Token(entry.key());
    let mut conn = Connection::new(stream, buffer_size);

    if let Err(e) = registry.register(&mut conn.stream, token, Interest::READABLE) {
        warn!(error = %e, "failed to register connection");
        conn_count.fetch_sub(1, Ordering::Relaxed);
        CONNECTIONS_ACTIVE.decrement();
        return;
    }
    entry.insert(conn);
}

#[allow(clippy::too_many_arguments)]
fn handle_event(
    registry: &Registry,
    conns: &mut Slab<Connection>,
    token: Token,
    readable: bool,
    writable: bool,
    errored: bool,
    ctx: &DispatchContext,
    scratch: &mut [u8],
    conn_count: &AtomicUsize,
) {
    let idx = token.0;
    let keep = match conns.get_mut(idx) {
        // Stale event for an already-closed token.
        None => return,
        Some(conn) => !errored && drive(conn, readable, writable, ctx, scratch),
    };

    if !keep {
        close_connection(registry, conns, idx, conn_count);
        return;
    }

    let conn = &mut conns[idx];
    update_interest(registry, conn, token);
}

/// Run the read/process/write cycle for one connection.
///
/// Returns false when the connection must be closed now.
fn drive(
    conn: &mut Connection,
    mut readable: bool,
    writable: bool,
    ctx: &DispatchContext,
    scratch: &mut [u8],
) -> bool {
    if writable {
        match conn.try_write() {
            Ok(true) => {
                // Drained: backpressure (if any) is released, so parse
                // whatever is still buffered and push the replies out.
                conn.process(ctx);
                if conn.try_write().is_err() {
                    return false;
                }
                // Backpressure may have paused the read loop mid-burst
                // with bytes still queued in the socket. Edge-triggered
                // polls won't re-announce those, so resume reading now.
                readable = true;
            }
            Ok(false) => {}
            Err(e) => {
                trace!(error = %e, "send failed");
                return false;
            }
        }
    }

    if readable {
        loop {
            if !conn.should_read() {
                break;
            }
            match conn.fill(scratch) {
                Ok(0) => {
                    // EOF: stop reading, deliver what we owe, then close.
                    conn.mark_close();
                    break;
                }
                Ok(_) => conn.process(ctx),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    trace!(error = %e, "recv failed");
                    return false;
                }
            }
        }
        if conn.try_write().is_err() {
            return false;
        }
    }

    // Close only after the peer has received everything we produced.
    !(conn.should_close() && !conn.has_pending_write())
}

/// Arm writable interest only while there is something to send; reads
/// stay armed for the connection's whole life.
fn update_interest(registry: &Registry, conn: &mut Connection, token: Token) {
    let want_write = conn.has_pending_write();
    if want_write == conn.writable_registered {
        return;
    }
    let interest = if want_write {
        Interest::READABLE | Interest::WRITABLE
    } else {
        Interest::READABLE
    };
    match registry.reregister(&mut conn.stream, token, interest) {
        Ok(()) => conn.writable_registered = want_write,
        Err(e) => warn!(error = %e, "reregister failed"),
    }
}

fn close_connection(
    registry: &Registry,
    conns: &mut Slab<Connection>,
    idx: usize,
    conn_count: &AtomicUsize,
) {
    let mut conn = conns.remove(idx);
    let _ = registry.deregister(&mut conn.stream);
    conn_count.fetch_sub(1, Ordering::Relaxed);
    CONNECTIONS_ACTIVE.decrement();
    trace!(idle = ?conn.idle_time(), "connection closed");
}
