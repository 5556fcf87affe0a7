//! Server assembly and lifecycle.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use adaptive_cache::AdaptiveCache;
use datastore::Store;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::info;

use crate::acceptor::{WorkerRoute, spawn_acceptors};
use crate::config::Config;
use crate::dispatch::{DispatchContext, ServerInfo};
use crate::worker::{WorkerHandle, spawn_workers};

/// Bind the listening socket with SO_REUSEADDR, non-blocking.
fn bind_listener(addr_str: &str) -> Result<std::net::TcpListener, Box<dyn std::error::Error>> {
    let addr: SocketAddr = addr_str
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| format!("could not resolve listen address '{addr_str}'"))?;

    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    Ok(socket.into())
}

/// Run the server until `shutdown` flips.
///
/// Brings up store, cache, workers and acceptors; on shutdown it stops
/// accepting, lets the workers drain (they notice the flag within one
/// poll timeout), flushes the store and returns.
pub fn run(config: &Config, shutdown: Arc<AtomicBool>) -> Result<(), Box<dyn std::error::Error>> {
    let cache = AdaptiveCache::new(config.cache_options());
    let store = Arc::new(Store::new(config.store_options(), cache)?);

    let workers_count = config.worker_threads();
    let info = Arc::new(ServerInfo {
        version: env!("CARGO_PKG_VERSION"),
        started: Instant::now(),
        workers: workers_count,
    });
    let ctx = DispatchContext {
        store: store.clone(),
        info,
    };

    let workers = spawn_workers(
        workers_count,
        config.threading.pin_workers,
        config.server.buffer_size,
        &ctx,
        &shutdown,
    )?;

    let listener = bind_listener(&config.listen_addr())?;
    let local_addr = listener.local_addr()?;
    info!(
        addr = %local_addr,
        workers = workers.len(),
        acceptors = config.threading.io_threads,
        shards = config.threading.shard_count,
        policy = config.cache.policy_name(),
        "listening"
    );

    let routes: Vec<WorkerRoute> = workers.iter().map(WorkerHandle::route).collect();
    let acceptors = spawn_acceptors(
        listener,
        config.threading.io_threads,
        routes,
        config.server.max_connections,
        config.server.accept_batch,
        shutdown.clone(),
    )?;

    while !shutdown.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(50));
    }

    info!("shutting down: draining workers");
    for acceptor in acceptors {
        let _ = acceptor.join();
    }
    for worker in workers {
        let _ = worker.waker.wake();
        let _ = worker.thread.join();
    }

    store.flush();
    info!("shutdown complete");
    Ok(())
}
