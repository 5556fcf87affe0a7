//! Shutdown behavior.

use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use server::Config;

fn get_available_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn test_config(port: u16) -> Config {
    let mut config = Config::default();
    config.server.port = port;
    config.threading.worker_threads = 2;
    config.storage.enable_persistence = false;
    config.cache.adaptive_sizing = false;
    config
}

/// A server with zero connections still observes the stop flag within
/// its poll timeout.
#[test]
fn idle_server_stops_promptly() {
    let port = get_available_port();
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    let config = test_config(port);

    let handle = thread::spawn(move || {
        server::run(&config, flag).expect("server failed");
    });

    // Wait until it is actually listening.
    let addr = format!("127.0.0.1:{port}").parse().unwrap();
    let start = Instant::now();
    while TcpStream::connect_timeout(&addr, Duration::from_millis(50)).is_err() {
        assert!(start.elapsed() < Duration::from_secs(5), "server never started");
        thread::sleep(Duration::from_millis(20));
    }

    shutdown.store(true, Ordering::SeqCst);

    let deadline = Instant::now() + Duration::from_secs(3);
    while !handle.is_finished() {
        assert!(Instant::now() < deadline, "server did not stop in time");
        thread::sleep(Duration::from_millis(20));
    }
    handle.join().unwrap();
}

/// Shutdown with connected-but-idle clients drops them and returns.
#[test]
fn shutdown_drops_idle_connections() {
    let port = get_available_port();
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    let config = test_config(port);

    let handle = thread::spawn(move || {
        server::run(&config, flag).expect("server failed");
    });

    let addr = format!("127.0.0.1:{port}").parse().unwrap();
    let start = Instant::now();
    let held_open;
    loop {
        if let Ok(conn) = TcpStream::connect_timeout(&addr, Duration::from_millis(50)) {
            // Hold the connection open without sending anything.
            held_open = conn;
            break;
        }
        assert!(start.elapsed() < Duration::from_secs(5), "server never started");
        thread::sleep(Duration::from_millis(20));
    }

    thread::sleep(Duration::from_millis(200));
    shutdown.store(true, Ordering::SeqCst);

    let deadline = Instant::now() + Duration::from_secs(3);
    while !handle.is_finished() {
        assert!(Instant::now() < deadline, "server did not stop in time");
        thread::sleep(Duration::from_millis(20));
    }
    handle.join().unwrap();
    drop(held_open);
}
