//! End-to-end RESP tests against a real server on a loopback socket.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use server::Config;

/// Grab a free port by binding to 0 and letting the OS choose.
fn get_available_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn wait_for_server(addr: SocketAddr, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect_timeout(&addr, Duration::from_millis(50)).is_ok() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    false
}

fn test_config(port: u16) -> Config {
    let mut config = Config::default();
    config.server.port = port;
    config.server.host = "127.0.0.1".to_string();
    config.threading.worker_threads = 2;
    config.threading.shard_count = 4;
    config.storage.enable_persistence = false;
    config.cache.adaptive_sizing = false;
    config
}

fn start_server(config: Config) -> (thread::JoinHandle<()>, Arc<AtomicBool>, SocketAddr) {
    let addr: SocketAddr = format!("127.0.0.1:{}", config.server.port).parse().unwrap();
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();

    let handle = thread::spawn(move || {
        server::run(&config, flag).expect("server failed");
    });

    assert!(
        wait_for_server(addr, Duration::from_secs(5)),
        "server did not come up"
    );
    (handle, shutdown, addr)
}

fn stop_server(handle: thread::JoinHandle<()>, shutdown: Arc<AtomicBool>) {
    shutdown.store(true, Ordering::SeqCst);
    let _ = handle.join();
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).expect("connect failed");
    stream.set_nodelay(true).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

/// Read exactly `n` bytes.
fn read_len(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    stream.read_exact(&mut buf).expect("short read");
    buf
}

fn set_cmd(key: &str, value: &str) -> Vec<u8> {
    format!(
        "*3\r\n$3\r\nSET\r\n${}\r\n{}\r\n${}\r\n{}\r\n",
        key.len(),
        key,
        value.len(),
        value
    )
    .into_bytes()
}

fn get_cmd(key: &str) -> Vec<u8> {
    format!("*2\r\n$3\r\nGET\r\n${}\r\n{}\r\n", key.len(), key).into_bytes()
}

fn del_cmd(key: &str) -> Vec<u8> {
    format!("*2\r\n$3\r\nDEL\r\n${}\r\n{}\r\n", key.len(), key).into_bytes()
}

#[test]
fn hello_round_trip() {
    let (handle, shutdown, addr) = start_server(test_config(get_available_port()));
    let mut conn = connect(addr);

    // Pipelined SET + GET in one write.
    conn.write_all(b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n")
        .unwrap();
    let reply = read_len(&mut conn, b"+OK\r\n$3\r\nbar\r\n".len());
    assert_eq!(reply, b"+OK\r\n$3\r\nbar\r\n");

    drop(conn);
    stop_server(handle, shutdown);
}

#[test]
fn pipeline_of_1000_sets_then_mget() {
    let (handle, shutdown, addr) = start_server(test_config(get_available_port()));
    let mut conn = connect(addr);

    let mut request = Vec::new();
    let mut mget = b"*1001\r\n$4\r\nMGET\r\n".to_vec();
    for i in 0..1000 {
        let key = format!("k{i}");
        request.extend_from_slice(&set_cmd(&key, "v"));
        mget.extend_from_slice(format!("${}\r\n{}\r\n", key.len(), key).as_bytes());
    }
    request.extend_from_slice(&mget);
    conn.write_all(&request).unwrap();

    let mut expected = Vec::new();
    for _ in 0..1000 {
        expected.extend_from_slice(b"+OK\r\n");
    }
    expected.extend_from_slice(b"*1000\r\n");
    for _ in 0..1000 {
        expected.extend_from_slice(b"$1\r\nv\r\n");
    }

    let reply = read_len(&mut conn, expected.len());
    assert_eq!(reply, expected);

    drop(conn);
    stop_server(handle, shutdown);
}

#[test]
fn del_semantics() {
    let (handle, shutdown, addr) = start_server(test_config(get_available_port()));
    let mut conn = connect(addr);

    conn.write_all(&del_cmd("missing")).unwrap();
    assert_eq!(read_len(&mut conn, 4), b":0\r\n");

    let mut request = Vec::new();
    request.extend_from_slice(&set_cmd("x", "1"));
    request.extend_from_slice(&del_cmd("x"));
    request.extend_from_slice(&del_cmd("x"));
    conn.write_all(&request).unwrap();
    assert_eq!(read_len(&mut conn, 13), b"+OK\r\n:1\r\n:0\r\n");

    drop(conn);
    stop_server(handle, shutdown);
}

#[test]
fn protocol_violation_closes_after_delivering_prior_replies() {
    let (handle, shutdown, addr) = start_server(test_config(get_available_port()));
    let mut conn = connect(addr);

    let mut request = Vec::new();
    request.extend_from_slice(&set_cmd("k", "v"));
    request.extend_from_slice(b"*2\r\n$3\r\nGET\r\n$-2\r\n");
    conn.write_all(&request).unwrap();

    let expected: &[u8] = b"+OK\r\n-ERR protocol error\r\n";
    assert_eq!(read_len(&mut conn, expected.len()), expected);

    // The server hangs up after the error.
    let mut rest = [0u8; 16];
    match conn.read(&mut rest) {
        Ok(0) => {}
        other => panic!("expected EOF, got {other:?}"),
    }

    stop_server(handle, shutdown);
}

#[test]
fn command_errors_keep_the_connection_open() {
    let (handle, shutdown, addr) = start_server(test_config(get_available_port()));
    let mut conn = connect(addr);

    conn.write_all(b"*1\r\n$3\r\nGET\r\n").unwrap();
    let expected: &[u8] = b"-ERR wrong number of arguments for 'get'\r\n";
    assert_eq!(read_len(&mut conn, expected.len()), expected);

    conn.write_all(b"*2\r\n$4\r\nBLAH\r\n$1\r\nx\r\n").unwrap();
    let expected: &[u8] = b"-ERR unknown command 'BLAH'\r\n";
    assert_eq!(read_len(&mut conn, expected.len()), expected);

    // Still serving afterwards.
    conn.write_all(&set_cmd("still", "alive")).unwrap();
    assert_eq!(read_len(&mut conn, 5), b"+OK\r\n");

    drop(conn);
    stop_server(handle, shutdown);
}

#[test]
fn empty_array_is_ignored() {
    let (handle, shutdown, addr) = start_server(test_config(get_available_port()));
    let mut conn = connect(addr);

    let mut request = b"*0\r\n".to_vec();
    request.extend_from_slice(&get_cmd("nothing"));
    conn.write_all(&request).unwrap();

    // Only the GET reply arrives.
    assert_eq!(read_len(&mut conn, 5), b"$-1\r\n");

    drop(conn);
    stop_server(handle, shutdown);
}

#[test]
fn nil_command_argument_is_a_soft_error() {
    let (handle, shutdown, addr) = start_server(test_config(get_available_port()));
    let mut conn = connect(addr);

    conn.write_all(b"*2\r\n$3\r\nGET\r\n$-1\r\n").unwrap();
    let expected: &[u8] = b"-ERR protocol error: nil argument\r\n";
    assert_eq!(read_len(&mut conn, expected.len()), expected);

    conn.write_all(&set_cmd("ok", "1")).unwrap();
    assert_eq!(read_len(&mut conn, 5), b"+OK\r\n");

    drop(conn);
    stop_server(handle, shutdown);
}

#[test]
fn info_reports_sections() {
    let (handle, shutdown, addr) = start_server(test_config(get_available_port()));
    let mut conn = connect(addr);

    conn.write_all(&set_cmd("k", "v")).unwrap();
    assert_eq!(read_len(&mut conn, 5), b"+OK\r\n");

    conn.write_all(b"*1\r\n$4\r\nINFO\r\n").unwrap();

    // Parse the bulk header to learn the body length.
    let mut header = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        conn.read_exact(&mut byte).unwrap();
        header.push(byte[0]);
        if header.ends_with(b"\r\n") {
            break;
        }
    }
    assert_eq!(header[0], b'$');
    let len: usize = std::str::from_utf8(&header[1..header.len() - 2])
        .unwrap()
        .parse()
        .unwrap();

    let body = read_len(&mut conn, len + 2);
    let text = String::from_utf8_lossy(&body);
    assert!(text.contains("# Server"));
    assert!(text.contains("# Cache"));
    assert!(text.contains("keys:1"));

    drop(conn);
    stop_server(handle, shutdown);
}

#[test]
fn values_survive_a_restart_when_persistence_is_on() {
    let dir = tempfile::tempdir().unwrap();
    let port = get_available_port();

    let mut config = test_config(port);
    config.storage.enable_persistence = true;
    config.storage.persist_path = dir.path().to_path_buf();
    config.storage.sync_interval_sec = 3600; // only the shutdown flush matters

    {
        let (handle, shutdown, addr) = start_server(config.clone());
        let mut conn = connect(addr);
        conn.write_all(&set_cmd("k", "v")).unwrap();
        assert_eq!(read_len(&mut conn, 5), b"+OK\r\n");
        drop(conn);
        stop_server(handle, shutdown);
    }

    let (handle, shutdown, addr) = start_server(config);
    let mut conn = connect(addr);
    conn.write_all(&get_cmd("k")).unwrap();
    assert_eq!(read_len(&mut conn, 8), b"$1\r\nv\r\n");

    drop(conn);
    stop_server(handle, shutdown);
}

#[test]
fn concurrent_clients() {
    let (handle, shutdown, addr) = start_server(test_config(get_available_port()));

    let mut clients = Vec::new();
    for t in 0..4 {
        clients.push(thread::spawn(move || {
            let mut conn = connect(addr);
            for i in 0..100 {
                let key = format!("c{t}-{i}");
                conn.write_all(&set_cmd(&key, "v")).unwrap();
                assert_eq!(read_len(&mut conn, 5), b"+OK\r\n");

                conn.write_all(&get_cmd(&key)).unwrap();
                assert_eq!(read_len(&mut conn, 8), b"$1\r\nv\r\n");
            }
        }));
    }
    for client in clients {
        client.join().unwrap();
    }

    stop_server(handle, shutdown);
}
