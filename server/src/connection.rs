//! Per-connection state.
//!
//! A connection owns its socket, a parser (which holds the read
//! accumulation buffer), and a write buffer drained by the owning
//! worker. Nothing here is shared: exactly one worker ever touches a
//! connection.

use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use protocol_resp::{Parser, encode};

use crate::dispatch::{self, DispatchContext};
use crate::metrics::PROTOCOL_ERRORS;

/// Pending-write ceiling: past this the worker stops parsing and
/// reading for the connection until the socket drains.
pub const MAX_PENDING_WRITE: usize = 256 * 1024;

/// Once the consumed prefix of the write buffer passes this many bytes
/// and half the buffer, it is compacted left.
const WRITE_COMPACT_MIN: usize = 4096;

pub struct Connection {
    pub stream: TcpStream,
    parser: Parser,
    write_buf: Vec<u8>,
    write_pos: usize,
    last_active: Instant,
    should_close: bool,
    /// Whether the fd is currently registered for writable interest.
    pub writable_registered: bool,
    initial_buffer: usize,
}

impl Connection {
    pub fn new(stream: TcpStream, initial_buffer: usize) -> Self {
        Self {
            stream,
            parser: Parser::with_capacity(initial_buffer),
            write_buf: Vec::with_capacity(initial_buffer),
            write_pos: 0,
            last_active: Instant::now(),
            should_close: false,
            writable_registered: false,
            initial_buffer,
        }
    }

    /// Read once from the socket into the parser.
    ///
    /// Returns the byte count (0 = EOF) or the raw socket error;
    /// `WouldBlock`/`Interrupted` are the caller's to handle.
    pub fn fill(&mut self, scratch: &mut [u8]) -> io::Result<usize> {
        let n = (&self.stream).read(scratch)?;
        if n > 0 {
            self.last_active = Instant::now();
            self.parser.feed(&scratch[..n]);
        }
        Ok(n)
    }

    /// Execute every fully buffered command, framing replies into the
    /// write buffer. Stops early under write backpressure. A protocol
    /// error queues `-ERR protocol error` and marks the connection for
    /// close.
    pub fn process(&mut self, ctx: &DispatchContext) {
        while !self.should_close {
            if self.pending_write_len() > MAX_PENDING_WRITE {
                break;
            }
            match self.parser.next_command() {
                Ok(Some(command)) => {
                    dispatch::execute(&command, ctx, &mut self.write_buf);
                }
                Ok(None) => break,
                Err(e) => {
                    PROTOCOL_ERRORS.increment();
                    tracing::debug!(error = %e, "protocol error, closing connection");
                    encode::put_error(&mut self.write_buf, "protocol error");
                    self.should_close = true;
                }
            }
        }
    }

    /// Push pending bytes to the socket until drained or the socket
    /// stops accepting. `Ok(true)` means fully drained.
    pub fn try_write(&mut self) -> io::Result<bool> {
        loop {
            if !self.has_pending_write() {
                return Ok(true);
            }
            let n = {
                let data = &self.write_buf[self.write_pos..];
                match (&self.stream).write(data) {
                    Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            };
            self.advance_write(n);
        }
    }

    fn advance_write(&mut self, n: usize) {
        self.write_pos += n;
        debug_assert!(self.write_pos <= self.write_buf.len());

        if self.write_pos == self.write_buf.len() {
            self.write_buf.clear();
            self.write_pos = 0;
            // Shrink back toward the initial size when a burst is over
            // and utilization has collapsed.
            if self.write_buf.capacity() > self.initial_buffer * 4 {
                self.write_buf.shrink_to(self.initial_buffer);
            }
        } else if self.write_pos >= WRITE_COMPACT_MIN
            && self.write_pos * 2 >= self.write_buf.len()
        {
            self.write_buf.drain(..self.write_pos);
            self.write_pos = 0;
        }
    }

    #[inline]
    pub fn has_pending_write(&self) -> bool {
        self.write_pos < self.write_buf.len()
    }

    #[inline]
    pub fn pending_write_len(&self) -> usize {
        self.write_buf.len() - self.write_pos
    }

    /// Whether the worker should keep pulling bytes off the socket.
    #[inline]
    pub fn should_read(&self) -> bool {
        !self.should_close && self.pending_write_len() <= MAX_PENDING_WRITE
    }

    /// Flag the connection for close once pending writes drain.
    pub fn mark_close(&mut self) {
        self.should_close = true;
    }

    #[inline]
    pub fn should_close(&self) -> bool {
        self.should_close
    }

    pub fn idle_time(&self) -> Duration {
        self.last_active.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{DispatchContext, ServerInfo};
    use adaptive_cache::{AdaptiveCache, CacheOptions};
    use datastore::{Store, StoreOptions};
    use std::sync::Arc;

    fn test_ctx() -> DispatchContext {
        let cache = AdaptiveCache::new(CacheOptions {
            shard_count: 2,
            initial_capacity: 1024,
            min_capacity: 1,
            adaptive_sizing: false,
            ..CacheOptions::default()
        });
        DispatchContext {
            store: Arc::new(Store::new(StoreOptions::default(), cache).unwrap()),
            info: Arc::new(ServerInfo {
                version: "test",
                started: Instant::now(),
                workers: 1,
            }),
        }
    }

    /// A connection wrapped around a real loopback socket pair.
    fn test_conn() -> (Connection, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let peer = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server_side, _) = listener.accept().unwrap();
        server_side.set_nonblocking(true).unwrap();
        (
            Connection::new(TcpStream::from_std(server_side), 1024),
            peer,
        )
    }

    fn feed(conn: &mut Connection, data: &[u8]) {
        conn.parser.feed(data);
    }

    fn pending(conn: &Connection) -> &[u8] {
        &conn.write_buf[conn.write_pos..]
    }

    #[test]
    fn partial_command_produces_no_reply() {
        let ctx = test_ctx();
        let (mut conn, _peer) = test_conn();

        feed(&mut conn, b"*2\r\n$3\r\nGET\r\n$3\r\nke");
        conn.process(&ctx);
        assert!(!conn.has_pending_write());

        feed(&mut conn, b"y\r\n");
        conn.process(&ctx);
        assert_eq!(pending(&conn), b"$-1\r\n");
    }

    #[test]
    fn pipelined_commands_reply_in_order() {
        let ctx = test_ctx();
        let (mut conn, _peer) = test_conn();

        feed(
            &mut conn,
            b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n",
        );
        conn.process(&ctx);
        assert_eq!(pending(&conn), b"+OK\r\n$3\r\nbar\r\n");
    }

    #[test]
    fn protocol_error_flags_close_after_replies() {
        let ctx = test_ctx();
        let (mut conn, _peer) = test_conn();

        feed(
            &mut conn,
            b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n*2\r\n$3\r\nGET\r\n$-2\r\n",
        );
        conn.process(&ctx);

        assert!(conn.should_close());
        // The SET reply precedes the protocol error notice.
        assert_eq!(pending(&conn), b"+OK\r\n-ERR protocol error\r\n");
    }

    #[test]
    fn write_drains_to_the_socket() {
        use std::io::Read as _;

        let ctx = test_ctx();
        let (mut conn, mut peer) = test_conn();

        feed(&mut conn, b"*1\r\n$4\r\nINFO\r\n");
        conn.process(&ctx);
        assert!(conn.has_pending_write());

        while !conn.try_write().unwrap() {}
        assert!(!conn.has_pending_write());

        peer.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        let mut reply = vec![0u8; 65536];
        let n = peer.read(&mut reply).unwrap();
        assert!(reply[..n].starts_with(b"$"));
    }

    #[test]
    fn backpressure_pauses_processing() {
        let ctx = test_ctx();
        let (mut conn, _peer) = test_conn();

        // A value big enough that a handful of GET replies exceed the
        // pending-write ceiling.
        let value = vec![b'v'; 64 * 1024];
        ctx.store.set(b"big", &value);

        let get = b"*2\r\n$3\r\nGET\r\n$3\r\nbig\r\n";
        for _ in 0..100 {
            feed(&mut conn, get);
        }
        conn.process(&ctx);

        assert!(conn.pending_write_len() <= MAX_PENDING_WRITE + value.len() + 32);
        assert!(!conn.should_read(), "should be in backpressure");
    }
}
