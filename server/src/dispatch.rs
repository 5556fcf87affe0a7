//! Command dispatch - bridges parsed commands to store operations and
//! frames the RESP replies.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use datastore::Store;
use protocol_resp::encode;

use crate::metrics::{
    COMMANDS, CONNECTIONS_ACCEPTED, CONNECTIONS_ACTIVE, CONNECTIONS_REJECTED, DELETES, GETS,
    PROTOCOL_ERRORS, SETS,
};

/// Static server facts surfaced by INFO.
pub struct ServerInfo {
    pub version: &'static str,
    pub started: Instant,
    pub workers: usize,
}

/// Everything a worker needs to execute commands.
#[derive(Clone)]
pub struct DispatchContext {
    pub store: Arc<Store>,
    pub info: Arc<ServerInfo>,
}

/// Execute one command and append its RESP reply to `out`.
///
/// An empty command (from `*0\r\n`) produces no reply. Command errors
/// (unknown name, bad arity, nil argument) reply `-ERR ...` and leave
/// the connection usable.
pub fn execute(args: &[Option<Bytes>], ctx: &DispatchContext, out: &mut Vec<u8>) {
    let Some(first) = args.first() else {
        return;
    };
    COMMANDS.increment();

    let Some(name) = first.as_deref() else {
        encode::put_error(out, "protocol error: nil command name");
        return;
    };

    if name.eq_ignore_ascii_case(b"SET") {
        set(&args[1..], ctx, out);
    } else if name.eq_ignore_ascii_case(b"GET") {
        get(&args[1..], ctx, out);
    } else if name.eq_ignore_ascii_case(b"DEL") {
        del(&args[1..], ctx, out);
    } else if name.eq_ignore_ascii_case(b"MSET") {
        mset(&args[1..], ctx, out);
    } else if name.eq_ignore_ascii_case(b"MGET") {
        mget(&args[1..], ctx, out);
    } else if name.eq_ignore_ascii_case(b"INFO") {
        info(&args[1..], ctx, out);
    } else {
        encode::put_error(
            out,
            &format!("unknown command '{}'", String::from_utf8_lossy(name)),
        );
    }
}

/// Unwrap a required bulk argument, rejecting nils.
fn required(arg: &Option<Bytes>) -> Result<&[u8], ()> {
    arg.as_deref().ok_or(())
}

fn wrong_arity(out: &mut Vec<u8>, cmd: &str) {
    encode::put_error(out, &format!("wrong number of arguments for '{cmd}'"));
}

fn nil_argument(out: &mut Vec<u8>) {
    encode::put_error(out, "protocol error: nil argument");
}

fn set(args: &[Option<Bytes>], ctx: &DispatchContext, out: &mut Vec<u8>) {
    if args.len() != 2 {
        return wrong_arity(out, "set");
    }
    let (Ok(key), Ok(value)) = (required(&args[0]), required(&args[1])) else {
        return nil_argument(out);
    };
    SETS.increment();
    ctx.store.set(key, value);
    encode::put_simple(out, "OK");
}

fn get(args: &[Option<Bytes>], ctx: &DispatchContext, out: &mut Vec<u8>) {
    if args.len() != 1 {
        return wrong_arity(out, "get");
    }
    let Ok(key) = required(&args[0]) else {
        return nil_argument(out);
    };
    GETS.increment();
    match ctx.store.get(key) {
        Some(value) => encode::put_bulk(out, &value),
        None => encode::put_nil(out),
    }
}

fn del(args: &[Option<Bytes>], ctx: &DispatchContext, out: &mut Vec<u8>) {
    if args.len() != 1 {
        return wrong_arity(out, "del");
    }
    let Ok(key) = required(&args[0]) else {
        return nil_argument(out);
    };
    DELETES.increment();
    let removed = ctx.store.del(key);
    encode::put_integer(out, removed as i64);
}

fn mset(args: &[Option<Bytes>], ctx: &DispatchContext, out: &mut Vec<u8>) {
    if args.is_empty() || args.len() % 2 != 0 {
        return wrong_arity(out, "mset");
    }
    let mut pairs = Vec::with_capacity(args.len() / 2);
    for chunk in args.chunks_exact(2) {
        let (Ok(key), Ok(value)) = (required(&chunk[0]), required(&chunk[1])) else {
            return nil_argument(out);
        };
        pairs.push((key, value));
    }
    SETS.add(pairs.len() as u64);
    ctx.store.mset(&pairs);
    encode::put_simple(out, "OK");
}

fn mget(args: &[Option<Bytes>], ctx: &DispatchContext, out: &mut Vec<u8>) {
    if args.is_empty() {
        return wrong_arity(out, "mget");
    }
    let mut keys = Vec::with_capacity(args.len());
    for arg in args {
        let Ok(key) = required(arg) else {
            return nil_argument(out);
        };
        keys.push(key);
    }
    GETS.add(keys.len() as u64);

    let values = ctx.store.mget(&keys);
    encode::put_array_header(out, values.len());
    for value in values {
        match value {
            Some(v) => encode::put_bulk(out, &v),
            None => encode::put_nil(out),
        }
    }
}

fn info(args: &[Option<Bytes>], ctx: &DispatchContext, out: &mut Vec<u8>) {
    if !args.is_empty() {
        return wrong_arity(out, "info");
    }

    let cache = ctx.store.cache_stats();
    let mut body = String::with_capacity(512);

    let _ = write!(
        body,
        "# Server\r\n\
         version:{}\r\n\
         uptime_in_seconds:{}\r\n\
         worker_threads:{}\r\n\
         \r\n\
         # Clients\r\n\
         connected_clients:{}\r\n\
         total_connections_received:{}\r\n\
         rejected_connections:{}\r\n\
         \r\n\
         # Stats\r\n\
         total_commands_processed:{}\r\n\
         gets:{}\r\n\
         sets:{}\r\n\
         deletes:{}\r\n\
         protocol_errors:{}\r\n\
         \r\n\
         # Cache\r\n\
         cache_policy:{}\r\n\
         cache_entries:{}\r\n\
         cache_capacity:{}\r\n\
         cache_hits:{}\r\n\
         cache_misses:{}\r\n\
         cache_hit_ratio:{:.4}\r\n\
         cache_evictions:{}\r\n\
         cache_expirations:{}\r\n\
         \r\n\
         # Keyspace\r\n\
         keys:{}\r\n",
        ctx.info.version,
        ctx.info.started.elapsed().as_secs(),
        ctx.info.workers,
        CONNECTIONS_ACTIVE.value(),
        CONNECTIONS_ACCEPTED.value(),
        CONNECTIONS_REJECTED.value(),
        COMMANDS.value(),
        GETS.value(),
        SETS.value(),
        DELETES.value(),
        PROTOCOL_ERRORS.value(),
        cache.policy_name,
        cache.size,
        cache.capacity,
        cache.hits,
        cache.misses,
        cache.hit_ratio,
        cache.evictions,
        cache.expirations,
        ctx.store.len(),
    );

    encode::put_bulk(out, body.as_bytes());
}
