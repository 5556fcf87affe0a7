//! Decoded RESP values.

use bytes::Bytes;

/// A single RESP value.
///
/// Simple strings and errors are kept as raw bytes; RESP does not
/// require them to be UTF-8 and neither do we.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// `+STR\r\n`
    Simple(Bytes),
    /// `-ERR ...\r\n`
    Error(Bytes),
    /// `:N\r\n`
    Integer(i64),
    /// `$len\r\nBYTES\r\n`
    Bulk(Bytes),
    /// `$-1\r\n` — distinct from the empty bulk string.
    NullBulk,
    /// `*N\r\n<elem>...`
    Array(Vec<Value>),
    /// `*-1\r\n`
    NullArray,
}

impl Value {
    /// Convenience constructor for a bulk string value.
    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Value::Bulk(data.into())
    }
}
