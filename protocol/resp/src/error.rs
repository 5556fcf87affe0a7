//! Parse error taxonomy.

use thiserror::Error;

/// A framing violation in the RESP byte stream.
///
/// Any of these poisons the stream: the partial structure is abandoned
/// and the caller is expected to close the connection. Incomplete input
/// is not an error; the parser simply reports that no command is
/// available yet.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// A length or integer field contained a non-digit byte.
    #[error("invalid integer")]
    InvalidInteger,

    /// A bulk string declared a negative length other than -1.
    #[error("invalid bulk string length: {0}")]
    InvalidBulkLength(i64),

    /// An array declared a negative length other than -1.
    #[error("invalid array length: {0}")]
    InvalidArrayLength(i64),

    /// A bulk string exceeded the configured maximum.
    #[error("bulk string too long: {len} bytes (max {max})")]
    BulkTooLong { len: usize, max: usize },

    /// An array declared more elements than allowed.
    #[error("array too large: {len} elements (max {max})")]
    ArrayTooLarge { len: usize, max: usize },

    /// The terminator after a fully received payload was not CRLF.
    #[error("missing CRLF terminator")]
    MissingCrlf,

    /// A nested value started with a byte that is not a RESP type byte.
    #[error("unknown type byte: {0:#04x}")]
    UnknownType(u8),

    /// A top-level value that is not an array where a command was
    /// expected.
    #[error("expected array")]
    ExpectedArray,

    /// A command array element that is not a bulk string.
    #[error("command element is not a bulk string")]
    NotBulkString,
}
