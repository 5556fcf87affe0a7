//! Incremental RESP decoding.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::ParseError;
use crate::value::Value;
use crate::{MAX_ARRAY_LEN, MAX_BULK_LEN};

/// Arguments of one decoded command.
///
/// A command on the wire is an array of bulk strings. A null bulk
/// (`$-1\r\n`) element decodes to `None`, which keeps it distinguishable
/// from the empty string.
pub type CommandArgs = Vec<Option<Bytes>>;

/// Consumed-prefix compaction kicks in once the cursor has passed this
/// many bytes and at least half the buffer.
const COMPACT_MIN: usize = 4096;

/// Incremental, resumable RESP parser.
///
/// Bytes go in through [`feed`](Self::feed); complete commands come out
/// of [`next_command`](Self::next_command). Unconsumed bytes stay
/// buffered, and the cursor only ever advances past fully decoded
/// values, so the stream may be split at any byte boundary between
/// calls without changing the decoded command sequence.
///
/// A [`ParseError`] abandons the partial structure and leaves the
/// parser in an unspecified position; the caller is expected to close
/// the connection.
pub struct Parser {
    buf: BytesMut,
    pos: usize,
}

impl Parser {
    const INITIAL_CAPACITY: usize = 4096;

    pub fn new() -> Self {
        Self::with_capacity(Self::INITIAL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            pos: 0,
        }
    }

    /// Append raw bytes from the transport.
    pub fn feed(&mut self, data: &[u8]) {
        self.reserve(data.len());
        self.buf.extend_from_slice(data);
    }

    /// Bytes buffered but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Decode the next complete command, if one is fully buffered.
    ///
    /// Returns `Ok(None)` when more bytes are needed. An empty array
    /// (`*0\r\n`) or null array decodes to an empty argument vector.
    pub fn next_command(&mut self) -> Result<Option<CommandArgs>, ParseError> {
        self.skip_junk();

        let Some((value, consumed)) = parse_value(&self.buf[self.pos..])? else {
            self.compact();
            return Ok(None);
        };
        self.pos += consumed;
        self.compact();

        match value {
            Value::Array(items) => decode_command(items).map(Some),
            Value::NullArray => Ok(Some(Vec::new())),
            _ => Err(ParseError::ExpectedArray),
        }
    }

    /// Skip bytes that cannot start a RESP value. Recovers from junk
    /// between commands; inside a structure a bad type byte is still a
    /// framing violation.
    fn skip_junk(&mut self) {
        while let Some(&b) = self.buf.get(self.pos) {
            if matches!(b, b'+' | b'-' | b':' | b'$' | b'*') {
                break;
            }
            self.pos += 1;
        }
    }

    /// Drop the consumed prefix once it dominates the buffer.
    fn compact(&mut self) {
        if self.pos == self.buf.len() {
            self.buf.clear();
            self.pos = 0;
        } else if self.pos >= COMPACT_MIN && self.pos * 2 >= self.buf.len() {
            self.buf.advance(self.pos);
            self.pos = 0;
        }
    }

    /// Grow in 1.5x steps rather than whatever the allocator fancies.
    fn reserve(&mut self, additional: usize) {
        let needed = self.buf.len() + additional;
        let cap = self.buf.capacity();
        if needed <= cap {
            return;
        }
        let mut target = cap.max(Self::INITIAL_CAPACITY);
        while target < needed {
            target += target / 2;
        }
        self.buf.reserve(target - self.buf.len());
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode one RESP value from the front of `buf`.
///
/// Returns `Ok(None)` when the value is not yet complete, otherwise the
/// value and the number of bytes it occupied.
pub fn parse_value(buf: &[u8]) -> Result<Option<(Value, usize)>, ParseError> {
    let Some(&type_byte) = buf.first() else {
        return Ok(None);
    };

    match type_byte {
        b'+' => Ok(read_line(buf)?
            .map(|(line, n)| (Value::Simple(Bytes::copy_from_slice(line)), n))),
        b'-' => {
            Ok(read_line(buf)?.map(|(line, n)| (Value::Error(Bytes::copy_from_slice(line)), n)))
        }
        b':' => match read_line(buf)? {
            Some((line, n)) => Ok(Some((Value::Integer(parse_i64(line)?), n))),
            None => Ok(None),
        },
        b'$' => parse_bulk(buf),
        b'*' => parse_array(buf),
        other => Err(ParseError::UnknownType(other)),
    }
}

fn parse_bulk(buf: &[u8]) -> Result<Option<(Value, usize)>, ParseError> {
    let Some((line, header)) = read_line(buf)? else {
        return Ok(None);
    };
    let len = parse_i64(line)?;
    if len == -1 {
        return Ok(Some((Value::NullBulk, header)));
    }
    if len < 0 {
        return Err(ParseError::InvalidBulkLength(len));
    }
    let len = len as usize;
    if len > MAX_BULK_LEN {
        return Err(ParseError::BulkTooLong {
            len,
            max: MAX_BULK_LEN,
        });
    }

    let total = header + len + 2;
    if buf.len() < total {
        return Ok(None);
    }
    if &buf[header + len..total] != b"\r\n" {
        return Err(ParseError::MissingCrlf);
    }
    Ok(Some((
        Value::Bulk(Bytes::copy_from_slice(&buf[header..header + len])),
        total,
    )))
}

fn parse_array(buf: &[u8]) -> Result<Option<(Value, usize)>, ParseError> {
    let Some((line, header)) = read_line(buf)? else {
        return Ok(None);
    };
    let count = parse_i64(line)?;
    if count == -1 {
        return Ok(Some((Value::NullArray, header)));
    }
    if count < 0 {
        return Err(ParseError::InvalidArrayLength(count));
    }
    let count = count as usize;
    if count > MAX_ARRAY_LEN {
        return Err(ParseError::ArrayTooLarge {
            len: count,
            max: MAX_ARRAY_LEN,
        });
    }

    let mut elems = Vec::with_capacity(count.min(64));
    let mut consumed = header;
    for _ in 0..count {
        match parse_value(&buf[consumed..])? {
            Some((value, n)) => {
                elems.push(value);
                consumed += n;
            }
            None => return Ok(None),
        }
    }
    Ok(Some((Value::Array(elems), consumed)))
}

/// Find the CRLF-terminated line after the type byte.
///
/// Returns the line content and the bytes consumed including the type
/// byte and terminator, or `None` while the terminator has not arrived.
fn read_line(buf: &[u8]) -> Result<Option<(&[u8], usize)>, ParseError> {
    let mut search = 1;
    while let Some(i) = memchr::memchr(b'\r', &buf[search..]) {
        let r = search + i;
        if r + 1 >= buf.len() {
            return Ok(None);
        }
        if buf[r + 1] == b'\n' {
            return Ok(Some((&buf[1..r], r + 2)));
        }
        search = r + 1;
    }
    Ok(None)
}

fn parse_i64(line: &[u8]) -> Result<i64, ParseError> {
    // 19 digits covers i64; anything longer is garbage or an overflow.
    if line.is_empty() || line.len() > 20 {
        return Err(ParseError::InvalidInteger);
    }
    let (negative, digits) = match line[0] {
        b'-' => (true, &line[1..]),
        _ => (false, line),
    };
    if digits.is_empty() {
        return Err(ParseError::InvalidInteger);
    }

    let mut value: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(ParseError::InvalidInteger);
        }
        value = value
            .checked_mul(10)
            .and_then(|v| v.checked_add((b - b'0') as i64))
            .ok_or(ParseError::InvalidInteger)?;
    }
    Ok(if negative { -value } else { value })
}

fn decode_command(items: Vec<Value>) -> Result<CommandArgs, ParseError> {
    items
        .into_iter()
        .map(|v| match v {
            Value::Bulk(data) => Ok(Some(data)),
            Value::NullBulk => Ok(None),
            _ => Err(ParseError::NotBulkString),
        })
        .collect()
}
