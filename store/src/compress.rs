//! zlib value compression.

use std::io::{self, Write};

use flate2::Compression;
use flate2::write::{ZlibDecoder, ZlibEncoder};

/// Compress a value for storage.
///
/// Encoding into a `Vec` sink cannot fail.
pub(crate) fn compress(data: &[u8]) -> Vec<u8> {
    let sink = Vec::with_capacity(data.len() / 2 + 64);
    let mut encoder = ZlibEncoder::new(sink, Compression::best());
    encoder.write_all(data).expect("write to Vec");
    encoder.finish().expect("write to Vec")
}

/// Decompress a stored value. Fails on corrupt input.
pub(crate) fn decompress(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(Vec::with_capacity(data.len() * 2));
    decoder.write_all(data)?;
    decoder.finish()
}
