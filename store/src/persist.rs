//! Per-shard snapshot files.
//!
//! Format: a bare record stream, `u32 key_len, u32 val_len, key_bytes,
//! val_bytes` repeated to EOF, native endian. No header, no checksum;
//! the file is only ever read by the build that wrote it. A crash mid
//! write leaves a truncated tail which the loader treats as EOF.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::router::KeyRouter;
use crate::shard::Shard;

pub(crate) fn shard_path(dir: &Path, index: usize) -> PathBuf {
    dir.join(format!("shard_{index}.dat"))
}

/// Rewrite a shard's snapshot file from its current contents.
///
/// Sub-map read locks are taken one at a time, so writers in other
/// sub-maps proceed while the snapshot runs; a row updated mid-pass is
/// captured in either its old or its new state.
pub(crate) fn persist_shard(shard: &Shard, path: &Path) -> io::Result<()> {
    let file = File::create(path)?;
    let mut out = BufWriter::new(file);

    for submap in shard.submaps() {
        let map = submap.read();
        for (key, value) in map.iter() {
            out.write_all(&(key.len() as u32).to_ne_bytes())?;
            out.write_all(&(value.len() as u32).to_ne_bytes())?;
            out.write_all(key)?;
            out.write_all(value)?;
        }
    }

    out.flush()
}

/// Replay a snapshot file into a shard, stopping at the first short
/// read. A missing file is an empty shard, not an error.
pub(crate) fn load_shard(shard: &Shard, router: &KeyRouter, path: &Path) -> io::Result<usize> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    let mut input = BufReader::new(file);

    let mut loaded = 0;
    loop {
        let mut lens = [0u8; 8];
        match read_exact_or_eof(&mut input, &mut lens)? {
            ReadOutcome::Complete => {}
            ReadOutcome::Eof => break,
        }
        let key_len = u32::from_ne_bytes(lens[..4].try_into().unwrap()) as usize;
        let val_len = u32::from_ne_bytes(lens[4..].try_into().unwrap()) as usize;

        let mut key = vec![0u8; key_len];
        if read_exact_or_eof(&mut input, &mut key)? == ReadOutcome::Eof {
            break;
        }
        let mut value = vec![0u8; val_len];
        if read_exact_or_eof(&mut input, &mut value)? == ReadOutcome::Eof {
            break;
        }

        let (bucket, submap) = router.slot(&key);
        shard.submap(bucket, submap).write().insert(key, value);
        loaded += 1;
    }

    Ok(loaded)
}

#[derive(PartialEq, Eq)]
enum ReadOutcome {
    Complete,
    Eof,
}

/// `read_exact`, except a clean or mid-record EOF reports `Eof` instead
/// of failing: a truncated tail ends the stream.
fn read_exact_or_eof(input: &mut impl Read, buf: &mut [u8]) -> io::Result<ReadOutcome> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) => return Ok(ReadOutcome::Eof),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(ReadOutcome::Complete)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(shard: &Shard) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut rows = Vec::new();
        for submap in shard.submaps() {
            for (k, v) in submap.read().iter() {
                rows.push((k.clone(), v.clone()));
            }
        }
        rows.sort();
        rows
    }

    #[test]
    fn snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let router = KeyRouter::new(1, 4, 4);
        let shard = Shard::new(4, 4);

        for i in 0..100u32 {
            let key = format!("key-{i}").into_bytes();
            let (b, m) = router.slot(&key);
            shard
                .submap(b, m)
                .write()
                .insert(key, format!("value-{i}").into_bytes());
        }

        let path = shard_path(dir.path(), 0);
        persist_shard(&shard, &path).unwrap();

        let restored = Shard::new(4, 4);
        let loaded = load_shard(&restored, &router, &path).unwrap();
        assert_eq!(loaded, 100);
        assert_eq!(collect(&shard), collect(&restored));
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let router = KeyRouter::new(1, 2, 2);
        let shard = Shard::new(2, 2);
        let loaded = load_shard(&shard, &router, &shard_path(dir.path(), 3)).unwrap();
        assert_eq!(loaded, 0);
        assert_eq!(shard.len(), 0);
    }

    #[test]
    fn truncated_tail_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let router = KeyRouter::new(1, 2, 2);
        let shard = Shard::new(2, 2);

        for i in 0..10u32 {
            let key = format!("k{i}").into_bytes();
            let (b, m) = router.slot(&key);
            shard.submap(b, m).write().insert(key, vec![b'v'; 32]);
        }

        let path = shard_path(dir.path(), 0);
        persist_shard(&shard, &path).unwrap();

        // Chop off part of the last record, as a crashed write would.
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 7]).unwrap();

        let restored = Shard::new(2, 2);
        let loaded = load_shard(&restored, &router, &path).unwrap();
        assert_eq!(loaded, 9);

        // Every surviving row is intact.
        for (_, v) in collect(&restored) {
            assert_eq!(v, vec![b'v'; 32]);
        }
    }

    #[test]
    fn empty_values_and_binary_keys_survive() {
        let dir = tempfile::tempdir().unwrap();
        let router = KeyRouter::new(1, 2, 2);
        let shard = Shard::new(2, 2);

        let key = vec![0u8, 255, 13, 10, 1];
        let (b, m) = router.slot(&key);
        shard.submap(b, m).write().insert(key.clone(), Vec::new());

        let path = shard_path(dir.path(), 0);
        persist_shard(&shard, &path).unwrap();

        let restored = Shard::new(2, 2);
        load_shard(&restored, &router, &path).unwrap();
        let (rb, rm) = router.slot(&key);
        assert_eq!(
            restored.submap(rb, rm).read().get(&key),
            Some(&Vec::new())
        );
    }
}
