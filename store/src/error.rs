//! Store error taxonomy.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures in the persistence path.
///
/// These are logged and contained per shard; a failed snapshot never
/// takes the server down.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("snapshot write failed for {path}: {source}")]
    SnapshotWrite { path: PathBuf, source: io::Error },

    #[error("snapshot load failed for {path}: {source}")]
    SnapshotLoad { path: PathBuf, source: io::Error },

    #[error("persist directory {path} could not be created: {source}")]
    CreateDir { path: PathBuf, source: io::Error },
}
