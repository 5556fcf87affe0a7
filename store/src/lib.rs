//! The authoritative key/value store.
//!
//! Keys route through three independently seeded hashes to a
//! (shard, bucket, sub-map) triple; the sub-map is the smallest lock
//! granularity. An [`adaptive_cache::AdaptiveCache`] fronts the store:
//! reads consult it first and populate it on miss, writes refresh it.
//!
//! Values are optionally zlib-compressed at rest. Each shard snapshots
//! to its own `shard_<i>.dat` file, rewritten in full by `flush()` and
//! replayed at startup; a crashed write leaves a truncated tail that
//! the loader stops at.

#![warn(clippy::all)]

mod compress;
mod error;
mod persist;
mod router;
mod shard;
mod store;

pub use error::StoreError;
pub use store::{PersistOptions, Store, StoreOptions};
