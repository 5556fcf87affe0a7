//! Fixed-block memory pools backing cache entries.
//!
//! Two layers:
//!
//! * [`BlockPool`] hands out raw fixed-size blocks carved from larger
//!   chunks. Free blocks form a singly-linked list threaded through the
//!   first machine word of each block, so allocate and deallocate are a
//!   pointer pop/push.
//! * [`TypedPool`] wraps a `BlockPool` for one concrete entry type,
//!   constructing values in place on allocate and dropping them in place
//!   on deallocate.
//!
//! Pools are single-owner: neither type is `Sync`, and each cache shard
//! owns its own pool so the shard lock is the only serialization needed.
//! Chunk memory is released only when the pool is dropped.

#![warn(clippy::all)]

mod block;
mod typed;

pub use block::BlockPool;
pub use typed::TypedPool;
