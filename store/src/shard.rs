//! Shard → bucket → sub-map layout.

use std::collections::HashMap;

use ahash::RandomState;
use parking_lot::RwLock;

// The sub-map's own hasher; unrelated to the routing seeds.
const SUBMAP_HASHER_SEEDS: (u64, u64, u64, u64) = (
    0x72be_5d74_f27b_896f,
    0x80de_b1fe_3b16_96b1,
    0x9bdc_06a7_25c7_1235,
    0xc19b_f174_cf69_2694,
);

/// The innermost hash table and the smallest locking unit.
pub(crate) type SubMap = RwLock<HashMap<Vec<u8>, Vec<u8>, RandomState>>;

fn new_submap() -> SubMap {
    RwLock::new(HashMap::with_hasher(RandomState::with_seeds(
        SUBMAP_HASHER_SEEDS.0,
        SUBMAP_HASHER_SEEDS.1,
        SUBMAP_HASHER_SEEDS.2,
        SUBMAP_HASHER_SEEDS.3,
    )))
}

pub(crate) struct Bucket {
    submaps: Vec<SubMap>,
}

/// One shard of the key space. Owns `buckets × submaps` hash tables and
/// maps one-to-one onto a snapshot file.
pub(crate) struct Shard {
    buckets: Vec<Bucket>,
}

impl Shard {
    pub fn new(buckets: usize, submaps: usize) -> Self {
        Self {
            buckets: (0..buckets)
                .map(|_| Bucket {
                    submaps: (0..submaps).map(|_| new_submap()).collect(),
                })
                .collect(),
        }
    }

    #[inline]
    pub fn submap(&self, bucket: usize, submap: usize) -> &SubMap {
        &self.buckets[bucket].submaps[submap]
    }

    /// Iterate every sub-map in a stable order.
    pub fn submaps(&self) -> impl Iterator<Item = &SubMap> {
        self.buckets.iter().flat_map(|b| b.submaps.iter())
    }

    /// Total number of rows, taking each sub-map read lock briefly.
    pub fn len(&self) -> usize {
        self.submaps().map(|m| m.read().len()).sum()
    }
}
