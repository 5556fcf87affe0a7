//! Key routing.

use std::hash::BuildHasher;

use ahash::RandomState;

// Each routing level hashes with its own seed set. Reusing one seed for
// shard and bucket selection would make the bucket index a function of
// the shard index and collapse the distribution inside every shard.
const SHARD_SEEDS: (u64, u64, u64, u64) = (
    0x428a_2f98_d728_ae22,
    0x7137_4491_23ef_65cd,
    0xb5c0_fbcf_ec4d_3b2f,
    0xe9b5_dba5_8189_dbbc,
);
const BUCKET_SEEDS: (u64, u64, u64, u64) = (
    0x3956_c25b_f348_b538,
    0x59f1_11f1_b605_d019,
    0x923f_82a4_af19_4f9b,
    0xab1c_5ed5_da6d_8118,
);
const SUBMAP_SEEDS: (u64, u64, u64, u64) = (
    0xd807_aa98_a303_0242,
    0x1283_5b01_4570_6fbe,
    0x2431_85be_4ee4_b28c,
    0x550c_7dc3_d5ff_b4e2,
);

/// Routes a key to its unique (shard, bucket, sub-map) triple.
///
/// The triple is a pure function of the key bytes and the three fixed
/// seed sets, so a key always lands in exactly one sub-map.
pub(crate) struct KeyRouter {
    h1: RandomState,
    h2: RandomState,
    h3: RandomState,
    shards: usize,
    buckets: usize,
    submaps: usize,
}

impl KeyRouter {
    pub fn new(shards: usize, buckets: usize, submaps: usize) -> Self {
        assert!(shards > 0 && buckets > 0 && submaps > 0);
        Self {
            h1: RandomState::with_seeds(
                SHARD_SEEDS.0,
                SHARD_SEEDS.1,
                SHARD_SEEDS.2,
                SHARD_SEEDS.3,
            ),
            h2: RandomState::with_seeds(
                BUCKET_SEEDS.0,
                BUCKET_SEEDS.1,
                BUCKET_SEEDS.2,
                BUCKET_SEEDS.3,
            ),
            h3: RandomState::with_seeds(
                SUBMAP_SEEDS.0,
                SUBMAP_SEEDS.1,
                SUBMAP_SEEDS.2,
                SUBMAP_SEEDS.3,
            ),
            shards,
            buckets,
            submaps,
        }
    }

    #[inline]
    pub fn shard(&self, key: &[u8]) -> usize {
        self.h1.hash_one(key) as usize % self.shards
    }

    /// Bucket and sub-map within a shard.
    #[inline]
    pub fn slot(&self, key: &[u8]) -> (usize, usize) {
        (
            self.h2.hash_one(key) as usize % self.buckets,
            self.h3.hash_one(key) as usize % self.submaps,
        )
    }

    /// Full (shard, bucket, sub-map) route.
    #[inline]
    pub fn route(&self, key: &[u8]) -> (usize, usize, usize) {
        let (bucket, submap) = self.slot(key);
        (self.shard(key), bucket, submap)
    }
}
