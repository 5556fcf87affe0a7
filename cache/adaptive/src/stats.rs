//! Cache statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Lock-free counters shared by every shard.
#[derive(Default)]
pub(crate) struct Counters {
    pub size: AtomicU64,
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
    pub expirations: AtomicU64,
}

impl Counters {
    #[inline]
    pub fn add_size(&self, delta: i64) {
        if delta >= 0 {
            self.size.fetch_add(delta as u64, Ordering::Relaxed);
        } else {
            self.size.fetch_sub((-delta) as u64, Ordering::Relaxed);
        }
    }

    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed) as usize
    }

    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// Point-in-time snapshot of the cache.
#[derive(Debug, Clone)]
pub struct Stats {
    pub size: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
    pub evictions: u64,
    pub expirations: u64,
    pub policy_name: &'static str,
    pub uptime: Duration,
}

impl Counters {
    pub fn snapshot(
        &self,
        capacity: usize,
        policy_name: &'static str,
        uptime: Duration,
    ) -> Stats {
        Stats {
            size: self.size(),
            capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            hit_ratio: self.hit_ratio(),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            policy_name,
            uptime,
        }
    }
}
