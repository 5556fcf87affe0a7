//! Cache entries and their access metrics.

use std::ptr::NonNull;
use std::time::Instant;

/// Per-entry access bookkeeping consumed by the eviction policies.
#[derive(Debug, Clone)]
pub struct EntryMetrics {
    /// When the entry was last touched. FIFO deliberately never updates
    /// this, so for FIFO it doubles as the insertion time.
    pub last_access: Instant,
    /// Accesses since insertion (or the last reset).
    pub access_count: u32,
    /// Lifetime access total.
    pub total_access_count: u64,
    /// Decayed weight applied to the access count by LFU aging.
    pub frequency_weight: f64,
}

impl EntryMetrics {
    pub fn new() -> Self {
        Self {
            last_access: Instant::now(),
            access_count: 0,
            total_access_count: 0,
            frequency_weight: 1.0,
        }
    }

    /// Record one access.
    pub fn record_access(&mut self) {
        self.last_access = Instant::now();
        self.access_count += 1;
        self.total_access_count += 1;
    }

    /// Age the frequency weight, used by LFU decay.
    pub fn age(&mut self, factor: f64) {
        self.frequency_weight *= factor;
    }
}

impl Default for EntryMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// A resident cache entry.
///
/// Entries live in a shard's typed pool and are linked into that
/// shard's recency list through `prev`/`next`. The shard lock is the
/// only thing allowed to follow these pointers.
pub(crate) struct Entry {
    pub key: Box<[u8]>,
    pub value: Vec<u8>,
    pub metrics: EntryMetrics,
    pub prev: Option<NonNull<Entry>>,
    pub next: Option<NonNull<Entry>>,
}

impl Entry {
    pub fn new(key: &[u8], value: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            value,
            metrics: EntryMetrics::new(),
            prev: None,
            next: None,
        }
    }
}
