//! Eviction policies.
//!
//! The cache calls into exactly one policy object, held behind a coarse
//! mutex. Policies see entry metrics, never entries, so they cannot
//! touch shard state.

use std::str::FromStr;
use std::time::{Duration, Instant};

use crate::entry::EntryMetrics;

/// Which policy a cache is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    Lru,
    Lfu,
    Fifo,
    Tlru,
}

impl FromStr for PolicyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lru" => Ok(PolicyKind::Lru),
            "lfu" => Ok(PolicyKind::Lfu),
            "fifo" => Ok(PolicyKind::Fifo),
            "tlru" => Ok(PolicyKind::Tlru),
            other => Err(format!("unknown cache policy: '{other}'")),
        }
    }
}

/// The extension point for eviction behavior.
///
/// `eviction_priority` ranks entries for removal: higher means evicted
/// sooner. `size_adjustment` returns a percent in [-100, 100] consumed
/// by the adaptive sizing loop.
pub trait CachePolicy: Send {
    fn kind(&self) -> PolicyKind;
    fn name(&self) -> &'static str;

    /// An existing entry was read or overwritten.
    fn on_access(&mut self, metrics: &mut EntryMetrics);

    /// A new entry was inserted.
    fn on_add(&mut self, metrics: &mut EntryMetrics);

    /// An entry is being evicted or removed.
    fn on_evict(&mut self, metrics: &EntryMetrics);

    /// Whether the entry must be dropped on sight (e.g. TTL expiry).
    fn should_evict_now(&self, metrics: &EntryMetrics) -> bool;

    /// Eviction rank; higher is evicted first.
    fn eviction_priority(&self, metrics: &EntryMetrics) -> f64;

    /// Recommended capacity change in percent.
    fn size_adjustment(&self) -> i32;

    /// Forget accumulated policy state.
    fn reset(&mut self);
}

/// Instantiate a policy by kind.
pub fn create_policy(kind: PolicyKind) -> Box<dyn CachePolicy> {
    match kind {
        PolicyKind::Lru => Box::new(LruPolicy),
        PolicyKind::Lfu => Box::new(LfuPolicy::default()),
        PolicyKind::Fifo => Box::new(FifoPolicy),
        PolicyKind::Tlru => Box::new(TlruPolicy::default()),
    }
}

/// Least-recently-used. The baseline.
pub struct LruPolicy;

impl CachePolicy for LruPolicy {
    fn kind(&self) -> PolicyKind {
        PolicyKind::Lru
    }

    fn name(&self) -> &'static str {
        "LRU"
    }

    fn on_access(&mut self, metrics: &mut EntryMetrics) {
        metrics.record_access();
    }

    fn on_add(&mut self, metrics: &mut EntryMetrics) {
        metrics.record_access();
    }

    fn on_evict(&mut self, _metrics: &EntryMetrics) {}

    fn should_evict_now(&self, _metrics: &EntryMetrics) -> bool {
        false
    }

    fn eviction_priority(&self, metrics: &EntryMetrics) -> f64 {
        metrics.last_access.elapsed().as_secs_f64()
    }

    fn size_adjustment(&self) -> i32 {
        0
    }

    fn reset(&mut self) {}
}

/// Least-frequently-used with periodic aging of the frequency weight.
///
/// Also the one policy that drives adaptive sizing: a sustained high
/// hit ratio asks for more capacity, a low one asks for less.
pub struct LfuPolicy {
    decay_factor: f64,
    decay_interval: Duration,
    last_decay: Instant,
    total_accesses: u64,
    hits: u64,
}

impl LfuPolicy {
    pub fn new(decay_factor: f64, decay_interval: Duration) -> Self {
        Self {
            decay_factor,
            decay_interval,
            last_decay: Instant::now(),
            total_accesses: 0,
            hits: 0,
        }
    }
}

impl Default for LfuPolicy {
    fn default() -> Self {
        Self::new(0.95, Duration::from_secs(3600))
    }
}

impl CachePolicy for LfuPolicy {
    fn kind(&self) -> PolicyKind {
        PolicyKind::Lfu
    }

    fn name(&self) -> &'static str {
        "LFU"
    }

    fn on_access(&mut self, metrics: &mut EntryMetrics) {
        self.total_accesses += 1;
        self.hits += 1;
        metrics.record_access();

        if self.last_decay.elapsed() >= self.decay_interval {
            metrics.age(self.decay_factor);
            self.last_decay = Instant::now();
        }
    }

    fn on_add(&mut self, metrics: &mut EntryMetrics) {
        self.total_accesses += 1;
        metrics.record_access();
    }

    fn on_evict(&mut self, _metrics: &EntryMetrics) {}

    fn should_evict_now(&self, _metrics: &EntryMetrics) -> bool {
        false
    }

    fn eviction_priority(&self, metrics: &EntryMetrics) -> f64 {
        let weighted = metrics.access_count as f64 * metrics.frequency_weight;
        if weighted <= 0.0 {
            f64::INFINITY
        } else {
            1.0 / weighted
        }
    }

    fn size_adjustment(&self) -> i32 {
        // Too few samples to mean anything.
        if self.total_accesses < 1000 {
            return 0;
        }
        let hit_ratio = self.hits as f64 / self.total_accesses as f64;
        if hit_ratio > 0.9 {
            10
        } else if hit_ratio < 0.5 {
            -10
        } else {
            0
        }
    }

    fn reset(&mut self) {
        self.total_accesses = 0;
        self.hits = 0;
        self.last_decay = Instant::now();
    }
}

/// First-in-first-out: insertion order only, accesses don't matter.
pub struct FifoPolicy;

impl CachePolicy for FifoPolicy {
    fn kind(&self) -> PolicyKind {
        PolicyKind::Fifo
    }

    fn name(&self) -> &'static str {
        "FIFO"
    }

    fn on_access(&mut self, metrics: &mut EntryMetrics) {
        // Count the access but leave last_access at insertion time.
        metrics.access_count += 1;
        metrics.total_access_count += 1;
    }

    fn on_add(&mut self, _metrics: &mut EntryMetrics) {}

    fn on_evict(&mut self, _metrics: &EntryMetrics) {}

    fn should_evict_now(&self, _metrics: &EntryMetrics) -> bool {
        false
    }

    fn eviction_priority(&self, metrics: &EntryMetrics) -> f64 {
        metrics.last_access.elapsed().as_secs_f64()
    }

    fn size_adjustment(&self) -> i32 {
        0
    }

    fn reset(&mut self) {}
}

/// Time-aware LRU: LRU ordering plus a hard TTL on idle entries.
pub struct TlruPolicy {
    ttl: Duration,
}

impl TlruPolicy {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl }
    }
}

impl Default for TlruPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(30 * 60))
    }
}

impl CachePolicy for TlruPolicy {
    fn kind(&self) -> PolicyKind {
        PolicyKind::Tlru
    }

    fn name(&self) -> &'static str {
        "TLRU"
    }

    fn on_access(&mut self, metrics: &mut EntryMetrics) {
        metrics.record_access();
    }

    fn on_add(&mut self, metrics: &mut EntryMetrics) {
        metrics.record_access();
    }

    fn on_evict(&mut self, _metrics: &EntryMetrics) {}

    fn should_evict_now(&self, metrics: &EntryMetrics) -> bool {
        metrics.last_access.elapsed() > self.ttl
    }

    fn eviction_priority(&self, metrics: &EntryMetrics) -> f64 {
        if self.should_evict_now(metrics) {
            f64::INFINITY
        } else {
            metrics.last_access.elapsed().as_secs_f64()
        }
    }

    fn size_adjustment(&self) -> i32 {
        0
    }

    fn reset(&mut self) {}
}
