//! The sharded adaptive cache.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use ahash::RandomState;
use parking_lot::Mutex;

use crate::policy::{CachePolicy, PolicyKind, create_policy};
use crate::shard::CacheShard;
use crate::stats::{Counters, Stats};

/// Seed for the key → shard routing hash. Distinct from the in-shard
/// map seeds so shard routing and bucket placement stay uncorrelated.
const ROUTE_SEEDS: (u64, u64, u64, u64) = (
    0x510e_527f_ade6_82d1,
    0x9b05_688c_2b3e_6c1f,
    0x1f83_d9ab_fb41_bd6b,
    0x5be0_cd19_137e_2179,
);

/// Cache construction options.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Number of independent shards.
    pub shard_count: usize,
    /// Starting capacity in entries.
    pub initial_capacity: usize,
    /// Lower bound for adaptive sizing.
    pub min_capacity: usize,
    /// Upper bound for adaptive sizing.
    pub max_capacity: usize,
    /// Eviction policy.
    pub policy: PolicyKind,
    /// Whether to run the background sizing task.
    pub adaptive_sizing: bool,
    /// How often the sizing task wakes.
    pub adjustment_interval: Duration,
    /// Utilization ratio that triggers an expired-entry sweep.
    pub cleanup_threshold: f64,
    /// Utilization ratio a threshold sweep drives the cache down to.
    pub cleanup_target: f64,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            shard_count: 16,
            initial_capacity: 100_000,
            min_capacity: 1024,
            max_capacity: 10_000_000,
            policy: PolicyKind::Lru,
            adaptive_sizing: true,
            adjustment_interval: Duration::from_secs(300),
            cleanup_threshold: 0.9,
            cleanup_target: 0.7,
        }
    }
}

struct Inner {
    shards: Vec<CacheShard>,
    router: RandomState,
    capacity: AtomicUsize,
    min_capacity: usize,
    max_capacity: usize,
    policy: Mutex<Box<dyn CachePolicy>>,
    counters: Counters,
    cleanup_threshold: f64,
    cleanup_target: f64,
    stop: AtomicBool,
    started: Instant,
}

impl Inner {
    fn shard(&self, key: &[u8]) -> &CacheShard {
        use std::hash::BuildHasher;
        let idx = self.router.hash_one(key) as usize % self.shards.len();
        &self.shards[idx]
    }

    fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    fn set_capacity(&self, new_capacity: usize) {
        let clamped = new_capacity.clamp(self.min_capacity, self.max_capacity);
        let old = self.capacity.swap(clamped, Ordering::Relaxed);
        if clamped < old {
            self.evict_down_to(clamped);
        }
    }

    /// Evict until the cache holds at most `target` entries, spreading
    /// the overflow across shards.
    fn evict_down_to(&self, target: usize) {
        loop {
            let size = self.counters.size();
            if size <= target {
                return;
            }
            let overflow = size - target;
            let per_shard = overflow / self.shards.len() + 1;
            let mut evicted = 0;
            let mut remaining = overflow;
            for shard in &self.shards {
                if remaining == 0 {
                    break;
                }
                let n = shard.evict(per_shard.min(remaining), &self.policy, &self.counters);
                evicted += n;
                remaining -= per_shard.min(remaining);
            }
            if evicted == 0 {
                return;
            }
        }
    }
}

/// Multi-shard front cache with adaptive capacity.
///
/// See the crate docs for the shard anatomy. All operations are safe to
/// call from any thread; background sizing (when enabled) runs on a
/// dedicated thread that is stopped and joined on drop.
pub struct AdaptiveCache {
    inner: Arc<Inner>,
    sizing: Option<JoinHandle<()>>,
}

impl AdaptiveCache {
    pub fn new(options: CacheOptions) -> Self {
        assert!(options.shard_count > 0, "shard_count must be non-zero");

        let shards = (0..options.shard_count).map(|_| CacheShard::new()).collect();
        let initial = options
            .initial_capacity
            .clamp(options.min_capacity, options.max_capacity);

        let inner = Arc::new(Inner {
            shards,
            router: RandomState::with_seeds(
                ROUTE_SEEDS.0,
                ROUTE_SEEDS.1,
                ROUTE_SEEDS.2,
                ROUTE_SEEDS.3,
            ),
            capacity: AtomicUsize::new(initial),
            min_capacity: options.min_capacity,
            max_capacity: options.max_capacity,
            policy: Mutex::new(create_policy(options.policy)),
            counters: Counters::default(),
            cleanup_threshold: options.cleanup_threshold,
            cleanup_target: options.cleanup_target,
            stop: AtomicBool::new(false),
            started: Instant::now(),
        });

        let sizing = options.adaptive_sizing.then(|| {
            let inner = inner.clone();
            let interval = options.adjustment_interval;
            thread::Builder::new()
                .name("cache-sizing".to_string())
                .spawn(move || sizing_loop(inner, interval))
                .expect("failed to spawn cache sizing thread")
        });

        Self { inner, sizing }
    }

    /// Look up a key, updating recency and hit/miss counters.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.inner
            .shard(key)
            .get(key, &self.inner.policy, &self.inner.counters)
    }

    /// Insert or overwrite a key, evicting first when at capacity.
    pub fn put(&self, key: &[u8], value: &[u8]) {
        let inner = &*self.inner;
        let shard = inner.shard(key);

        // Overwrites never grow the cache, so only a genuinely new key
        // can trigger the overflow eviction.
        let size = inner.counters.size();
        let capacity = inner.capacity();
        if size >= capacity && !shard.contains(key) {
            let overflow = (size + 1).saturating_sub(capacity).max(1);
            shard.evict(overflow, &inner.policy, &inner.counters);
        }
        shard.insert(key, value, &inner.policy, &inner.counters);

        // High utilization triggers an expired-entry sweep of the shard
        // we just touched; a full sweep happens on the sizing thread.
        if capacity > 0 {
            let usage = inner.counters.size() as f64 / capacity as f64;
            if usage > inner.cleanup_threshold {
                shard.cleanup_expired(&inner.policy, &inner.counters);
            }
        }
    }

    /// Remove a key. Returns whether it was resident.
    pub fn remove(&self, key: &[u8]) -> bool {
        self.inner
            .shard(key)
            .remove(key, &self.inner.policy, &self.inner.counters)
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.inner.shard(key).contains(key)
    }

    /// Drop every entry.
    pub fn clear(&self) {
        for shard in &self.inner.shards {
            shard.clear(&self.inner.counters);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.counters.size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    /// Resize the cache, evicting overflow immediately on shrink.
    pub fn set_capacity(&self, new_capacity: usize) {
        self.inner.set_capacity(new_capacity);
    }

    pub fn hit_ratio(&self) -> f64 {
        self.inner.counters.hit_ratio()
    }

    pub fn policy_name(&self) -> &'static str {
        self.inner.policy.lock().name()
    }

    /// Swap the eviction policy. Resident entries keep their metrics.
    pub fn set_policy(&self, kind: PolicyKind) {
        *self.inner.policy.lock() = create_policy(kind);
    }

    pub fn stats(&self) -> Stats {
        let name = self.policy_name();
        self.inner
            .counters
            .snapshot(self.capacity(), name, self.inner.started.elapsed())
    }

    #[cfg(test)]
    pub(crate) fn shard_lengths(&self) -> Vec<(usize, usize)> {
        self.inner.shards.iter().map(|s| s.lengths()).collect()
    }
}

impl Drop for AdaptiveCache {
    fn drop(&mut self) {
        self.inner.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.sizing.take() {
            let _ = handle.join();
        }
    }
}

/// Background sizing task: periodically asks the policy for a percent
/// adjustment and applies it, then sweeps toward the cleanup target
/// when utilization is past the threshold.
fn sizing_loop(inner: Arc<Inner>, interval: Duration) {
    let step = Duration::from_millis(250);

    loop {
        let mut slept = Duration::ZERO;
        while slept < interval {
            if inner.stop.load(Ordering::Relaxed) {
                return;
            }
            let nap = step.min(interval - slept);
            thread::sleep(nap);
            slept += nap;
        }
        if inner.stop.load(Ordering::Relaxed) {
            return;
        }

        let pct = inner.policy.lock().size_adjustment().clamp(-100, 100);
        if pct != 0 {
            let current = inner.capacity();
            let target = (current as f64 * (1.0 + pct as f64 / 100.0)).round() as usize;
            let clamped = target.clamp(inner.min_capacity, inner.max_capacity);
            if clamped != current {
                tracing::debug!(
                    current,
                    new = clamped,
                    pct,
                    "adaptive cache capacity adjustment"
                );
                inner.set_capacity(clamped);
            }
        }

        let capacity = inner.capacity();
        if capacity > 0 {
            let size = inner.counters.size();
            if size as f64 / capacity as f64 > inner.cleanup_threshold {
                let target = (capacity as f64 * inner.cleanup_target).floor() as usize;
                inner.evict_down_to(target);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_cache(capacity: usize) -> AdaptiveCache {
        AdaptiveCache::new(CacheOptions {
            shard_count: 1,
            initial_capacity: capacity,
            min_capacity: 1,
            max_capacity: 1_000_000,
            adaptive_sizing: false,
            ..CacheOptions::default()
        })
    }

    #[test]
    fn put_get_remove() {
        let cache = small_cache(16);
        cache.put(b"k", b"v1");
        assert_eq!(cache.get(b"k"), Some(b"v1".to_vec()));

        cache.put(b"k", b"v2");
        assert_eq!(cache.get(b"k"), Some(b"v2".to_vec()));
        assert_eq!(cache.len(), 1);

        assert!(cache.remove(b"k"));
        assert!(!cache.remove(b"k"));
        assert_eq!(cache.get(b"k"), None);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn counters_track_hits_and_misses() {
        let cache = small_cache(16);
        cache.put(b"a", b"1");
        assert!(cache.get(b"a").is_some());
        assert!(cache.get(b"a").is_some());
        assert!(cache.get(b"missing").is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_ratio - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn overflow_evicts_least_recently_used() {
        let cache = small_cache(3);
        cache.put(b"a", b"1");
        cache.put(b"b", b"1");
        cache.put(b"c", b"1");
        // Touch `a`, making `b` the LRU entry.
        assert!(cache.get(b"a").is_some());
        cache.put(b"d", b"1");

        assert_eq!(cache.len(), 3);
        assert!(cache.contains(b"a"));
        assert!(!cache.contains(b"b"));
        assert!(cache.contains(b"c"));
        assert!(cache.contains(b"d"));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn capacity_plus_one_inserts_keep_size_at_capacity() {
        let capacity = 64;
        let cache = small_cache(capacity);
        for i in 0..=capacity {
            cache.put(format!("key-{i}").as_bytes(), b"v");
        }
        assert_eq!(cache.len(), capacity);
        // The very first key was the least recently used.
        assert!(!cache.contains(b"key-0"));
        assert!(cache.contains(format!("key-{capacity}").as_bytes()));
    }

    #[test]
    fn overwrite_refreshes_recency() {
        let cache = small_cache(2);
        cache.put(b"a", b"1");
        cache.put(b"b", b"1");
        cache.put(b"a", b"2");
        cache.put(b"c", b"1");

        assert!(cache.contains(b"a"));
        assert!(!cache.contains(b"b"));
        assert!(cache.contains(b"c"));
    }

    #[test]
    fn map_and_list_stay_in_sync() {
        let cache = AdaptiveCache::new(CacheOptions {
            shard_count: 4,
            initial_capacity: 128,
            min_capacity: 1,
            adaptive_sizing: false,
            ..CacheOptions::default()
        });

        for i in 0..500u32 {
            cache.put(&i.to_be_bytes(), b"v");
            if i % 3 == 0 {
                cache.get(&(i / 2).to_be_bytes());
            }
            if i % 7 == 0 {
                cache.remove(&(i / 3).to_be_bytes());
            }
        }

        let mut total = 0;
        for (map_len, list_len) in cache.shard_lengths() {
            assert_eq!(map_len, list_len);
            total += map_len;
        }
        assert_eq!(total, cache.len());
    }

    #[test]
    fn shrink_evicts_overflow() {
        let cache = small_cache(100);
        for i in 0..100u32 {
            cache.put(&i.to_be_bytes(), b"v");
        }
        assert_eq!(cache.len(), 100);

        cache.set_capacity(10);
        assert!(cache.len() <= 10);
        assert_eq!(cache.capacity(), 10);
    }

    #[test]
    fn capacity_clamped_to_bounds() {
        let cache = AdaptiveCache::new(CacheOptions {
            shard_count: 1,
            initial_capacity: 50,
            min_capacity: 10,
            max_capacity: 100,
            adaptive_sizing: false,
            ..CacheOptions::default()
        });
        cache.set_capacity(5);
        assert_eq!(cache.capacity(), 10);
        cache.set_capacity(1000);
        assert_eq!(cache.capacity(), 100);
    }

    #[test]
    fn clear_empties_everything() {
        let cache = small_cache(16);
        for i in 0..10u32 {
            cache.put(&i.to_be_bytes(), b"v");
        }
        cache.clear();
        assert_eq!(cache.len(), 0);
        assert!(!cache.contains(&3u32.to_be_bytes()));
        // Still usable afterwards.
        cache.put(b"x", b"y");
        assert_eq!(cache.get(b"x"), Some(b"y".to_vec()));
    }

    #[test]
    fn tlru_expires_on_lookup() {
        let cache = AdaptiveCache::new(CacheOptions {
            shard_count: 1,
            initial_capacity: 16,
            min_capacity: 1,
            policy: PolicyKind::Tlru,
            adaptive_sizing: false,
            ..CacheOptions::default()
        });
        // Default TLRU TTL is long; swap in a short one through the
        // policy handle by reinserting under a tiny-TTL policy object.
        cache.put(b"k", b"v");
        assert!(cache.get(b"k").is_some());

        // Install a zero-ish TTL and observe expiry on next lookup.
        *cache.inner.policy.lock() =
            Box::new(crate::policy::TlruPolicy::new(Duration::from_millis(1)));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.get(b"k"), None);

        let stats = cache.stats();
        assert_eq!(stats.expirations, 1);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn policy_swap_keeps_entries() {
        let cache = small_cache(16);
        cache.put(b"k", b"v");
        assert_eq!(cache.policy_name(), "LRU");
        cache.set_policy(PolicyKind::Lfu);
        assert_eq!(cache.policy_name(), "LFU");
        assert_eq!(cache.get(b"k"), Some(b"v".to_vec()));
    }

    #[test]
    fn adaptive_sizing_grows_on_high_hit_ratio() {
        let cache = AdaptiveCache::new(CacheOptions {
            shard_count: 1,
            initial_capacity: 1000,
            min_capacity: 100,
            max_capacity: 100_000,
            policy: PolicyKind::Lfu,
            adaptive_sizing: true,
            adjustment_interval: Duration::from_millis(50),
            ..CacheOptions::default()
        });

        // Drive a high hit ratio past the LFU sample floor.
        cache.put(b"hot", b"v");
        for _ in 0..2000 {
            cache.get(b"hot");
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while cache.capacity() <= 1000 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert!(cache.capacity() > 1000, "capacity never grew");
    }

    #[test]
    fn concurrent_mixed_workload() {
        let cache = Arc::new(AdaptiveCache::new(CacheOptions {
            shard_count: 8,
            initial_capacity: 4096,
            min_capacity: 64,
            adaptive_sizing: false,
            ..CacheOptions::default()
        }));

        let mut handles = Vec::new();
        for t in 0..4u32 {
            let cache = cache.clone();
            handles.push(thread::spawn(move || {
                for i in 0..10_000u32 {
                    let key = ((i * 31 + t) % 2048).to_be_bytes();
                    match i % 3 {
                        0 => cache.put(&key, &i.to_be_bytes()),
                        1 => {
                            cache.get(&key);
                        }
                        _ => {
                            cache.remove(&key);
                        }
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let mut total = 0;
        for (map_len, list_len) in cache.shard_lengths() {
            assert_eq!(map_len, list_len);
            total += map_len;
        }
        assert_eq!(total, cache.len());
    }
}
