//! One cache shard: hash index, recency list, entry pool.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;

use ahash::RandomState;
use entry_pool::TypedPool;
use parking_lot::{Mutex, RwLock, RwLockUpgradableReadGuard};

use crate::entry::Entry;
use crate::policy::CachePolicy;
use crate::stats::Counters;

// Fixed seeds so shard maps hash identically across runs.
const MAP_SEEDS: (u64, u64, u64, u64) = (
    0x6a09_e667_f3bc_c908,
    0xbb67_ae85_84ca_a73b,
    0x3c6e_f372_fe94_f82b,
    0xa54f_f53a_5f1d_36f1,
);

/// Mutable shard interior. Only ever touched through the shard lock.
pub(crate) struct ShardState {
    map: HashMap<Box<[u8]>, NonNull<Entry>, RandomState>,
    /// Most recently used entry.
    head: Option<NonNull<Entry>>,
    /// Least recently used entry.
    tail: Option<NonNull<Entry>>,
    pool: TypedPool<Entry>,
}

// SAFETY: the NonNull entries point exclusively into this shard's own
// pool, no reference escapes the lock, and the RwLock serializes all
// access.
unsafe impl Send for ShardState {}
unsafe impl Sync for ShardState {}

impl ShardState {
    fn new() -> Self {
        Self {
            map: HashMap::with_hasher(RandomState::with_seeds(
                MAP_SEEDS.0, MAP_SEEDS.1, MAP_SEEDS.2, MAP_SEEDS.3,
            )),
            head: None,
            tail: None,
            pool: TypedPool::new(),
        }
    }

    fn push_front(&mut self, mut node: NonNull<Entry>) {
        // SAFETY: node is live in this shard and currently unlinked.
        unsafe {
            node.as_mut().prev = None;
            node.as_mut().next = self.head;
            if let Some(mut head) = self.head {
                head.as_mut().prev = Some(node);
            }
        }
        self.head = Some(node);
        if self.tail.is_none() {
            self.tail = Some(node);
        }
    }

    fn unlink(&mut self, mut node: NonNull<Entry>) {
        // SAFETY: node is live and linked in this shard's list.
        unsafe {
            match node.as_ref().prev {
                Some(mut prev) => prev.as_mut().next = node.as_ref().next,
                None => self.head = node.as_ref().next,
            }
            match node.as_ref().next {
                Some(mut next) => next.as_mut().prev = node.as_ref().prev,
                None => self.tail = node.as_ref().prev,
            }
            node.as_mut().prev = None;
            node.as_mut().next = None;
        }
    }

    fn move_to_front(&mut self, node: NonNull<Entry>) {
        if self.head == Some(node) {
            return;
        }
        self.unlink(node);
        self.push_front(node);
    }

    /// Unlink an entry, drop it from the index and free its block.
    ///
    /// # Safety
    ///
    /// `node` must be live and linked in this shard.
    unsafe fn detach(&mut self, node: NonNull<Entry>) {
        self.unlink(node);
        // SAFETY: the entry stays alive until after the map removal;
        // the key borrow never outlives it.
        unsafe {
            let key: *const [u8] = &*node.as_ref().key;
            self.map.remove(&*key);
            self.pool.deallocate(node);
        }
    }

    fn list_len(&self) -> usize {
        let mut n = 0;
        let mut cursor = self.head;
        while let Some(node) = cursor {
            n += 1;
            // SAFETY: list nodes are live while linked.
            cursor = unsafe { node.as_ref().next };
        }
        n
    }
}

impl Drop for ShardState {
    fn drop(&mut self) {
        let mut cursor = self.head;
        while let Some(node) = cursor {
            // SAFETY: walking the list once, freeing each node exactly
            // once; `next` is read before the node is destroyed.
            unsafe {
                cursor = node.as_ref().next;
                self.pool.deallocate(node);
            }
        }
        self.head = None;
        self.tail = None;
        self.map.clear();
    }
}

/// A single cache shard behind its reader/writer lock.
pub(crate) struct CacheShard {
    state: RwLock<ShardState>,
}

impl CacheShard {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(ShardState::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.state.read().map.len()
    }

    /// Look up a key; a hit is spliced to the list front.
    pub fn get(
        &self,
        key: &[u8],
        policy: &Mutex<Box<dyn CachePolicy>>,
        counters: &Counters,
    ) -> Option<Vec<u8>> {
        let guard = self.state.upgradable_read();
        let Some(&node) = guard.map.get(key) else {
            counters.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        // SAFETY: node is live while we hold the shard lock.
        let expired = { policy.lock().should_evict_now(unsafe { &node.as_ref().metrics }) };
        let mut state = RwLockUpgradableReadGuard::upgrade(guard);

        if expired {
            {
                let mut policy = policy.lock();
                // SAFETY: as above.
                policy.on_evict(unsafe { &node.as_ref().metrics });
            }
            // SAFETY: node is live and linked; the write lock is held.
            unsafe { state.detach(node) };
            counters.add_size(-1);
            counters.expirations.fetch_add(1, Ordering::Relaxed);
            counters.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        // SAFETY: exclusive access through the write lock.
        let value = unsafe {
            let entry = &mut *node.as_ptr();
            policy.lock().on_access(&mut entry.metrics);
            entry.value.clone()
        };
        state.move_to_front(node);
        counters.hits.fetch_add(1, Ordering::Relaxed);
        Some(value)
    }

    /// Insert or overwrite. Returns true when a new entry was created.
    pub fn insert(
        &self,
        key: &[u8],
        value: &[u8],
        policy: &Mutex<Box<dyn CachePolicy>>,
        counters: &Counters,
    ) -> bool {
        let mut state = self.state.write();

        if let Some(&node) = state.map.get(key) {
            // SAFETY: exclusive access through the write lock.
            unsafe {
                let entry = &mut *node.as_ptr();
                entry.value.clear();
                entry.value.extend_from_slice(value);
                policy.lock().on_access(&mut entry.metrics);
            }
            state.move_to_front(node);
            return false;
        }

        let mut entry = Entry::new(key, value.to_vec());
        policy.lock().on_add(&mut entry.metrics);
        let node = state.pool.allocate(entry);
        state.push_front(node);
        state.map.insert(key.into(), node);
        counters.add_size(1);
        true
    }

    /// Remove one key. Returns whether it was present.
    pub fn remove(
        &self,
        key: &[u8],
        policy: &Mutex<Box<dyn CachePolicy>>,
        counters: &Counters,
    ) -> bool {
        let mut state = self.state.write();
        let Some(&node) = state.map.get(key) else {
            return false;
        };
        // SAFETY: node is live while we hold the write lock.
        policy.lock().on_evict(unsafe { &node.as_ref().metrics });
        // SAFETY: node is live and linked.
        unsafe { state.detach(node) };
        counters.add_size(-1);
        true
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.state.read().map.contains_key(key)
    }

    /// Evict up to `count` entries ranked by descending policy
    /// priority. Returns the number actually evicted.
    pub fn evict(
        &self,
        count: usize,
        policy: &Mutex<Box<dyn CachePolicy>>,
        counters: &Counters,
    ) -> usize {
        if count == 0 {
            return 0;
        }
        let mut state = self.state.write();

        let mut candidates: Vec<(NonNull<Entry>, f64)> = Vec::with_capacity(state.map.len());
        {
            let policy = policy.lock();
            let mut cursor = state.head;
            while let Some(node) = cursor {
                // SAFETY: list nodes are live while the lock is held.
                let metrics = unsafe { &node.as_ref().metrics };
                let priority = if policy.should_evict_now(metrics) {
                    f64::INFINITY
                } else {
                    policy.eviction_priority(metrics)
                };
                candidates.push((node, priority));
                cursor = unsafe { node.as_ref().next };
            }
        }
        candidates.sort_by(|a, b| b.1.total_cmp(&a.1));

        let take = count.min(candidates.len());
        let mut policy = policy.lock();
        for &(node, _) in candidates.iter().take(take) {
            // SAFETY: nodes were collected under this same write lock.
            unsafe {
                policy.on_evict(&node.as_ref().metrics);
                state.detach(node);
            }
            counters.add_size(-1);
            counters.evictions.fetch_add(1, Ordering::Relaxed);
        }
        take
    }

    /// Drop every entry the policy reports as expired.
    pub fn cleanup_expired(
        &self,
        policy: &Mutex<Box<dyn CachePolicy>>,
        counters: &Counters,
    ) -> usize {
        let mut state = self.state.write();

        let mut expired = Vec::new();
        {
            let policy = policy.lock();
            let mut cursor = state.head;
            while let Some(node) = cursor {
                // SAFETY: list nodes are live while the lock is held.
                if policy.should_evict_now(unsafe { &node.as_ref().metrics }) {
                    expired.push(node);
                }
                cursor = unsafe { node.as_ref().next };
            }
        }

        let removed = expired.len();
        for node in expired {
            // SAFETY: still linked; collected under this write lock.
            unsafe { state.detach(node) };
            counters.add_size(-1);
            counters.expirations.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    pub fn clear(&self, counters: &Counters) {
        let mut state = self.state.write();
        let removed = state.map.len();
        let mut cursor = state.head;
        while let Some(node) = cursor {
            // SAFETY: single pass over the list; next read before free.
            unsafe {
                cursor = node.as_ref().next;
                state.pool.deallocate(node);
            }
        }
        state.head = None;
        state.tail = None;
        state.map.clear();
        counters.add_size(-(removed as i64));
    }

    /// (index length, list length) — equal at every quiescent point.
    pub fn lengths(&self) -> (usize, usize) {
        let state = self.state.read();
        (state.map.len(), state.list_len())
    }
}
