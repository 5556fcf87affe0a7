//! The public store surface.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use adaptive_cache::AdaptiveCache;
use tracing::{debug, info, warn};

use crate::compress::{compress, decompress};
use crate::error::StoreError;
use crate::persist::{load_shard, persist_shard, shard_path};
use crate::router::KeyRouter;
use crate::shard::Shard;

/// Snapshot configuration.
#[derive(Debug, Clone)]
pub struct PersistOptions {
    /// Directory holding the per-shard `shard_<i>.dat` files.
    pub path: PathBuf,
    /// Background flush cadence. Zero disables the flush thread but
    /// keeps load-at-startup and explicit flushes.
    pub sync_interval: Duration,
}

/// Store construction options.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub shard_count: usize,
    pub buckets_per_shard: usize,
    pub submaps_per_bucket: usize,
    /// zlib-compress values at rest. The front cache always holds the
    /// uncompressed form.
    pub enable_compression: bool,
    pub persistence: Option<PersistOptions>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            shard_count: 16,
            buckets_per_shard: 8,
            submaps_per_bucket: 8,
            enable_compression: false,
            persistence: None,
        }
    }
}

struct Inner {
    shards: Vec<Shard>,
    router: KeyRouter,
    cache: AdaptiveCache,
    compression: bool,
    persist_dir: Option<PathBuf>,
    stop: AtomicBool,
}

impl Inner {
    fn encode(&self, value: &[u8]) -> Vec<u8> {
        if self.compression {
            compress(value)
        } else {
            value.to_vec()
        }
    }

    fn decode(&self, stored: Vec<u8>) -> Option<Vec<u8>> {
        if !self.compression {
            return Some(stored);
        }
        match decompress(&stored) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(error = %e, "stored value failed to decompress, treating as absent");
                None
            }
        }
    }

    /// Snapshot every shard. Failures are contained per shard.
    fn flush_all(&self) {
        let Some(dir) = &self.persist_dir else {
            return;
        };
        for (i, shard) in self.shards.iter().enumerate() {
            let path = shard_path(dir, i);
            if let Err(source) = persist_shard(shard, &path) {
                warn!(error = %StoreError::SnapshotWrite { path, source }, "snapshot failed");
            }
        }
    }
}

/// Sharded key/value store with an LRU front cache.
///
/// All operations are safe from any thread. Sub-map locks are held only
/// around the hash-map access itself and are never held while the
/// front cache is touched (lock order: sub-map before cache shard,
/// never both at once).
pub struct Store {
    inner: Arc<Inner>,
    sync: Option<JoinHandle<()>>,
}

impl Store {
    /// Build a store, loading existing snapshots when persistence is
    /// configured.
    pub fn new(options: StoreOptions, cache: AdaptiveCache) -> Result<Self, StoreError> {
        let router = KeyRouter::new(
            options.shard_count,
            options.buckets_per_shard,
            options.submaps_per_bucket,
        );
        let shards: Vec<Shard> = (0..options.shard_count)
            .map(|_| Shard::new(options.buckets_per_shard, options.submaps_per_bucket))
            .collect();

        let persist_dir = match &options.persistence {
            Some(p) => {
                std::fs::create_dir_all(&p.path).map_err(|source| StoreError::CreateDir {
                    path: p.path.clone(),
                    source,
                })?;
                Some(p.path.clone())
            }
            None => None,
        };

        if let Some(dir) = &persist_dir {
            let mut total = 0;
            for (i, shard) in shards.iter().enumerate() {
                let path = shard_path(dir, i);
                match load_shard(shard, &router, &path) {
                    Ok(n) => total += n,
                    Err(source) => {
                        warn!(error = %StoreError::SnapshotLoad { path, source }, "snapshot load failed");
                    }
                }
            }
            if total > 0 {
                info!(rows = total, "restored snapshot data");
            }
        }

        let inner = Arc::new(Inner {
            shards,
            router,
            cache,
            compression: options.enable_compression,
            persist_dir,
            stop: AtomicBool::new(false),
        });

        let sync = options
            .persistence
            .as_ref()
            .filter(|p| !p.sync_interval.is_zero())
            .map(|p| {
                let inner = inner.clone();
                let interval = p.sync_interval;
                thread::Builder::new()
                    .name("store-sync".to_string())
                    .spawn(move || sync_loop(inner, interval))
                    .expect("failed to spawn store sync thread")
            });

        Ok(Self { inner, sync })
    }

    /// Insert or overwrite one key.
    pub fn set(&self, key: &[u8], value: &[u8]) {
        let inner = &*self.inner;
        inner.cache.put(key, value);

        let stored = inner.encode(value);
        let (s, b, m) = inner.router.route(key);
        inner.shards[s]
            .submap(b, m)
            .write()
            .insert(key.to_vec(), stored);
    }

    /// Fetch one key, consulting the cache first.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let inner = &*self.inner;
        if let Some(value) = inner.cache.get(key) {
            return Some(value);
        }

        let (s, b, m) = inner.router.route(key);
        let stored = inner.shards[s].submap(b, m).read().get(key).cloned()?;
        let value = inner.decode(stored)?;
        inner.cache.put(key, &value);
        Some(value)
    }

    /// Delete one key. Returns whether a row was removed.
    pub fn del(&self, key: &[u8]) -> bool {
        let inner = &*self.inner;
        inner.cache.remove(key);

        let (s, b, m) = inner.router.route(key);
        inner.shards[s].submap(b, m).write().remove(key).is_some()
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        let inner = &*self.inner;
        if inner.cache.contains(key) {
            return true;
        }
        let (s, b, m) = inner.router.route(key);
        inner.shards[s].submap(b, m).read().contains_key(key)
    }

    /// Batched insert. Sub-maps are locked at most once per call.
    pub fn mset(&self, pairs: &[(&[u8], &[u8])]) {
        let inner = &*self.inner;
        for (key, value) in pairs {
            inner.cache.put(key, value);
        }

        // Encode outside any lock.
        let stored: Vec<Vec<u8>> = pairs.iter().map(|(_, v)| inner.encode(v)).collect();

        for ((s, b, m), indexes) in group_by_route(&inner.router, pairs.iter().map(|(k, _)| *k)) {
            let mut map = inner.shards[s].submap(b, m).write();
            for i in indexes {
                map.insert(pairs[i].0.to_vec(), stored[i].clone());
            }
        }
    }

    /// Batched fetch; results line up with `keys`.
    pub fn mget(&self, keys: &[&[u8]]) -> Vec<Option<Vec<u8>>> {
        let inner = &*self.inner;
        let mut results: Vec<Option<Vec<u8>>> = vec![None; keys.len()];

        let mut missing = Vec::new();
        for (i, key) in keys.iter().enumerate() {
            match inner.cache.get(key) {
                Some(value) => results[i] = Some(value),
                None => missing.push(i),
            }
        }
        if missing.is_empty() {
            return results;
        }

        // One lock acquisition per sub-map touched.
        let mut raw: Vec<Option<Vec<u8>>> = vec![None; keys.len()];
        for ((s, b, m), indexes) in
            group_by_route(&inner.router, missing.iter().map(|&i| keys[i]))
        {
            let map = inner.shards[s].submap(b, m).read();
            for gi in indexes {
                let i = missing[gi];
                raw[i] = map.get(keys[i]).cloned();
            }
        }

        // Decode and fill the cache after the locks are gone.
        for &i in &missing {
            if let Some(stored) = raw[i].take()
                && let Some(value) = inner.decode(stored)
            {
                inner.cache.put(keys[i], &value);
                results[i] = Some(value);
            }
        }
        results
    }

    /// Batched delete. Returns how many rows were removed.
    pub fn mdel(&self, keys: &[&[u8]]) -> usize {
        let inner = &*self.inner;
        for key in keys {
            inner.cache.remove(key);
        }

        let mut removed = 0;
        for ((s, b, m), indexes) in group_by_route(&inner.router, keys.iter().copied()) {
            let mut map = inner.shards[s].submap(b, m).write();
            for i in indexes {
                if map.remove(keys[i]).is_some() {
                    removed += 1;
                }
            }
        }
        removed
    }

    /// Warm the cache for a batch of keys.
    pub fn prefetch(&self, keys: &[&[u8]]) {
        let _ = self.mget(keys);
    }

    /// Total number of rows across all shards.
    pub fn len(&self) -> usize {
        self.inner.shards.iter().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot every shard to disk now. No-op without persistence.
    pub fn flush(&self) {
        self.inner.flush_all();
    }

    /// Front cache statistics.
    pub fn cache_stats(&self) -> adaptive_cache::Stats {
        self.inner.cache.stats()
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        self.inner.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.sync.take() {
            let _ = handle.join();
        }
        self.inner.flush_all();
    }
}

/// Group batch positions by their (shard, bucket, sub-map) route. The
/// positions are indexes into the iteration order of `keys`.
fn group_by_route<'a>(
    router: &KeyRouter,
    keys: impl Iterator<Item = &'a [u8]>,
) -> HashMap<(usize, usize, usize), Vec<usize>> {
    let mut groups: HashMap<(usize, usize, usize), Vec<usize>> = HashMap::new();
    for (i, key) in keys.enumerate() {
        groups.entry(router.route(key)).or_default().push(i);
    }
    groups
}

/// Background snapshot thread: sleep, flush, repeat, bail on stop.
fn sync_loop(inner: Arc<Inner>, interval: Duration) {
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
        debug!("periodic snapshot");
        inner.flush_all();
    }
}
