//! INI configuration.
//!
//! The config file uses `[section]` headers and `key = value` lines;
//! `#` and `;` start comments. Unknown sections and keys are ignored,
//! missing keys take the documented defaults, and a value that fails to
//! parse is a startup error.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use adaptive_cache::{CacheOptions, PolicyKind};
use datastore::{PersistOptions, StoreOptions};
use thiserror::Error;

/// Rough per-entry footprint used to turn `cache_size_mb` into an
/// entry-count capacity.
const APPROX_ENTRY_BYTES: usize = 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

/// `[server]` section.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub max_connections: usize,
    /// Initial size of per-connection buffers.
    pub buffer_size: usize,
    /// Accepted connections per acceptor wakeup.
    pub accept_batch: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 6379,
            host: "127.0.0.1".to_string(),
            max_connections: 10_000,
            buffer_size: 8192,
            accept_batch: 64,
        }
    }
}

/// `[threading]` section.
#[derive(Debug, Clone)]
pub struct ThreadingConfig {
    /// Worker reactor threads; 0 means one per hardware thread.
    pub worker_threads: usize,
    /// Acceptor threads.
    pub io_threads: usize,
    /// Store shards.
    pub shard_count: usize,
    pub buckets_per_shard: usize,
    pub submaps_per_bucket: usize,
    /// Pin workers round-robin to CPUs.
    pub pin_workers: bool,
}

impl Default for ThreadingConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            io_threads: 1,
            shard_count: 16,
            buckets_per_shard: 8,
            submaps_per_bucket: 8,
            pin_workers: false,
        }
    }
}

/// `[storage]` section.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub cache_size_mb: usize,
    pub enable_persistence: bool,
    pub sync_interval_sec: u64,
    pub persist_path: PathBuf,
    pub enable_compression: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            cache_size_mb: 64,
            enable_persistence: true,
            sync_interval_sec: 60,
            persist_path: PathBuf::from("./data"),
            enable_compression: false,
        }
    }
}

/// `[cache]` section.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub cache_shards: usize,
    pub policy: PolicyKind,
    pub adaptive_sizing: bool,
    pub min_capacity: usize,
    pub max_capacity: usize,
    pub adjustment_interval_sec: u64,
    pub cleanup_threshold: f64,
    pub cleanup_target: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_shards: 16,
            policy: PolicyKind::Lru,
            adaptive_sizing: true,
            min_capacity: 1024,
            max_capacity: 10_000_000,
            adjustment_interval_sec: 300,
            cleanup_threshold: 0.9,
            cleanup_target: 0.7,
        }
    }
}

impl CacheConfig {
    /// Policy name for startup logs.
    pub fn policy_name(&self) -> &'static str {
        match self.policy {
            PolicyKind::Lru => "lru",
            PolicyKind::Lfu => "lfu",
            PolicyKind::Fifo => "fifo",
            PolicyKind::Tlru => "tlru",
        }
    }
}

/// `[logging]` section.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Complete server configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub server: ServerConfig,
    pub threading: ThreadingConfig,
    pub storage: StorageConfig,
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Parse config text.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let doc = IniDoc::parse(text);
        let mut config = Config::default();

        {
            let s = &mut config.server;
            s.port = doc.field("server", "port", s.port)?;
            if let Some(host) = doc.get("server", "host") {
                s.host = host.to_string();
            }
            s.max_connections = doc.field("server", "max_connections", s.max_connections)?;
            s.buffer_size = doc.field("server", "buffer_size", s.buffer_size)?;
            s.accept_batch = doc.field("server", "accept_batch", s.accept_batch)?;
        }

        {
            let t = &mut config.threading;
            t.worker_threads = doc.field("threading", "worker_threads", t.worker_threads)?;
            t.io_threads = doc.field("threading", "io_threads", t.io_threads)?;
            t.shard_count = doc.field("threading", "shard_count", t.shard_count)?;
            t.buckets_per_shard =
                doc.field("threading", "buckets_per_shard", t.buckets_per_shard)?;
            t.submaps_per_bucket =
                doc.field("threading", "submaps_per_bucket", t.submaps_per_bucket)?;
            t.pin_workers = doc.bool_field("threading", "pin_workers", t.pin_workers)?;
        }

        {
            let st = &mut config.storage;
            st.cache_size_mb = doc.field("storage", "cache_size_mb", st.cache_size_mb)?;
            st.enable_persistence =
                doc.bool_field("storage", "enable_persistence", st.enable_persistence)?;
            st.sync_interval_sec =
                doc.field("storage", "sync_interval_sec", st.sync_interval_sec)?;
            if let Some(path) = doc.get("storage", "persist_path") {
                st.persist_path = PathBuf::from(path);
            }
            st.enable_compression =
                doc.bool_field("storage", "enable_compression", st.enable_compression)?;
        }

        {
            let c = &mut config.cache;
            c.cache_shards = doc.field("cache", "cache_shards", c.cache_shards)?;
            if let Some(policy) = doc.get("cache", "policy") {
                c.policy = policy
                    .parse::<PolicyKind>()
                    .map_err(|reason| ConfigError::Invalid {
                        key: "cache.policy".to_string(),
                        value: policy.to_string(),
                        reason,
                    })?;
            }
            c.adaptive_sizing = doc.bool_field("cache", "adaptive_sizing", c.adaptive_sizing)?;
            c.min_capacity = doc.field("cache", "min_capacity", c.min_capacity)?;
            c.max_capacity = doc.field("cache", "max_capacity", c.max_capacity)?;
            c.adjustment_interval_sec =
                doc.field("cache", "adjustment_interval_sec", c.adjustment_interval_sec)?;
            c.cleanup_threshold = doc.field("cache", "cleanup_threshold", c.cleanup_threshold)?;
            c.cleanup_target = doc.field("cache", "cleanup_target", c.cleanup_target)?;
        }

        if let Some(level) = doc.get("logging", "level") {
            config.logging.level = level.to_string();
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &str, value: String, reason: &str| ConfigError::Invalid {
            key: key.to_string(),
            value,
            reason: reason.to_string(),
        };

        if self.server.max_connections == 0 {
            return Err(invalid(
                "server.max_connections",
                "0".into(),
                "must be at least 1",
            ));
        }
        if self.threading.io_threads == 0 {
            return Err(invalid("threading.io_threads", "0".into(), "must be at least 1"));
        }
        for (key, value) in [
            ("threading.shard_count", self.threading.shard_count),
            ("threading.buckets_per_shard", self.threading.buckets_per_shard),
            ("threading.submaps_per_bucket", self.threading.submaps_per_bucket),
            ("cache.cache_shards", self.cache.cache_shards),
        ] {
            if value == 0 {
                return Err(invalid(key, "0".into(), "must be at least 1"));
            }
        }
        if self.cache.min_capacity > self.cache.max_capacity {
            return Err(invalid(
                "cache.min_capacity",
                self.cache.min_capacity.to_string(),
                "must not exceed cache.max_capacity",
            ));
        }
        for (key, value) in [
            ("cache.cleanup_threshold", self.cache.cleanup_threshold),
            ("cache.cleanup_target", self.cache.cleanup_target),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(invalid(key, value.to_string(), "must be in (0, 1]"));
            }
        }
        if self.cache.cleanup_target > self.cache.cleanup_threshold {
            return Err(invalid(
                "cache.cleanup_target",
                self.cache.cleanup_target.to_string(),
                "must not exceed cache.cleanup_threshold",
            ));
        }
        Ok(())
    }

    /// Resolved worker thread count.
    pub fn worker_threads(&self) -> usize {
        if self.threading.worker_threads > 0 {
            self.threading.worker_threads
        } else {
            num_cpus::get()
        }
    }

    /// `host:port` to bind.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Store construction options derived from this config.
    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            shard_count: self.threading.shard_count,
            buckets_per_shard: self.threading.buckets_per_shard,
            submaps_per_bucket: self.threading.submaps_per_bucket,
            enable_compression: self.storage.enable_compression,
            persistence: self.storage.enable_persistence.then(|| PersistOptions {
                path: self.storage.persist_path.clone(),
                sync_interval: Duration::from_secs(self.storage.sync_interval_sec),
            }),
        }
    }

    /// Cache construction options derived from this config.
    pub fn cache_options(&self) -> CacheOptions {
        let budget_entries = self.storage.cache_size_mb * (1024 * 1024) / APPROX_ENTRY_BYTES;
        CacheOptions {
            shard_count: self.cache.cache_shards,
            initial_capacity: budget_entries
                .clamp(self.cache.min_capacity, self.cache.max_capacity),
            min_capacity: self.cache.min_capacity,
            max_capacity: self.cache.max_capacity,
            policy: self.cache.policy,
            adaptive_sizing: self.cache.adaptive_sizing,
            adjustment_interval: Duration::from_secs(self.cache.adjustment_interval_sec),
            cleanup_threshold: self.cache.cleanup_threshold,
            cleanup_target: self.cache.cleanup_target,
        }
    }
}

/// Flat view of an INI document: `section.key` → raw value.
struct IniDoc {
    values: HashMap<String, String>,
}

impl IniDoc {
    fn parse(text: &str) -> Self {
        let mut values = HashMap::new();
        let mut section = String::new();

        for raw_line in text.lines() {
            let line = match raw_line.find(['#', ';']) {
                Some(i) => &raw_line[..i],
                None => raw_line,
            }
            .trim();
            if line.is_empty() {
                continue;
            }

            if line.starts_with('[') && line.ends_with(']') {
                section = line[1..line.len() - 1].trim().to_ascii_lowercase();
            } else if let Some((key, value)) = line.split_once('=') {
                let key = key.trim().to_ascii_lowercase();
                if !key.is_empty() {
                    values.insert(format!("{section}.{key}"), value.trim().to_string());
                }
            }
            // Anything else is noise; skip it.
        }

        Self { values }
    }

    fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.values.get(&format!("{section}.{key}")).map(|s| s.as_str())
    }

    /// Typed lookup falling back to `default` when absent.
    fn field<T>(&self, section: &str, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(section, key) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
                key: format!("{section}.{key}"),
                value: raw.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    fn bool_field(&self, section: &str, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.get(section, key) {
            None => Ok(default),
            Some(raw) => match raw.to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => Ok(true),
                "false" | "no" | "off" | "0" => Ok(false),
                _ => Err(ConfigError::Invalid {
                    key: format!("{section}.{key}"),
                    value: raw.to_string(),
                    reason: "expected a boolean".to_string(),
                }),
            },
        }
    }
}
