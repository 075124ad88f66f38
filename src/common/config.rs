//! Configuration for kvpipe components
//!
//! Sources, lowest priority first: built-in defaults, an optional TOML file,
//! then `KVPIPE__SECTION__FIELD` environment variables. The binaries apply
//! CLI flags on top.

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file name looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "kvpipe";

/// Environment variable prefix
pub const ENV_PREFIX: &str = "KVPIPE";

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Node ID (unique identifier, used in logs)
    pub node_id: String,

    /// Logging level
    pub log_level: String,

    pub http: HttpConfig,
    pub cache: CacheConfig,
    pub queue: QueueConfig,
    pub store: StoreConfig,
    pub worker: WorkerConfig,
    pub health: HealthConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: "kvpipe-1".to_string(),
            log_level: "info".to_string(),
            http: HttpConfig::default(),
            cache: CacheConfig::default(),
            queue: QueueConfig::default(),
            store: StoreConfig::default(),
            worker: WorkerConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

/// Public HTTP API
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Bind address for HTTP API
    pub bind_addr: SocketAddr,

    /// Maximum accepted request body
    pub max_body_bytes: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            max_body_bytes: 1024 * 1024,
        }
    }
}

/// Cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Capacity before eviction kicks in
    pub max_keys: usize,

    /// TTL applied on repopulation and on apply
    pub ttl_secs: u64,

    /// Per-call timeout
    pub timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_keys: 10_000,
            ttl_secs: 300,
            timeout_ms: 100,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    /// Volatile, for tests and single-process demos
    Memory,
    /// Append-only journal on local disk
    Journal,
}

/// Journal sync policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPolicy {
    /// fsync after every record
    Always,
    /// Flush to the OS after every record
    Interval,
}

/// Queue transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub backend: QueueBackend,

    /// Journal file (journal backend only)
    pub journal_path: PathBuf,

    pub sync: SyncPolicy,

    /// Deliveries per message before it is dead-lettered
    pub max_deliveries: u32,

    /// Base delay before a nacked message is redelivered
    pub redelivery_backoff_ms: u64,

    /// Settled records tolerated in the journal before it is rewritten
    pub compact_threshold: usize,

    /// Per-call timeout for publish
    pub timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackend::Journal,
            journal_path: PathBuf::from("./data/queue.journal"),
            sync: SyncPolicy::Always,
            max_deliveries: 5,
            redelivery_backoff_ms: 500,
            compact_threshold: 10_000,
            timeout_ms: 1_000,
        }
    }
}

impl QueueConfig {
    pub fn redelivery_backoff(&self) -> Duration {
        Duration::from_millis(self.redelivery_backoff_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Rocksdb,
}

/// Durable store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,

    /// RocksDB directory
    pub path: PathBuf,

    /// Per-call timeout
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Rocksdb,
            path: PathBuf::from("./data/store"),
            timeout_ms: 1_000,
        }
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Apply worker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Run the apply worker inside the server process. Both queue backends
    /// are private to the process that opened them, so with this off,
    /// accepted messages wait in the journal until the server restarts with
    /// workers.
    pub enabled: bool,

    /// Consume loops per channel
    pub instances: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            instances: 1,
        }
    }
}

/// Health probing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Timeout for each dependency probe
    pub probe_timeout_ms: u64,

    /// Period of the background prober (0 disables it)
    pub interval_secs: u64,

    /// Value of the Retry-After header on 503
    pub retry_after_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: 500,
            interval_secs: 10,
            retry_after_secs: 5,
        }
    }
}

impl HealthConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl Config {
    /// Load configuration from an optional file and the environment.
    ///
    /// An explicit `path` must exist; without one, `kvpipe.toml` in the
    /// working directory is used when present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let config: Config = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.cache.max_keys == 0 {
            return Err(Error::InvalidConfig("cache.max_keys must be > 0".into()));
        }
        if self.queue.max_deliveries == 0 {
            return Err(Error::InvalidConfig(
                "queue.max_deliveries must be > 0".into(),
            ));
        }
        if !self.worker.enabled && self.queue.backend == QueueBackend::Memory {
            return Err(Error::InvalidConfig(
                "worker.enabled = false needs the journal queue backend".into(),
            ));
        }
        if self.worker.enabled && self.worker.instances == 0 {
            return Err(Error::InvalidConfig(
                "worker.instances must be > 0 when the worker is enabled".into(),
            ));
        }
        for (name, millis) in [
            ("cache.timeout_ms", self.cache.timeout_ms),
            ("queue.timeout_ms", self.queue.timeout_ms),
            ("store.timeout_ms", self.store.timeout_ms),
            ("health.probe_timeout_ms", self.health.probe_timeout_ms),
        ] {
            if millis == 0 {
                return Err(Error::InvalidConfig(format!("{} must be > 0", name)));
            }
        }
        Ok(())
    }
}
