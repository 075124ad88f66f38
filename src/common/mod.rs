//! Common utilities and types shared across kvpipe

pub mod config;
pub mod error;
pub mod metrics;
pub mod tracing_middleware;
pub mod utils;

pub use config::{
    CacheConfig, Config, HealthConfig, HttpConfig, QueueBackend, QueueConfig, StoreBackend,
    StoreConfig, SyncPolicy, WorkerConfig,
};
pub use error::{Component, Error, Result};
pub use metrics::{Metric, MetricsRegistry, MetricsSink, NoopMetrics};
pub use utils::{backoff_with_jitter, crc32, validate_key, with_timeout};
