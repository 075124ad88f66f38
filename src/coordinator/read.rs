//! Cache-aside read path
//!
//! 1. Ask the cache. A hit is returned without touching the store.
//! 2. On a miss, a cache error or a cache timeout, ask the store.
//! 3. On a store hit, refill the cache in a detached task; the caller never
//!    waits for it and never sees its failure.
//!
//! Losing the cache costs latency, not availability. A store failure has no
//! further fallback and is returned to the caller as the store being
//! unavailable.

use crate::cache::Cache;
use crate::common::{with_timeout, CacheConfig, Component, Error, Metric, MetricsSink, Result};
use crate::store::DurableStore;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Clone)]
pub struct ReadCoordinator {
    cache: Arc<dyn Cache>,
    store: Arc<dyn DurableStore>,
    metrics: Arc<dyn MetricsSink>,
    cache_ttl: Duration,
    cache_timeout: Duration,
    store_timeout: Duration,
}

impl ReadCoordinator {
    pub fn new(
        cache: Arc<dyn Cache>,
        store: Arc<dyn DurableStore>,
        metrics: Arc<dyn MetricsSink>,
        cache_config: &CacheConfig,
        store_timeout: Duration,
    ) -> Self {
        Self {
            cache,
            store,
            metrics,
            cache_ttl: cache_config.ttl(),
            cache_timeout: cache_config.timeout(),
            store_timeout,
        }
    }

    /// Current visible value of `key`, or [`Error::NotFound`]
    pub async fn read(&self, key: &str) -> Result<String> {
        match with_timeout(Component::Cache, self.cache_timeout, self.cache.get(key)).await {
            Ok(Some(value)) => {
                self.metrics.incr(Metric::CacheHit);
                return Ok(value);
            }
            Ok(None) => self.metrics.incr(Metric::CacheMiss),
            Err(e) => {
                self.metrics.incr(Metric::CacheError);
                self.metrics.incr(Metric::CacheMiss);
                tracing::debug!(key = %key, error = %e, "Cache unavailable, reading from store");
            }
        }

        let start = Instant::now();
        let stored = with_timeout(Component::Store, self.store_timeout, self.store.get(key)).await;
        self.metrics.observe("store_get", start.elapsed());

        let value = match stored {
            Ok(Some(value)) => value,
            Ok(None) => return Err(Error::NotFound(key.to_string())),
            Err(e) => {
                self.metrics.incr(Metric::StoreError);
                tracing::warn!(key = %key, error = %e, "Store read failed");
                return Err(match e {
                    e @ (Error::DependencyUnavailable { .. } | Error::DependencyTimeout { .. }) => e,
                    other => Error::unavailable(Component::Store, other),
                });
            }
        };
        self.metrics.incr(Metric::StoreRead);

        self.repopulate(key, &value);
        Ok(value)
    }

    /// Fire-and-forget cache fill
    fn repopulate(&self, key: &str, value: &str) {
        let cache = self.cache.clone();
        let metrics = self.metrics.clone();
        let (key, value) = (key.to_string(), value.to_string());
        let (ttl, timeout) = (self.cache_ttl, self.cache_timeout);

        tokio::spawn(async move {
            let result =
                with_timeout(Component::Cache, timeout, cache.set(&key, &value, Some(ttl))).await;
            if let Err(e) = result {
                metrics.incr(Metric::CacheRepopulateFailed);
                tracing::debug!(key = %key, error = %e, "Cache repopulation failed");
            }
        });
    }
}
