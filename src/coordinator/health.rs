//! Liveness and readiness aggregation
//!
//! Readiness probes the three dependencies concurrently, each under its own
//! timeout. Losing the cache only degrades the service; losing the queue or
//! the store makes it unhealthy.

use crate::cache::Cache;
use crate::common::{with_timeout, Component, Result};
use crate::queue::QueueTransport;
use crate::store::DurableStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl OverallStatus {
    /// Whether traffic should be routed here
    pub fn is_ready(&self) -> bool {
        !matches!(self, OverallStatus::Unhealthy)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OverallStatus::Healthy => "healthy",
            OverallStatus::Degraded => "degraded",
            OverallStatus::Unhealthy => "unhealthy",
        }
    }
}

/// Probe result for one dependency
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentHealth {
    pub component: Component,
    pub healthy: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub status: OverallStatus,
    pub components: Vec<ComponentHealth>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn component(&self, component: Component) -> Option<&ComponentHealth> {
        self.components.iter().find(|c| c.component == component)
    }
}

/// Derive the overall verdict from per-component results
pub fn aggregate(components: &[ComponentHealth]) -> OverallStatus {
    let mut status = OverallStatus::Healthy;
    for c in components.iter().filter(|c| !c.healthy) {
        match c.component {
            Component::Cache => status = OverallStatus::Degraded,
            Component::Queue | Component::Store => return OverallStatus::Unhealthy,
        }
    }
    status
}

pub struct HealthAggregator {
    cache: Arc<dyn Cache>,
    queue: Arc<dyn QueueTransport>,
    store: Arc<dyn DurableStore>,
    probe_timeout: Duration,
    last: RwLock<Option<HealthReport>>,
}

impl HealthAggregator {
    pub fn new(
        cache: Arc<dyn Cache>,
        queue: Arc<dyn QueueTransport>,
        store: Arc<dyn DurableStore>,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            cache,
            queue,
            store,
            probe_timeout,
            last: RwLock::new(None),
        }
    }

    /// The process is up and able to answer; no dependency is consulted.
    pub fn liveness(&self) -> bool {
        true
    }

    /// Probe every dependency and record the result as the latest snapshot
    pub async fn readiness(&self) -> HealthReport {
        let (cache, queue, store) = tokio::join!(
            self.probe(Component::Cache, self.cache.ping()),
            self.probe(Component::Queue, self.queue.ping()),
            self.probe(Component::Store, self.store.probe()),
        );
        let components = vec![cache, queue, store];
        let report = HealthReport {
            status: aggregate(&components),
            components,
            checked_at: Utc::now(),
        };

        if let Ok(mut last) = self.last.write() {
            *last = Some(report.clone());
        }
        report
    }

    /// Most recent snapshot, from either an on-demand probe or the prober
    pub fn last(&self) -> Option<HealthReport> {
        self.last.read().ok().and_then(|last| last.clone())
    }

    async fn probe<F>(&self, component: Component, fut: F) -> ComponentHealth
    where
        F: Future<Output = Result<()>>,
    {
        let start = Instant::now();
        let result = with_timeout(component, self.probe_timeout, fut).await;
        ComponentHealth {
            component,
            healthy: result.is_ok(),
            latency_ms: start.elapsed().as_millis() as u64,
            error: result.err().map(|e| e.to_string()),
        }
    }

    /// Re-probe every `interval` until `shutdown` flips to true, logging
    /// verdict transitions.
    pub fn spawn_periodic(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let health = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut previous: Option<OverallStatus> = None;

            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {}
                }
                if *shutdown.borrow() {
                    break;
                }

                let report = health.readiness().await;
                if previous != Some(report.status) {
                    let failing: Vec<String> = report
                        .components
                        .iter()
                        .filter(|c| !c.healthy)
                        .map(|c| c.component.to_string())
                        .collect();
                    match report.status {
                        OverallStatus::Healthy => tracing::info!("Dependencies healthy"),
                        status => tracing::warn!(
                            status = status.as_str(),
                            failing = ?failing,
                            "Dependency health changed"
                        ),
                    }
                    previous = Some(report.status);
                }
            }
            tracing::debug!("Health prober stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::queue::{LocalQueue, QueuePolicy};
    use crate::store::MemoryStore;

    struct Fixture {
        health: Arc<HealthAggregator>,
        cache: Arc<MemoryCache>,
        queue: Arc<LocalQueue>,
        store: Arc<MemoryStore>,
    }

    fn fixture() -> Fixture {
        let cache = Arc::new(MemoryCache::new(10));
        let queue = Arc::new(LocalQueue::in_memory(QueuePolicy::default()));
        let store = Arc::new(MemoryStore::new());
        let health = Arc::new(HealthAggregator::new(
            cache.clone(),
            queue.clone(),
            store.clone(),
            Duration::from_millis(200),
        ));
        Fixture {
            health,
            cache,
            queue,
            store,
        }
    }

    #[tokio::test]
    async fn test_all_up_is_healthy() {
        let f = fixture();
        let report = f.health.readiness().await;

        assert_eq!(report.status, OverallStatus::Healthy);
        assert_eq!(report.components.len(), 3);
        assert!(report.components.iter().all(|c| c.healthy));
        // the probe key does not linger
        assert!(f.store.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_readiness_keeps_caller_entries() {
        let f = fixture();
        f.store.upsert("_probe", "user-data").await.unwrap();

        assert_eq!(f.health.readiness().await.status, OverallStatus::Healthy);
        assert_eq!(
            f.store.get("_probe").await.unwrap().as_deref(),
            Some("user-data")
        );
    }

    #[tokio::test]
    async fn test_cache_down_is_degraded() {
        let f = fixture();
        f.cache.set_available(false);

        let report = f.health.readiness().await;
        assert_eq!(report.status, OverallStatus::Degraded);
        assert!(report.status.is_ready());
        let cache = report.component(Component::Cache).unwrap();
        assert!(!cache.healthy);
        assert!(cache.error.is_some());
    }

    #[tokio::test]
    async fn test_store_or_queue_down_is_unhealthy() {
        let f = fixture();
        f.store.set_available(false);
        assert_eq!(f.health.readiness().await.status, OverallStatus::Unhealthy);

        f.store.set_available(true);
        f.queue.set_available(false);
        let report = f.health.readiness().await;
        assert_eq!(report.status, OverallStatus::Unhealthy);
        assert!(!report.status.is_ready());
    }

    #[test]
    fn test_aggregate() {
        let entry = |component, healthy| ComponentHealth {
            component,
            healthy,
            latency_ms: 0,
            error: None,
        };
        assert_eq!(aggregate(&[]), OverallStatus::Healthy);
        assert_eq!(
            aggregate(&[entry(Component::Cache, false), entry(Component::Store, true)]),
            OverallStatus::Degraded
        );
        assert_eq!(
            aggregate(&[entry(Component::Cache, false), entry(Component::Queue, false)]),
            OverallStatus::Unhealthy
        );
    }

    #[tokio::test]
    async fn test_periodic_prober_updates_snapshot() {
        let f = fixture();
        assert!(f.health.liveness());
        assert!(f.health.last().is_none());

        let (tx, rx) = watch::channel(false);
        let handle = f.health.spawn_periodic(Duration::from_millis(10), rx);

        for _ in 0..100 {
            if f.health.last().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(f.health.last().unwrap().status, OverallStatus::Healthy);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
