//! Process wiring
//!
//! Builds the dependency handles from configuration once at startup and
//! hands them to the API, the apply worker and the health prober.

use crate::cache::{Cache, MemoryCache};
use crate::common::{Config, MetricsRegistry, QueueBackend, Result, StoreBackend};
use crate::coordinator::health::HealthAggregator;
use crate::coordinator::http::{create_router, AppState};
use crate::coordinator::read::ReadCoordinator;
use crate::coordinator::write::WriteCoordinator;
use crate::queue::{LocalQueue, QueuePolicy, QueueTransport};
use crate::store::{DurableStore, MemoryStore, RocksStore};
use crate::worker::{ApplySettings, ApplyWorker};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Dependency handles shared by every component
#[derive(Clone)]
pub struct Pipeline {
    pub cache: Arc<dyn Cache>,
    pub queue: Arc<dyn QueueTransport>,
    pub store: Arc<dyn DurableStore>,
    pub metrics: Arc<MetricsRegistry>,
}

impl Pipeline {
    /// Open the backends selected in `config`
    pub fn open(config: &Config) -> Result<Self> {
        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new(config.cache.max_keys));

        let policy = QueuePolicy::from(&config.queue);
        let queue: Arc<dyn QueueTransport> = match config.queue.backend {
            QueueBackend::Memory => Arc::new(LocalQueue::in_memory(policy)),
            QueueBackend::Journal => Arc::new(LocalQueue::open(
                &config.queue.journal_path,
                config.queue.sync,
                policy,
            )?),
        };

        let store: Arc<dyn DurableStore> = match config.store.backend {
            StoreBackend::Memory => Arc::new(MemoryStore::new()),
            StoreBackend::Rocksdb => Arc::new(RocksStore::open(&config.store.path)?),
        };

        Ok(Self::from_parts(cache, queue, store))
    }

    pub fn from_parts(
        cache: Arc<dyn Cache>,
        queue: Arc<dyn QueueTransport>,
        store: Arc<dyn DurableStore>,
    ) -> Self {
        Self {
            cache,
            queue,
            store,
            metrics: Arc::new(MetricsRegistry::new()),
        }
    }

    pub fn reader(&self, config: &Config) -> ReadCoordinator {
        ReadCoordinator::new(
            self.cache.clone(),
            self.store.clone(),
            self.metrics.clone(),
            &config.cache,
            config.store.timeout(),
        )
    }

    pub fn writer(&self, config: &Config) -> WriteCoordinator {
        WriteCoordinator::new(
            self.queue.clone(),
            self.cache.clone(),
            self.metrics.clone(),
            config.queue.timeout(),
            config.cache.timeout(),
        )
    }

    pub fn health(&self, config: &Config) -> HealthAggregator {
        HealthAggregator::new(
            self.cache.clone(),
            self.queue.clone(),
            self.store.clone(),
            config.health.probe_timeout(),
        )
    }

    pub fn worker(&self, config: &Config) -> ApplyWorker {
        ApplyWorker::new(
            self.store.clone(),
            self.cache.clone(),
            self.queue.clone(),
            self.metrics.clone(),
            ApplySettings::new(&config.cache, &config.store),
        )
    }

    /// Handler state for the HTTP API
    pub fn app_state(&self, config: &Config, health: Arc<HealthAggregator>) -> AppState {
        AppState {
            reader: self.reader(config),
            writer: self.writer(config),
            health,
            cache: self.cache.clone(),
            queue: self.queue.clone(),
            metrics: self.metrics.clone(),
            retry_after_secs: config.health.retry_after_secs,
            max_body_bytes: config.http.max_body_bytes,
        }
    }
}

pub struct Server {
    config: Config,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Serve until Ctrl-C
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutdown requested");
        })
        .await
    }

    /// Serve until `signal` resolves, then stop the API, the prober and the
    /// worker loops. Workers finish the message they hold before exiting.
    pub async fn serve_with_shutdown<S>(self, signal: S) -> Result<()>
    where
        S: Future<Output = ()> + Send + 'static,
    {
        let config = self.config;
        config.validate()?;

        tracing::info!("Starting kvpipe: {}", config.node_id);
        tracing::info!("  HTTP API: {}", config.http.bind_addr);
        tracing::info!("  Queue: {:?}", config.queue.backend);
        tracing::info!("  Store: {:?}", config.store.backend);
        tracing::info!(
            "  Workers: {}",
            if config.worker.enabled {
                config.worker.instances
            } else {
                0
            }
        );

        let pipeline = Pipeline::open(&config)?;
        let health = Arc::new(pipeline.health(&config));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut tasks = Vec::new();
        if config.worker.enabled {
            let worker = Arc::new(pipeline.worker(&config));
            tasks.extend(worker.spawn(config.worker.instances, shutdown_rx.clone()));
        } else {
            tracing::warn!(
                journal = %config.queue.journal_path.display(),
                "Apply worker disabled; accepted writes are held until a restart with workers"
            );
        }
        if config.health.interval_secs > 0 {
            tasks.push(health.spawn_periodic(
                Duration::from_secs(config.health.interval_secs),
                shutdown_rx.clone(),
            ));
        }

        let router = create_router(pipeline.app_state(&config, health));
        let listener = tokio::net::TcpListener::bind(config.http.bind_addr).await?;
        tracing::info!("✓ kvpipe ready on {}", config.http.bind_addr);

        let result = axum::serve(listener, router)
            .with_graceful_shutdown(signal)
            .await;

        let _ = shutdown_tx.send(true);
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("Background task ended abnormally: {}", e);
            }
        }
        tracing::info!("kvpipe stopped");

        result.map_err(Into::into)
    }
}
