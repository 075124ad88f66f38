//! Apply worker: queue → durable store → cache
//!
//! Each delivery goes `Received → Applying → Acked` on success. A failed
//! store mutation is nacked and the transport either redelivers it later or
//! dead-letters it once its retry budget is spent. Undecodable bodies are
//! acked and dropped so they cannot stall the channel.
//!
//! The ack is the commit point and only follows a successful store
//! mutation. The cache refresh comes after the ack and its failure is only
//! counted; readers fall back to the store.
//!
//! Upsert-by-key and delete-by-key are idempotent, so redelivered messages
//! and concurrent workers need no coordination. Deletes and writes for the
//! same key travel on different channels, so whichever store mutation
//! commits last wins, even if the client sent them in the other order.

use crate::cache::Cache;
use crate::common::{
    with_timeout, CacheConfig, Component, Metric, MetricsSink, Result, StoreConfig,
};
use crate::queue::{
    Channel, Delivery, NackOutcome, QueueMessage, QueueTransport, QUEUE_DEPTH_GAUGE,
};
use crate::store::DurableStore;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// How a delivery was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Store mutated and message acked
    Acked,
    /// Body could not be decoded; acked without touching the store
    PoisonDropped,
    /// Store mutation failed; the transport will redeliver
    Redelivered,
    /// Store mutation failed and the retry budget is spent
    DeadLettered,
    /// The transport refused the ack/nack; the message stays in flight
    Unsettled,
}

/// Timeouts and TTL used by the worker
#[derive(Debug, Clone, Copy)]
pub struct ApplySettings {
    pub cache_ttl: Duration,
    pub cache_timeout: Duration,
    pub store_timeout: Duration,
    /// Pause after the transport fails to hand out a message
    pub consume_retry: Duration,
}

impl ApplySettings {
    pub fn new(cache: &CacheConfig, store: &StoreConfig) -> Self {
        Self {
            cache_ttl: cache.ttl(),
            cache_timeout: cache.timeout(),
            store_timeout: store.timeout(),
            consume_retry: Duration::from_secs(1),
        }
    }
}

impl Default for ApplySettings {
    fn default() -> Self {
        Self::new(&CacheConfig::default(), &StoreConfig::default())
    }
}

pub struct ApplyWorker {
    store: Arc<dyn DurableStore>,
    cache: Arc<dyn Cache>,
    queue: Arc<dyn QueueTransport>,
    metrics: Arc<dyn MetricsSink>,
    settings: ApplySettings,
}

impl ApplyWorker {
    pub fn new(
        store: Arc<dyn DurableStore>,
        cache: Arc<dyn Cache>,
        queue: Arc<dyn QueueTransport>,
        metrics: Arc<dyn MetricsSink>,
        settings: ApplySettings,
    ) -> Self {
        Self {
            store,
            cache,
            queue,
            metrics,
            settings,
        }
    }

    /// Wait for one delivery on `channel` and settle it
    pub async fn process_next(&self, channel: Channel) -> Result<ApplyOutcome> {
        let delivery = self.queue.consume(channel).await?;
        let outcome = self.handle(delivery).await;
        self.report_depth(channel).await;
        Ok(outcome)
    }

    /// Apply a single delivery
    pub async fn handle(&self, delivery: Delivery) -> ApplyOutcome {
        let message = match QueueMessage::decode(delivery.channel, &delivery.body) {
            Ok(message) => message,
            Err(e) => {
                self.metrics.incr(Metric::PoisonMessage);
                tracing::error!(
                    channel = %delivery.channel,
                    tag = delivery.tag,
                    error = %e,
                    "Dropping undecodable message"
                );
                return match self.queue.ack(&delivery).await {
                    Ok(()) => ApplyOutcome::PoisonDropped,
                    Err(e) => self.unsettled(&delivery, e),
                };
            }
        };

        tracing::debug!(
            channel = %delivery.channel,
            tag = delivery.tag,
            attempt = delivery.attempt,
            key = %message.key(),
            "Applying message"
        );

        if let Err(e) = self.apply_to_store(&message).await {
            self.metrics.incr(Metric::StoreError);
            tracing::warn!(
                channel = %delivery.channel,
                key = %message.key(),
                attempt = delivery.attempt,
                error = %e,
                "Store mutation failed, handing message back"
            );
            return match self.queue.nack(&delivery).await {
                Ok(NackOutcome::Requeued { delay }) => {
                    self.metrics.incr(Metric::MessageRedelivered);
                    tracing::debug!(key = %message.key(), delay_ms = delay.as_millis() as u64, "Redelivery scheduled");
                    ApplyOutcome::Redelivered
                }
                Ok(NackOutcome::DeadLettered) => {
                    tracing::error!(
                        channel = %delivery.channel,
                        key = %message.key(),
                        attempts = delivery.attempt,
                        "Message dead-lettered"
                    );
                    ApplyOutcome::DeadLettered
                }
                Err(e) => self.unsettled(&delivery, e),
            };
        }

        // commit point
        let outcome = match self.queue.ack(&delivery).await {
            Ok(()) => {
                self.metrics.incr(Metric::MessageApplied);
                ApplyOutcome::Acked
            }
            Err(e) => self.unsettled(&delivery, e),
        };

        // the store holds the new state either way, so resync regardless
        self.refresh_cache(&message).await;
        outcome
    }

    async fn apply_to_store(&self, message: &QueueMessage) -> Result<()> {
        let start = Instant::now();
        let (operation, result) = match message {
            QueueMessage::Write { key, value } => (
                "store_upsert",
                with_timeout(
                    Component::Store,
                    self.settings.store_timeout,
                    self.store.upsert(key, value),
                )
                .await,
            ),
            QueueMessage::Delete { key } => (
                "store_delete",
                with_timeout(
                    Component::Store,
                    self.settings.store_timeout,
                    self.store.delete(key),
                )
                .await,
            ),
        };
        self.metrics.observe(operation, start.elapsed());
        result
    }

    async fn refresh_cache(&self, message: &QueueMessage) {
        let result = match message {
            QueueMessage::Write { key, value } => {
                with_timeout(
                    Component::Cache,
                    self.settings.cache_timeout,
                    self.cache.set(key, value, Some(self.settings.cache_ttl)),
                )
                .await
            }
            QueueMessage::Delete { key } => {
                with_timeout(
                    Component::Cache,
                    self.settings.cache_timeout,
                    self.cache.delete(key),
                )
                .await
            }
        };
        if let Err(e) = result {
            self.metrics.incr(Metric::CacheRefreshFailed);
            tracing::warn!(key = %message.key(), error = %e, "Cache resync after apply failed");
        }
    }

    fn unsettled(&self, delivery: &Delivery, error: crate::Error) -> ApplyOutcome {
        tracing::warn!(
            channel = %delivery.channel,
            tag = delivery.tag,
            error = %error,
            "Could not settle delivery; it stays in flight"
        );
        ApplyOutcome::Unsettled
    }

    async fn report_depth(&self, channel: Channel) {
        if let Ok(depth) = self.queue.depth(channel).await {
            self.metrics
                .set_gauge(QUEUE_DEPTH_GAUGE, channel.as_str(), depth.pending() as u64);
        }
    }

    /// Consume `channel` until `shutdown` flips to true
    pub async fn run(
        self: Arc<Self>,
        channel: Channel,
        instance: usize,
        mut shutdown: watch::Receiver<bool>,
    ) {
        tracing::info!(channel = %channel, instance, "Apply worker started");

        while !*shutdown.borrow() {
            let next = tokio::select! {
                _ = shutdown.changed() => break,
                next = self.queue.consume(channel) => next,
            };

            match next {
                Ok(delivery) => {
                    self.handle(delivery).await;
                    self.report_depth(channel).await;
                }
                Err(e) => {
                    tracing::warn!(channel = %channel, error = %e, "Consume failed, retrying");
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(self.settings.consume_retry) => {}
                    }
                }
            }
        }

        tracing::info!(channel = %channel, instance, "Apply worker stopped");
    }

    /// Start `instances` consume loops on each channel
    pub fn spawn(
        self: &Arc<Self>,
        instances: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(instances * Channel::ALL.len());
        for channel in Channel::ALL {
            for instance in 0..instances {
                handles.push(tokio::spawn(self.clone().run(
                    channel,
                    instance,
                    shutdown.clone(),
                )));
            }
        }
        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::common::MetricsRegistry;
    use crate::queue::{LocalQueue, QueuePolicy};
    use crate::store::MemoryStore;

    struct Fixture {
        store: Arc<MemoryStore>,
        cache: Arc<MemoryCache>,
        queue: Arc<LocalQueue>,
        metrics: Arc<MetricsRegistry>,
        worker: Arc<ApplyWorker>,
    }

    fn fixture(max_deliveries: u32) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(MemoryCache::new(100));
        let queue = Arc::new(LocalQueue::in_memory(QueuePolicy {
            max_deliveries,
            redelivery_backoff: Duration::from_millis(5),
            compact_threshold: 1_000,
        }));
        let metrics = Arc::new(MetricsRegistry::new());
        let worker = Arc::new(ApplyWorker::new(
            store.clone(),
            cache.clone(),
            queue.clone(),
            metrics.clone(),
            ApplySettings {
                cache_ttl: Duration::from_secs(60),
                cache_timeout: Duration::from_millis(100),
                store_timeout: Duration::from_millis(100),
                consume_retry: Duration::from_millis(10),
            },
        ));
        Fixture {
            store,
            cache,
            queue,
            metrics,
            worker,
        }
    }

    async fn publish(queue: &LocalQueue, message: QueueMessage) {
        queue
            .publish(message.channel(), message.encode().unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_write_applies_and_refreshes_cache() {
        let f = fixture(3);
        publish(
            &f.queue,
            QueueMessage::Write {
                key: "a".into(),
                value: "1".into(),
            },
        )
        .await;

        let outcome = f.worker.process_next(Channel::Writes).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Acked);
        assert_eq!(f.store.get("a").await.unwrap().as_deref(), Some("1"));
        assert_eq!(f.cache.get("a").await.unwrap().as_deref(), Some("1"));
        assert_eq!(f.metrics.get(Metric::MessageApplied), 1);
        assert_eq!(f.queue.depth(Channel::Writes).await.unwrap().pending(), 0);
        assert_eq!(f.metrics.gauge(QUEUE_DEPTH_GAUGE, "writes"), Some(0));
    }

    #[tokio::test]
    async fn test_delete_applies_and_evicts() {
        let f = fixture(3);
        f.store.upsert("a", "1").await.unwrap();
        f.cache.set("a", "1", None).await.unwrap();
        publish(&f.queue, QueueMessage::Delete { key: "a".into() }).await;

        let outcome = f.worker.process_next(Channel::Deletes).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Acked);
        assert_eq!(f.store.get("a").await.unwrap(), None);
        assert_eq!(f.cache.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_poison_message_is_acked_and_counted() {
        let f = fixture(3);
        f.queue
            .publish(Channel::Writes, b"{not json".to_vec())
            .await
            .unwrap();
        publish(
            &f.queue,
            QueueMessage::Write {
                key: "after".into(),
                value: "ok".into(),
            },
        )
        .await;

        assert_eq!(
            f.worker.process_next(Channel::Writes).await.unwrap(),
            ApplyOutcome::PoisonDropped
        );
        assert_eq!(f.metrics.get(Metric::PoisonMessage), 1);
        // the channel keeps flowing
        assert_eq!(
            f.worker.process_next(Channel::Writes).await.unwrap(),
            ApplyOutcome::Acked
        );
        assert_eq!(f.store.get("after").await.unwrap().as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn test_store_failure_is_not_acked() {
        let f = fixture(2);
        publish(
            &f.queue,
            QueueMessage::Write {
                key: "k".into(),
                value: "v".into(),
            },
        )
        .await;
        f.store.set_available(false);

        assert_eq!(
            f.worker.process_next(Channel::Writes).await.unwrap(),
            ApplyOutcome::Redelivered
        );
        assert_eq!(f.metrics.get(Metric::MessageRedelivered), 1);
        assert_eq!(f.queue.depth(Channel::Writes).await.unwrap().delayed, 1);
        // nothing leaked into the cache
        assert_eq!(f.cache.get("k").await.unwrap(), None);

        f.store.set_available(true);
        assert_eq!(
            f.worker.process_next(Channel::Writes).await.unwrap(),
            ApplyOutcome::Acked
        );
        assert_eq!(f.store.get("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_retry_budget_dead_letters() {
        let f = fixture(2);
        publish(&f.queue, QueueMessage::Delete { key: "k".into() }).await;
        f.store.set_available(false);

        assert_eq!(
            f.worker.process_next(Channel::Deletes).await.unwrap(),
            ApplyOutcome::Redelivered
        );
        assert_eq!(
            f.worker.process_next(Channel::Deletes).await.unwrap(),
            ApplyOutcome::DeadLettered
        );
        assert_eq!(f.queue.dead_letters(Channel::Deletes).len(), 1);
    }

    #[tokio::test]
    async fn test_cache_failure_does_not_block_ack() {
        let f = fixture(3);
        f.cache.set_available(false);
        publish(
            &f.queue,
            QueueMessage::Write {
                key: "k".into(),
                value: "v".into(),
            },
        )
        .await;

        assert_eq!(
            f.worker.process_next(Channel::Writes).await.unwrap(),
            ApplyOutcome::Acked
        );
        assert_eq!(f.store.get("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(f.metrics.get(Metric::CacheRefreshFailed), 1);
        assert_eq!(f.queue.depth(Channel::Writes).await.unwrap().pending(), 0);
    }

    #[tokio::test]
    async fn test_redelivered_message_is_idempotent() {
        let f = fixture(3);
        let message = QueueMessage::Write {
            key: "k".into(),
            value: "v".into(),
        };
        publish(&f.queue, message.clone()).await;
        publish(&f.queue, message).await;

        f.worker.process_next(Channel::Writes).await.unwrap();
        let once = f.store.snapshot();
        f.worker.process_next(Channel::Writes).await.unwrap();
        assert_eq!(f.store.snapshot(), once);
    }

    #[tokio::test]
    async fn test_spawned_loops_stop_on_shutdown() {
        let f = fixture(3);
        let (tx, rx) = watch::channel(false);
        let handles = f.worker.spawn(2, rx);
        assert_eq!(handles.len(), 4);

        publish(
            &f.queue,
            QueueMessage::Write {
                key: "bg".into(),
                value: "1".into(),
            },
        )
        .await;

        let deadline = Instant::now() + Duration::from_secs(2);
        while f.store.get("bg").await.unwrap().is_none() {
            assert!(Instant::now() < deadline, "worker never applied the message");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        tx.send(true).unwrap();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(2), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }
}
