//! Queued write path
//!
//! A write or delete is validated, published to its channel, and only then
//! acknowledged to the caller as accepted. Accepted means durably queued,
//! not applied: a read right after may still return the old value or
//! `NotFound`. After the publish succeeds the cached copy of the key is
//! dropped in a detached task so stale reads end early.

use crate::cache::Cache;
use crate::common::{validate_key, with_timeout, Component, Error, Metric, MetricsSink, Result};
use crate::queue::{QueueMessage, QueueTransport};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Result of a successful write or delete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accepted {
    Queued,
}

#[derive(Clone)]
pub struct WriteCoordinator {
    queue: Arc<dyn QueueTransport>,
    cache: Arc<dyn Cache>,
    metrics: Arc<dyn MetricsSink>,
    publish_timeout: Duration,
    cache_timeout: Duration,
}

impl WriteCoordinator {
    pub fn new(
        queue: Arc<dyn QueueTransport>,
        cache: Arc<dyn Cache>,
        metrics: Arc<dyn MetricsSink>,
        publish_timeout: Duration,
        cache_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            cache,
            metrics,
            publish_timeout,
            cache_timeout,
        }
    }

    /// Queue an upsert. `None` and empty strings are rejected.
    pub async fn write(&self, key: Option<&str>, value: Option<&str>) -> Result<Accepted> {
        let key = key.unwrap_or_default();
        validate_key(key)?;
        let value = match value {
            Some(value) if !value.is_empty() => value,
            _ => return Err(Error::Validation("value is required".into())),
        };

        self.submit(QueueMessage::Write {
            key: key.to_string(),
            value: value.to_string(),
        })
        .await
    }

    /// Queue a delete
    pub async fn delete(&self, key: &str) -> Result<Accepted> {
        validate_key(key)?;
        self.submit(QueueMessage::Delete {
            key: key.to_string(),
        })
        .await
    }

    async fn submit(&self, message: QueueMessage) -> Result<Accepted> {
        let channel = message.channel();
        let body = message.encode()?;

        let start = Instant::now();
        let published = with_timeout(
            Component::Queue,
            self.publish_timeout,
            self.queue.publish(channel, body),
        )
        .await;
        self.metrics.observe("queue_publish", start.elapsed());

        if let Err(e) = published {
            self.metrics.incr(Metric::PublishFailed);
            tracing::warn!(channel = %channel, key = %message.key(), error = %e, "Publish failed");
            return Err(match e {
                e @ (Error::DependencyUnavailable { .. } | Error::DependencyTimeout { .. }) => e,
                other => Error::unavailable(Component::Queue, other),
            });
        }
        self.metrics.incr(Metric::MessagePublished);
        tracing::debug!(channel = %channel, key = %message.key(), "Message queued");

        self.invalidate(message.key());
        Ok(Accepted::Queued)
    }

    /// Fire-and-forget cache eviction
    fn invalidate(&self, key: &str) {
        let cache = self.cache.clone();
        let metrics = self.metrics.clone();
        let key = key.to_string();
        let timeout = self.cache_timeout;

        tokio::spawn(async move {
            if let Err(e) = with_timeout(Component::Cache, timeout, cache.delete(&key)).await {
                metrics.incr(Metric::CacheInvalidateFailed);
                tracing::debug!(key = %key, error = %e, "Cache invalidation failed");
            }
        });
    }
}
