//! In-process TTL cache with capacity-bounded LRU eviction

use super::{Cache, CacheStats};
use crate::common::{Component, Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct CacheRecord {
    value: String,
    expires_at: Option<Instant>,
    last_access: u64,
}

impl CacheRecord {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, CacheRecord>,
    /// Logical clock for recency
    tick: u64,
}

impl Inner {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, record| !record.is_expired(now));
        before - self.entries.len()
    }

    fn evict_lru(&mut self) -> Option<String> {
        let victim = self
            .entries
            .iter()
            .min_by_key(|(_, record)| record.last_access)
            .map(|(key, _)| key.clone())?;
        self.entries.remove(&victim);
        Some(victim)
    }
}

pub struct MemoryCache {
    inner: Mutex<Inner>,
    max_keys: usize,
    online: AtomicBool,
}

impl MemoryCache {
    pub fn new(max_keys: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max_keys: max_keys.max(1),
            online: AtomicBool::new(true),
        }
    }

    /// Simulate losing (or regaining) the cache server. While offline every
    /// call fails with `DependencyUnavailable`.
    pub fn set_available(&self, available: bool) {
        self.online.store(available, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<()> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::unavailable(Component::Cache, "connection refused"))
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check_online()?;
        let now = Instant::now();
        let mut inner = self.lock();
        let tick = inner.next_tick();

        let expired = match inner.entries.get_mut(key) {
            None => return Ok(None),
            Some(record) if record.is_expired(now) => true,
            Some(record) => {
                record.last_access = tick;
                return Ok(Some(record.value.clone()));
            }
        };
        if expired {
            inner.entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.check_online()?;
        let now = Instant::now();
        let mut inner = self.lock();
        let tick = inner.next_tick();

        if !inner.entries.contains_key(key) && inner.entries.len() >= self.max_keys {
            if inner.purge_expired(now) == 0 {
                if let Some(victim) = inner.evict_lru() {
                    tracing::trace!(key = %victim, "Evicted least recently used entry");
                }
            }
        }

        inner.entries.insert(
            key.to_string(),
            CacheRecord {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| now + ttl),
                last_access: tick,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_online()?;
        self.lock().entries.remove(key);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.check_online()
    }

    async fn stats(&self) -> Result<CacheStats> {
        self.check_online()?;
        let mut inner = self.lock();
        inner.purge_expired(Instant::now());
        let memory_used_bytes = inner
            .entries
            .iter()
            .map(|(key, record)| key.len() + record.value.len())
            .sum();
        Ok(CacheStats {
            keys_count: inner.entries.len(),
            max_keys_limit: self.max_keys,
            memory_used_bytes,
        })
    }
}
