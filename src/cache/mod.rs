//! Cache abstraction
//!
//! The cache is a volatile, non-authoritative copy of store entries. Every
//! caller treats its errors as recoverable: reads fall back to the store and
//! writes/evictions are best effort.

pub mod memory;

use crate::common::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use memory::MemoryCache;

/// Snapshot of cache occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub keys_count: usize,
    pub max_keys_limit: usize,
    pub memory_used_bytes: usize,
}

#[async_trait]
pub trait Cache: Send + Sync {
    /// Look up a live (unexpired) value
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Insert or overwrite; `None` means no expiry
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Remove `key`; removing an absent key succeeds
    async fn delete(&self, key: &str) -> Result<()>;

    /// Cheap reachability check
    async fn ping(&self) -> Result<()>;

    async fn stats(&self) -> Result<CacheStats>;
}
