//! Durable store abstraction
//!
//! The store is the single source of truth. Only two mutations exist,
//! upsert-by-key and delete-by-key, and both are idempotent: applying one
//! twice leaves the same state as applying it once.

pub mod memory;
pub mod rocks;

use crate::common::Result;
use async_trait::async_trait;

pub use memory::MemoryStore;
pub use rocks::RocksStore;

/// Keys under this prefix belong to kvpipe itself and are never accepted
/// from callers
pub const RESERVED_KEY_PREFIX: &str = "\0kvpipe-";

/// Fresh key for one readiness round trip, outside the caller key space
pub fn probe_key() -> String {
    format!("{}probe-{}", RESERVED_KEY_PREFIX, uuid::Uuid::new_v4())
}

#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Insert or overwrite `key`
    async fn upsert(&self, key: &str, value: &str) -> Result<()>;

    /// Remove `key`; removing an absent key succeeds
    async fn delete(&self, key: &str) -> Result<()>;

    /// Write-then-delete round trip used by readiness
    async fn probe(&self) -> Result<()> {
        let key = probe_key();
        self.upsert(&key, "_ok").await?;
        self.delete(&key).await
    }
}
