//! Volatile store for tests and single-process demos

use super::DurableStore;
use crate::common::{Component, Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

pub struct MemoryStore {
    map: Mutex<HashMap<String, String>>,
    online: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
            online: AtomicBool::new(true),
        }
    }

    /// Simulate losing (or regaining) the database
    pub fn set_available(&self, available: bool) {
        self.online.store(available, Ordering::SeqCst);
    }

    /// Copy of the full table, for assertions
    pub fn snapshot(&self) -> HashMap<String, String> {
        self.lock().clone()
    }

    fn check_online(&self) -> Result<()> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::unavailable(Component::Store, "connection refused"))
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check_online()?;
        Ok(self.lock().get(key).cloned())
    }

    async fn upsert(&self, key: &str, value: &str) -> Result<()> {
        self.check_online()?;
        self.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_online()?;
        self.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upsert_and_delete_are_idempotent() {
        let store = MemoryStore::new();

        store.upsert("k", "v").await.unwrap();
        store.upsert("k", "v").await.unwrap();
        assert_eq!(store.snapshot().len(), 1);
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        store.delete("k").await.unwrap();
        store.delete("k").await.unwrap();
        assert!(store.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_probe_leaves_no_trace() {
        let store = MemoryStore::new();
        store.probe().await.unwrap();
        assert!(store.snapshot().is_empty());

        // caller keys that look internal are left alone
        store.upsert("_probe", "user-data").await.unwrap();
        store.probe().await.unwrap();
        assert_eq!(store.snapshot().len(), 1);
        assert_eq!(store.get("_probe").await.unwrap().as_deref(), Some("user-data"));

        store.set_available(false);
        assert!(store.probe().await.is_err());
    }
}
