//! Durable store using RocksDB
//!
//! One column family, `kv`, keyed by the entry key and holding the raw UTF-8
//! value. RocksDB calls block, so each one runs on the blocking pool.

use super::DurableStore;
use crate::common::{Error, Result};
use async_trait::async_trait;
use rocksdb::{Options, DB};
use std::path::Path;
use std::sync::Arc;

const CF_KV: &str = "kv";

pub struct RocksStore {
    db: Arc<DB>,
}

impl RocksStore {
    /// Open or create the store at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db = DB::open_cf(&opts, path, vec![CF_KV])?;

        Ok(Self { db: Arc::new(db) })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&DB) -> Result<T> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| Error::Internal(format!("store task failed: {}", e)))?
    }
}

fn cf(db: &DB) -> Result<&rocksdb::ColumnFamily> {
    db.cf_handle(CF_KV)
        .ok_or_else(|| Error::Internal(format!("missing column family {}", CF_KV)))
}

#[async_trait]
impl DurableStore for RocksStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.blocking(move |db| match db.get_cf(cf(db)?, key.as_bytes())? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|_| Error::Internal(format!("value for {} is not UTF-8", key))),
            None => Ok(None),
        })
        .await
    }

    async fn upsert(&self, key: &str, value: &str) -> Result<()> {
        let (key, value) = (key.to_string(), value.to_string());
        self.blocking(move |db| {
            db.put_cf(cf(db)?, key.as_bytes(), value.as_bytes())?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.blocking(move |db| {
            db.delete_cf(cf(db)?, key.as_bytes())?;
            Ok(())
        })
        .await
    }
}
