//! In-memory storage backend.
//!
//! Used by the test suites and by local single-process runs. Listing is
//! immediately consistent here; the polling paths that tolerate listing lag
//! against real object stores are exercised with dedicated wrappers in the
//! dispatch tests.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use cumulo_common::{CumuloError, Result};

use crate::backend::{ByteRange, ObjectMeta, StorageBackend};

/// Process-local storage backend keyed by bucket and object key.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    buckets: RwLock<HashMap<String, BTreeMap<String, Vec<u8>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored objects across buckets; test helper.
    pub async fn object_count(&self) -> usize {
        self.buckets.read().await.values().map(BTreeMap::len).sum()
    }
}

fn missing(bucket: &str, key: &str) -> CumuloError {
    CumuloError::NotFound(format!("{bucket}/{key}"))
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn put_object(&self, bucket: &str, key: &str, data: Vec<u8>) -> Result<()> {
        let mut buckets = self.buckets.write().await;
        buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), data);
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str, range: Option<ByteRange>) -> Result<Vec<u8>> {
        let buckets = self.buckets.read().await;
        let data = buckets
            .get(bucket)
            .and_then(|b| b.get(key))
            .ok_or_else(|| missing(bucket, key))?;
        match range {
            None => Ok(data.clone()),
            Some(r) => {
                let start = (r.start as usize).min(data.len());
                let end = (r.end as usize).min(data.len());
                Ok(data[start..end].to_vec())
            }
        }
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMeta> {
        let buckets = self.buckets.read().await;
        let data = buckets
            .get(bucket)
            .and_then(|b| b.get(key))
            .ok_or_else(|| missing(bucket, key))?;
        Ok(ObjectMeta {
            key: key.to_string(),
            size: data.len() as u64,
        })
    }

    async fn list_keys(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let buckets = self.buckets.read().await;
        let Some(objects) = buckets.get(bucket) else {
            return Ok(Vec::new());
        };
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> Result<()> {
        let mut buckets = self.buckets.write().await;
        if let Some(objects) = buckets.get_mut(bucket) {
            for key in keys {
                objects.remove(key);
            }
        }
        Ok(())
    }
}
