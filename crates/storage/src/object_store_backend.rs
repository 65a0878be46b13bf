//! Object-store backed storage backend (S3/GCS/Azure via `object_store`).

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::path::Path;
use object_store::{ObjectStore, parse_url_opts};
use url::Url;

use cumulo_common::{CumuloError, Result};

use crate::backend::{ByteRange, ObjectMeta, StorageBackend};

/// Storage backend over any `object_store`-supported service.
///
/// The store is rooted at one bucket URL; all trait calls must name that
/// bucket. Multi-bucket sessions hold one backend per bucket.
pub struct ObjectStoreBackend {
    bucket: String,
    store: Box<dyn ObjectStore>,
}

impl ObjectStoreBackend {
    /// Builds a backend from a bucket URL such as `s3://my-bucket`, passing
    /// `options` through to the underlying store builder.
    ///
    /// # Errors
    /// Returns `InvalidConfig` for URLs `object_store` cannot parse.
    pub fn from_url<I, K, V>(url: &str, options: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let url = Url::parse(url)
            .map_err(|e| CumuloError::InvalidConfig(format!("invalid storage url: {e}")))?;
        let bucket = url.host_str().unwrap_or_default().to_string();
        let (store, _) = parse_url_opts(&url, options)
            .map_err(|e| CumuloError::InvalidConfig(format!("unsupported storage url: {e}")))?;
        Ok(Self { bucket, store })
    }

    fn check_bucket(&self, bucket: &str) -> Result<()> {
        if bucket != self.bucket {
            return Err(CumuloError::Storage(format!(
                "backend is rooted at bucket '{}', got '{bucket}'",
                self.bucket
            )));
        }
        Ok(())
    }
}

fn map_err(bucket: &str, key: &str, err: object_store::Error) -> CumuloError {
    match err {
        object_store::Error::NotFound { .. } => CumuloError::NotFound(format!("{bucket}/{key}")),
        other => CumuloError::Storage(other.to_string()),
    }
}

#[async_trait]
impl StorageBackend for ObjectStoreBackend {
    async fn put_object(&self, bucket: &str, key: &str, data: Vec<u8>) -> Result<()> {
        self.check_bucket(bucket)?;
        let path = Path::from(key);
        self.store
            .put(&path, Bytes::from(data))
            .await
            .map_err(|e| map_err(bucket, key, e))?;
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str, range: Option<ByteRange>) -> Result<Vec<u8>> {
        self.check_bucket(bucket)?;
        let path = Path::from(key);
        match range {
            None => {
                let result = self
                    .store
                    .get(&path)
                    .await
                    .map_err(|e| map_err(bucket, key, e))?;
                let bytes = result.bytes().await.map_err(|e| map_err(bucket, key, e))?;
                Ok(bytes.to_vec())
            }
            Some(r) => {
                // Services differ on out-of-bounds range reads; clamp against
                // the object size so over-reads truncate instead of failing.
                let meta = self
                    .store
                    .head(&path)
                    .await
                    .map_err(|e| map_err(bucket, key, e))?;
                let start = (r.start as usize).min(meta.size);
                let end = (r.end as usize).min(meta.size);
                if start >= end {
                    return Ok(Vec::new());
                }
                let bytes = self
                    .store
                    .get_range(&path, start..end)
                    .await
                    .map_err(|e| map_err(bucket, key, e))?;
                Ok(bytes.to_vec())
            }
        }
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMeta> {
        self.check_bucket(bucket)?;
        let path = Path::from(key);
        let meta = self
            .store
            .head(&path)
            .await
            .map_err(|e| map_err(bucket, key, e))?;
        Ok(ObjectMeta {
            key: key.to_string(),
            size: meta.size as u64,
        })
    }

    async fn list_keys(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        self.check_bucket(bucket)?;
        let prefix_path = Path::from(prefix);
        let metas: Vec<object_store::ObjectMeta> = self
            .store
            .list(Some(&prefix_path))
            .try_collect()
            .await
            .map_err(|e| map_err(bucket, prefix, e))?;
        let mut keys: Vec<String> = metas.into_iter().map(|m| m.location.to_string()).collect();
        keys.sort_unstable();
        Ok(keys)
    }

    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> Result<()> {
        self.check_bucket(bucket)?;
        for key in keys {
            let path = Path::from(key.as_str());
            match self.store.delete(&path).await {
                Ok(()) => {}
                Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => return Err(map_err(bucket, key, e)),
            }
        }
        Ok(())
    }
}
