use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use cumulo_common::Result;

/// Half-open byte range `[start, end)` into a storage object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    /// Inclusive start offset.
    pub start: u64,
    /// Exclusive end offset.
    pub end: u64,
}

impl ByteRange {
    /// Builds a range; `end` must not precede `start`.
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end, "byte range must not be inverted");
        Self { start, end }
    }

    /// Range length in bytes.
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    /// True when the range selects nothing.
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Size/identity metadata of one stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Object key within its bucket.
    pub key: String,
    /// Object size in bytes.
    pub size: u64,
}

/// Byte-blob storage abstraction: put/get/delete/list of opaque blobs by key.
///
/// This is the only channel orchestrator and workers share. Implementations
/// are expected to be eventually consistent: a `get` racing a fresh `put` may
/// legitimately report [`cumulo_common::CumuloError::NotFound`], and a prefix
/// listing may lag behind individual object visibility. Callers own the
/// retry policy.
///
/// Range reads past the end of an object truncate to the available bytes
/// rather than failing; the partitioner's over-read depends on this.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Stores `data` under `bucket`/`key`, replacing any previous object.
    async fn put_object(&self, bucket: &str, key: &str, data: Vec<u8>) -> Result<()>;

    /// Reads an object, or the given byte range of it.
    ///
    /// # Errors
    /// Returns [`cumulo_common::CumuloError::NotFound`] while the object is
    /// not visible.
    async fn get_object(&self, bucket: &str, key: &str, range: Option<ByteRange>) -> Result<Vec<u8>>;

    /// Reads object metadata without fetching the payload.
    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMeta>;

    /// Lists all keys under `prefix`, in lexicographic order.
    async fn list_keys(&self, bucket: &str, prefix: &str) -> Result<Vec<String>>;

    /// Deletes the given keys; keys that are already gone are ignored.
    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_range_len_saturates() {
        assert_eq!(ByteRange::new(10, 30).len(), 20);
        assert_eq!(ByteRange { start: 5, end: 5 }.len(), 0);
        assert!(ByteRange { start: 5, end: 5 }.is_empty());
    }
}
