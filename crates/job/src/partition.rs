//! Input partitioner.
//!
//! Responsibilities:
//! - resolve an input source (bucket prefix, explicit keys, or URLs) into a
//!   flat ordered partition list, one invocation argument set per partition;
//! - split oversized objects into byte-range chunks for parallelism;
//! - record how many partitions each source object produced, so a
//!   downstream reducer can be assigned one-reducer-per-object by slicing
//!   the flat result list with prefix sums.
//!
//! Partition ordering determines call-id assignment and is preserved
//! end-to-end.

use futures::StreamExt;
use futures::stream::TryStreamExt;
use serde_json::json;

use cumulo_common::{CumuloError, Result};
use cumulo_storage::{ByteRange, StorageBackend};

/// Over-read past each chunk boundary, letting the consumer scan forward to
/// the next record boundary instead of splitting a record across partitions.
pub const CHUNK_OVERREAD_BYTES: u64 = 128 * 1024;

/// Concurrency bound for size discovery (HEAD/listing probes).
const DISCOVERY_CONCURRENCY: usize = 16;

/// Logical input of one map job.
#[derive(Debug, Clone)]
pub enum InputSource {
    /// Every object under `prefix` in `bucket`, in listing order.
    Bucket {
        /// Bucket to discover in.
        bucket: String,
        /// Key prefix to discover under.
        prefix: String,
    },
    /// An explicit ordered key list.
    Keys {
        /// Bucket holding the keys.
        bucket: String,
        /// Object keys, in caller order.
        keys: Vec<String>,
    },
    /// An explicit ordered URL list.
    Urls(Vec<String>),
}

/// Where one partition's bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionSource {
    /// A storage object.
    Object {
        /// Bucket holding the object.
        bucket: String,
        /// Object key.
        key: String,
    },
    /// A URL fetched by the worker.
    Url(String),
}

/// One chunk of a larger logical input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    /// Source object or URL.
    pub source: PartitionSource,
    /// Byte range into the source; `None` covers the whole object.
    pub byte_range: Option<ByteRange>,
    /// Chunk size the range was derived from; `None` when unchunked.
    pub chunk_size: Option<u64>,
}

impl Partition {
    /// The invocation argument set describing this partition to a worker.
    pub fn to_args(&self) -> serde_json::Value {
        let mut obj = match &self.source {
            PartitionSource::Object { bucket, key } => json!({
                "bucket": bucket,
                "key": key,
            }),
            PartitionSource::Url(url) => json!({ "url": url }),
        };
        if let Some(range) = self.byte_range {
            obj["range_start"] = json!(range.start);
            obj["range_end"] = json!(range.end);
        }
        obj
    }
}

/// Ordered partition list plus the per-object partition counts.
#[derive(Debug, Clone)]
pub struct PartitionPlan {
    /// Flat ordered partition list; ordering determines call ids.
    pub partitions: Vec<Partition>,
    /// Partitions produced by the i-th discovered object, in discovery order.
    /// `sum(parts_per_object) == partitions.len()` always holds.
    pub parts_per_object: Vec<usize>,
}

/// Byte ranges splitting an object of `size` bytes into `chunk`-sized parts.
///
/// Every non-initial range starts one byte early: the sentinel byte carried
/// over from the previous chunk lets the reader detect whether the chunk
/// truly starts mid-record. All ranges but the last over-read by
/// [`CHUNK_OVERREAD_BYTES`], clamped to the object size.
fn chunk_ranges(size: u64, chunk: u64) -> Vec<ByteRange> {
    let count = size.div_ceil(chunk);
    (0..count)
        .map(|i| {
            let base = i * chunk;
            let start = if i == 0 { 0 } else { base - 1 };
            let end = (base + chunk + CHUNK_OVERREAD_BYTES).min(size);
            ByteRange::new(start, end)
        })
        .collect()
}

fn push_object_partitions(
    plan: &mut PartitionPlan,
    source: PartitionSource,
    size: u64,
    chunk_size: Option<u64>,
) {
    match chunk_size {
        Some(chunk) if size > chunk => {
            let ranges = chunk_ranges(size, chunk);
            plan.parts_per_object.push(ranges.len());
            plan.partitions.extend(ranges.into_iter().map(|range| Partition {
                source: source.clone(),
                byte_range: Some(range),
                chunk_size: Some(chunk),
            }));
        }
        _ => {
            plan.parts_per_object.push(1);
            plan.partitions.push(Partition {
                source,
                byte_range: None,
                chunk_size,
            });
        }
    }
}

/// Resolves `source` into an ordered partition plan.
///
/// # Errors
/// - `Build("no bucket/key/url provided")` for an empty key/URL list;
/// - `Build("no objects available")` when discovery finds nothing;
/// - size-lookup failures propagate from the storage backend.
pub async fn partition(
    source: &InputSource,
    chunk_size: Option<u64>,
    storage: &dyn StorageBackend,
) -> Result<PartitionPlan> {
    if chunk_size == Some(0) {
        return Err(CumuloError::Build("chunk size must be positive".to_string()));
    }
    let mut plan = PartitionPlan {
        partitions: Vec::new(),
        parts_per_object: Vec::new(),
    };
    match source {
        InputSource::Bucket { bucket, prefix } => {
            let keys = storage.list_keys(bucket, prefix).await?;
            if keys.is_empty() {
                return Err(CumuloError::Build(format!(
                    "no objects available under '{bucket}/{prefix}'"
                )));
            }
            let sizes = probe_object_sizes(storage, bucket, &keys).await?;
            for (key, size) in keys.into_iter().zip(sizes) {
                push_object_partitions(
                    &mut plan,
                    PartitionSource::Object {
                        bucket: bucket.clone(),
                        key,
                    },
                    size,
                    chunk_size,
                );
            }
        }
        InputSource::Keys { bucket, keys } => {
            if keys.is_empty() {
                return Err(CumuloError::Build("no bucket/key/url provided".to_string()));
            }
            let sizes = probe_object_sizes(storage, bucket, keys).await?;
            for (key, size) in keys.iter().zip(sizes) {
                push_object_partitions(
                    &mut plan,
                    PartitionSource::Object {
                        bucket: bucket.clone(),
                        key: key.clone(),
                    },
                    size,
                    chunk_size,
                );
            }
        }
        InputSource::Urls(urls) => {
            if urls.is_empty() {
                return Err(CumuloError::Build("no bucket/key/url provided".to_string()));
            }
            let sizes = probe_url_sizes(urls, chunk_size).await?;
            for (url, size) in urls.iter().zip(sizes) {
                match size {
                    Some(size) => push_object_partitions(
                        &mut plan,
                        PartitionSource::Url(url.clone()),
                        size,
                        chunk_size,
                    ),
                    // No known size: the URL cannot be chunked, emit it whole.
                    None => {
                        plan.parts_per_object.push(1);
                        plan.partitions.push(Partition {
                            source: PartitionSource::Url(url.clone()),
                            byte_range: None,
                            chunk_size: None,
                        });
                    }
                }
            }
        }
    }
    tracing::debug!(
        partitions = plan.partitions.len(),
        objects = plan.parts_per_object.len(),
        operator = "Partitioner",
        "input partitioned"
    );
    Ok(plan)
}

/// Looks up object sizes through a bounded concurrent stream, preserving
/// input order.
async fn probe_object_sizes(
    storage: &dyn StorageBackend,
    bucket: &str,
    keys: &[String],
) -> Result<Vec<u64>> {
    futures::stream::iter(keys.iter().map(|key| async move {
        storage.head_object(bucket, key).await.map(|meta| meta.size)
    }))
    .buffered(DISCOVERY_CONCURRENCY)
    .try_collect()
    .await
}

#[cfg(feature = "urls")]
async fn probe_url_sizes(urls: &[String], _chunk_size: Option<u64>) -> Result<Vec<Option<u64>>> {
    let client = reqwest::Client::new();
    futures::stream::iter(urls.iter().map(|url| {
        let client = client.clone();
        let url = url.clone();
        async move {
            let resp = client
                .head(&url)
                .send()
                .await
                .map_err(|e| CumuloError::Storage(format!("HEAD {url}: {e}")))?;
            if !resp.status().is_success() {
                return Err(CumuloError::NotFound(url));
            }
            Ok(resp.content_length())
        }
    }))
    .buffered(DISCOVERY_CONCURRENCY)
    .try_collect()
    .await
}

#[cfg(not(feature = "urls"))]
async fn probe_url_sizes(urls: &[String], chunk_size: Option<u64>) -> Result<Vec<Option<u64>>> {
    if chunk_size.is_some() {
        return Err(CumuloError::Unsupported(
            "chunking URL inputs requires the 'urls' feature".to_string(),
        ));
    }
    Ok(vec![None; urls.len()])
}

#[cfg(test)]
mod tests {
    use super::*;
    use cumulo_storage::MemoryBackend;

    async fn seeded(objects: &[(&str, usize)]) -> MemoryBackend {
        let store = MemoryBackend::new();
        for (key, size) in objects {
            store
                .put_object("inputs", key, vec![b'x'; *size])
                .await
                .expect("seed object");
        }
        store
    }

    #[tokio::test]
    async fn unchunked_inputs_get_one_partition_per_object() {
        let store = seeded(&[("a.csv", 100), ("b.csv", 2000)]).await;
        let source = InputSource::Bucket {
            bucket: "inputs".into(),
            prefix: "".into(),
        };
        let plan = partition(&source, None, &store).await.expect("plan");
        assert_eq!(plan.partitions.len(), 2);
        assert!(plan.partitions.iter().all(|p| p.byte_range.is_none()));
        assert_eq!(plan.parts_per_object, vec![1, 1]);
    }

    #[tokio::test]
    async fn chunked_objects_split_into_ceil_size_over_chunk_parts() {
        let size = 10_000usize;
        let chunk = 3_000u64;
        let store = seeded(&[("big.csv", size)]).await;
        let source = InputSource::Keys {
            bucket: "inputs".into(),
            keys: vec!["big.csv".into()],
        };
        let plan = partition(&source, Some(chunk), &store).await.expect("plan");
        let expected = (size as u64).div_ceil(chunk) as usize;
        assert_eq!(plan.partitions.len(), expected);
        assert_eq!(plan.parts_per_object, vec![expected]);

        let ranges: Vec<ByteRange> = plan
            .partitions
            .iter()
            .map(|p| p.byte_range.expect("chunked partition has range"))
            .collect();
        // Monotonically increasing and collectively covering [0, size).
        assert_eq!(ranges[0].start, 0);
        for pair in ranges.windows(2) {
            assert!(pair[1].start > pair[0].start);
            // Sentinel byte: each chunk starts one byte before the boundary.
            assert!(pair[1].start < pair[0].end);
        }
        assert_eq!(ranges.last().expect("ranges").end, size as u64);
    }

    #[tokio::test]
    async fn objects_no_larger_than_the_chunk_stay_whole() {
        let store = seeded(&[("small.csv", 512)]).await;
        let source = InputSource::Keys {
            bucket: "inputs".into(),
            keys: vec!["small.csv".into()],
        };
        let plan = partition(&source, Some(1024), &store).await.expect("plan");
        assert_eq!(plan.partitions.len(), 1);
        assert_eq!(plan.partitions[0].byte_range, None);
    }

    #[tokio::test]
    async fn parts_per_object_sums_to_partition_count() {
        let store = seeded(&[("a", 10_000), ("b", 100), ("c", 7_500)]).await;
        let source = InputSource::Bucket {
            bucket: "inputs".into(),
            prefix: "".into(),
        };
        let plan = partition(&source, Some(4_000), &store).await.expect("plan");
        assert_eq!(
            plan.parts_per_object.iter().sum::<usize>(),
            plan.partitions.len()
        );
        assert_eq!(plan.parts_per_object.len(), 3);
    }

    #[tokio::test]
    async fn empty_bucket_is_a_hard_failure() {
        let store = MemoryBackend::new();
        let source = InputSource::Bucket {
            bucket: "inputs".into(),
            prefix: "nothing/".into(),
        };
        let err = partition(&source, None, &store).await.unwrap_err();
        assert!(err.to_string().contains("no objects available"));
    }

    #[tokio::test]
    async fn empty_key_list_is_a_hard_failure() {
        let store = MemoryBackend::new();
        let source = InputSource::Keys {
            bucket: "inputs".into(),
            keys: Vec::new(),
        };
        let err = partition(&source, None, &store).await.unwrap_err();
        assert!(err.to_string().contains("no bucket/key/url provided"));
    }

    #[tokio::test]
    async fn partition_args_describe_the_byte_range() {
        let store = seeded(&[("big", 5_000)]).await;
        let source = InputSource::Keys {
            bucket: "inputs".into(),
            keys: vec!["big".into()],
        };
        let plan = partition(&source, Some(2_000), &store).await.expect("plan");
        let args = plan.partitions[1].to_args();
        assert_eq!(args["bucket"], "inputs");
        assert_eq!(args["key"], "big");
        assert_eq!(args["range_start"], 1_999);
    }

    #[test]
    fn chunk_ranges_cover_exactly_once_ignoring_overlap() {
        let ranges = chunk_ranges(10_000, 4_096);
        assert_eq!(ranges.len(), 3);
        assert_eq!(ranges[0].start, 0);
        assert_eq!(ranges[1].start, 4_095);
        assert_eq!(ranges[2].start, 8_191);
        assert_eq!(ranges[2].end, 10_000);
        // Over-read applies to every range the object can still satisfy.
        assert_eq!(ranges[0].end, 4_096 + CHUNK_OVERREAD_BYTES.min(10_000 - 4_096));
    }
}
