//! Out-of-band cleanup of a session's job objects.
//!
//! Deletion is the only destructive storage operation the engine performs,
//! so it runs in a background task and never blocks the caller path.
//! Callers are responsible for not cleaning while futures of the affected
//! jobs are still unresolved.

use std::sync::Arc;

use cumulo_common::{Result, global_metrics};
use cumulo_storage::StorageBackend;

const DELETE_BATCH: usize = 64;

/// Deletes every object under each given job prefix, returning how many
/// objects were removed.
pub async fn purge_job_prefixes(
    storage: Arc<dyn StorageBackend>,
    bucket: &str,
    executor_label: &str,
    prefixes: &[String],
) -> Result<u64> {
    let mut deleted = 0u64;
    for prefix in prefixes {
        let keys = storage.list_keys(bucket, prefix).await?;
        for batch in keys.chunks(DELETE_BATCH) {
            storage.delete_objects(bucket, batch).await?;
            deleted += batch.len() as u64;
        }
    }
    global_metrics().inc_objects_cleaned(executor_label, deleted);
    Ok(deleted)
}
