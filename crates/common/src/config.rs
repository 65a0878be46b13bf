use serde::{Deserialize, Serialize};

/// Engine version string stamped into every invocation payload.
///
/// Workers echo their own version in the status object; a mismatch is
/// surfaced as a dedicated, non-retryable error.
pub fn engine_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// Executor/session behavior knobs shared by builder, invoker, and wait paths.
pub struct ExecutorConfig {
    /// Storage bucket holding all job objects.
    pub storage_bucket: String,
    /// Key prefix under which all job objects live.
    pub storage_prefix: String,
    /// Compute runtime identifier handed to the backend on every invoke.
    pub runtime_name: String,
    /// Memory size (MiB) requested per invocation.
    pub runtime_memory_mb: u32,
    /// Worker-side wall-clock execution timeout in seconds.
    pub execution_timeout_secs: u64,
    /// Token-bucket size: max in-flight dispatch attempts at once.
    pub worker_slots: usize,
    /// Number of concurrent dispatcher tasks issuing invokes.
    pub invoke_pool_threads: usize,
    /// Max re-dispatch attempts per call before the job fails.
    pub invoke_max_retries: u32,
    /// Backoff sleeps (ms) between re-dispatch attempts; the last entry
    /// repeats once the list is exhausted. Each draw is jittered.
    pub invoke_retry_backoff_ms: Vec<u64>,
    /// Ceiling on the aggregated per-call argument blob; exceeding it is a
    /// hard build failure, not a degraded upload path.
    pub max_agg_data_bytes: usize,
    /// Fixed sleep (ms) between status-object polls in `status()`.
    pub status_poll_interval_ms: u64,
    /// Attempts to fetch an output object before "unable to get output".
    pub output_fetch_retries: u32,
    /// Sleep (ms) between output-object fetch attempts.
    pub output_fetch_backoff_ms: u64,
    /// Base sleep (ms) between wait-engine polling rounds.
    pub wait_poll_interval_ms: u64,
    /// Floor (ms) for the adaptively shrinking wait-round sleep.
    pub wait_min_poll_interval_ms: u64,
    /// Concurrency bound for direct per-call status fetches.
    pub wait_concurrent_status_fetches: usize,
    /// Max direct per-call status fetches issued in one polling round.
    pub wait_direct_query_limit: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            storage_bucket: "cumulo-data".to_string(),
            storage_prefix: "cumulo.jobs".to_string(),
            runtime_name: "cumulo-runtime-v1".to_string(),
            runtime_memory_mb: 256,
            execution_timeout_secs: 600,
            worker_slots: 256,
            invoke_pool_threads: 64,
            invoke_max_retries: 5,
            invoke_retry_backoff_ms: vec![1_000, 2_000, 5_000, 10_000],
            max_agg_data_bytes: 4 * 1024 * 1024,
            status_poll_interval_ms: 2_000,
            output_fetch_retries: 5,
            output_fetch_backoff_ms: 1_000,
            wait_poll_interval_ms: 2_000,
            wait_min_poll_interval_ms: 250,
            wait_concurrent_status_fetches: 64,
            wait_direct_query_limit: 64,
        }
    }
}

impl ExecutorConfig {
    /// Validates the invariants other components rely on.
    ///
    /// # Errors
    /// Returns [`crate::CumuloError::InvalidConfig`] for zero-sized pools,
    /// an empty backoff list, or an empty bucket/prefix.
    pub fn validate(&self) -> crate::Result<()> {
        if self.storage_bucket.is_empty() || self.storage_prefix.is_empty() {
            return Err(crate::CumuloError::InvalidConfig(
                "storage bucket and prefix must be non-empty".to_string(),
            ));
        }
        if self.worker_slots == 0 || self.invoke_pool_threads == 0 {
            return Err(crate::CumuloError::InvalidConfig(
                "worker_slots and invoke_pool_threads must be positive".to_string(),
            ));
        }
        if self.invoke_retry_backoff_ms.is_empty() {
            return Err(crate::CumuloError::InvalidConfig(
                "invoke_retry_backoff_ms must list at least one sleep".to_string(),
            ));
        }
        if self.wait_concurrent_status_fetches == 0 {
            return Err(crate::CumuloError::InvalidConfig(
                "wait_concurrent_status_fetches must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        ExecutorConfig::default().validate().expect("valid default");
    }

    #[test]
    fn zero_worker_slots_is_rejected() {
        let cfg = ExecutorConfig {
            worker_slots: 0,
            ..ExecutorConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
