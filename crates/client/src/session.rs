//! Session: the explicit per-run context object.
//!
//! One session corresponds to one logical executor: it owns the executor id,
//! the job-id counters, and the collaborator handles every component needs.
//! There is no process-wide default session; all components receive the
//! session (or handles cloned from it) explicitly.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use cumulo_common::{ExecutorConfig, ExecutorId, JobId, JobKind, MetricsRegistry, Result, global_metrics};
use cumulo_dispatch::{ComputeBackend, StatusFeed};
use cumulo_storage::StorageBackend;

pub type SharedSession = Arc<Session>;

pub struct Session {
    config: Arc<ExecutorConfig>,
    executor_id: ExecutorId,
    metrics: MetricsRegistry,
    storage: Arc<dyn StorageBackend>,
    compute: Arc<dyn ComputeBackend>,
    feed: Option<Arc<dyn StatusFeed>>,
    job_counters: [AtomicU32; 3],
}

impl Session {
    /// Builds a session with a fresh executor id.
    ///
    /// # Errors
    /// Returns `InvalidConfig` when the configuration fails validation.
    pub fn new(
        config: ExecutorConfig,
        storage: Arc<dyn StorageBackend>,
        compute: Arc<dyn ComputeBackend>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            executor_id: ExecutorId::generate(),
            metrics: global_metrics().clone(),
            storage,
            compute,
            feed: None,
            job_counters: [AtomicU32::new(0), AtomicU32::new(0), AtomicU32::new(0)],
        })
    }

    /// Switches completion monitoring to the given push feed.
    pub fn with_feed(mut self, feed: Arc<dyn StatusFeed>) -> Self {
        self.feed = Some(feed);
        self
    }

    pub fn config(&self) -> &Arc<ExecutorConfig> {
        &self.config
    }

    pub fn executor_id(&self) -> &ExecutorId {
        &self.executor_id
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    pub fn compute(&self) -> &Arc<dyn ComputeBackend> {
        &self.compute
    }

    pub fn feed(&self) -> Option<&Arc<dyn StatusFeed>> {
        self.feed.as_ref()
    }

    /// Assigns the next job id of the given kind, monotonically per session.
    pub fn next_job_id(&self, kind: JobKind) -> JobId {
        let slot = match kind {
            JobKind::Map => 0,
            JobKind::Reduce => 1,
            JobKind::Async => 2,
        };
        let seq = self.job_counters[slot].fetch_add(1, Ordering::Relaxed);
        JobId::new(kind, seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cumulo_common::ActivationId;
    use cumulo_job::InvocationPayload;
    use cumulo_storage::MemoryBackend;

    struct NullCompute;

    #[async_trait]
    impl ComputeBackend for NullCompute {
        async fn invoke(
            &self,
            _runtime_name: &str,
            _runtime_memory_mb: u32,
            _payload: &InvocationPayload,
        ) -> Result<Option<ActivationId>> {
            Ok(None)
        }
    }

    #[test]
    fn job_ids_are_monotonic_per_kind() {
        let session = Session::new(
            ExecutorConfig::default(),
            Arc::new(MemoryBackend::new()),
            Arc::new(NullCompute),
        )
        .expect("session");
        assert_eq!(session.next_job_id(JobKind::Map).as_str(), "M000");
        assert_eq!(session.next_job_id(JobKind::Map).as_str(), "M001");
        assert_eq!(session.next_job_id(JobKind::Reduce).as_str(), "R000");
        assert_eq!(session.next_job_id(JobKind::Async).as_str(), "A000");
        assert_eq!(session.next_job_id(JobKind::Map).as_str(), "M002");
    }

    #[test]
    fn invalid_config_is_rejected_at_session_build() {
        let config = ExecutorConfig {
            worker_slots: 0,
            ..ExecutorConfig::default()
        };
        let result = Session::new(config, Arc::new(MemoryBackend::new()), Arc::new(NullCompute));
        assert!(result.is_err());
    }
}
