//! Job and per-call descriptors.
//!
//! A [`JobDescription`] is built once per job and never mutated afterward;
//! workers see only the per-call [`InvocationPayload`] derived from it at
//! dispatch time.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use cumulo_common::{CallKey, ExecutorId, JobId};
use cumulo_storage::ByteRange;

use crate::layout;

/// Current wall-clock time as fractional epoch seconds, the unit used by
/// host- and worker-side timestamps in status documents.
pub fn epoch_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Immutable description of one dispatched job.
///
/// Created by the job builder after all uploads succeed; read-only
/// afterward. Workers never see this object, only payloads derived from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDescription {
    /// Owning executor session.
    pub executor_id: ExecutorId,
    /// Job identifier, unique within the executor.
    pub job_id: JobId,
    /// Storage key of the serialized function bundle.
    pub function_key: String,
    /// Storage key of the aggregated argument blob.
    pub data_key: String,
    /// Byte range of each call's argument set inside the aggregated blob,
    /// in call-id order.
    pub data_ranges: Vec<ByteRange>,
    /// Compute runtime identifier.
    pub runtime_name: String,
    /// Memory size (MiB) requested per invocation.
    pub runtime_memory_mb: u32,
    /// Worker-side wall-clock execution timeout in seconds.
    pub execution_timeout_secs: u64,
    /// Number of calls in the job.
    pub total_calls: u32,
}

impl JobDescription {
    /// The `(executor_id, job_id, call_id)` triple of the `index`-th call.
    pub fn call_key(&self, index: u32) -> CallKey {
        CallKey::new(self.executor_id.clone(), self.job_id.clone(), index)
    }
}

/// Wire contract handed to the compute backend for one call.
///
/// The remote handler must parse this payload and honor it by writing
/// exactly one status object under `status_key` and one output envelope
/// under `output_key` before exiting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationPayload {
    /// Owning executor session.
    pub executor_id: ExecutorId,
    /// Owning job.
    pub job_id: JobId,
    /// Call within the job.
    pub call_id: cumulo_common::CallId,
    /// Storage key of the function bundle to load.
    pub func_key: String,
    /// Storage key of the aggregated argument blob.
    pub data_key: String,
    /// Byte range of this call's argument set inside the blob.
    pub data_byte_range: Option<ByteRange>,
    /// Storage key the worker must write its output envelope to.
    pub output_key: String,
    /// Storage key the worker must write its status document to.
    pub status_key: String,
    /// Wall-clock execution timeout the worker enforces on itself.
    pub execution_timeout_secs: u64,
    /// Orchestrator engine version; workers report a mismatch as
    /// `WRONGVERSION` instead of running the call.
    pub engine_version: String,
    /// Host-side submission timestamp (epoch seconds).
    pub host_submit_time: f64,
    /// Well-known bindings the caller opted into injecting worker-side.
    pub extra_bindings: Vec<String>,
}

impl InvocationPayload {
    /// Derives the payload for the `index`-th call of `job`.
    pub fn for_call(
        job: &JobDescription,
        storage_prefix: &str,
        index: u32,
        extra_bindings: Vec<String>,
    ) -> Self {
        let key = job.call_key(index);
        Self {
            status_key: layout::status_key(storage_prefix, &key),
            output_key: layout::output_key(storage_prefix, &key),
            executor_id: key.executor_id,
            job_id: key.job_id,
            call_id: key.call_id,
            func_key: job.function_key.clone(),
            data_key: job.data_key.clone(),
            data_byte_range: job.data_ranges.get(index as usize).copied(),
            execution_timeout_secs: job.execution_timeout_secs,
            engine_version: cumulo_common::engine_version().to_string(),
            host_submit_time: epoch_secs(),
            extra_bindings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cumulo_common::JobKind;

    fn job() -> JobDescription {
        let executor_id = ExecutorId("exec1".into());
        let job_id = JobId::new(JobKind::Map, 0);
        JobDescription {
            function_key: layout::func_key("p", &executor_id, &job_id),
            data_key: layout::agg_data_key("p", &executor_id, &job_id),
            executor_id,
            job_id,
            data_ranges: vec![ByteRange::new(0, 10), ByteRange::new(10, 25)],
            runtime_name: "rt".into(),
            runtime_memory_mb: 256,
            execution_timeout_secs: 600,
            total_calls: 2,
        }
    }

    #[test]
    fn payload_keys_follow_the_layout() {
        let payload = InvocationPayload::for_call(&job(), "p", 1, Vec::new());
        assert_eq!(payload.status_key, "p/exec1/M000/00001/status.json");
        assert_eq!(payload.output_key, "p/exec1/M000/00001/output.bin");
        assert_eq!(payload.data_byte_range, Some(ByteRange::new(10, 25)));
        assert_eq!(payload.call_id.as_str(), "00001");
    }

    #[test]
    fn payload_carries_the_engine_version() {
        let payload = InvocationPayload::for_call(&job(), "p", 0, Vec::new());
        assert_eq!(payload.engine_version, cumulo_common::engine_version());
        assert!(payload.host_submit_time > 0.0);
    }
}
