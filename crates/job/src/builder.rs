//! Job builder: turns a (function, argument-list, options) tuple into an
//! immutable [`JobDescription`].
//!
//! Responsibilities:
//! - normalize per-call argument sets and reject ambiguous shapes;
//! - serialize the function bundle once and each argument set independently,
//!   so one oversized or unserializable call never perturbs another;
//! - aggregate all argument sets into one uploaded blob with per-call byte
//!   ranges, converting N upload round-trips into one;
//! - upload the function/module bundle under a job-scoped key.
//!
//! Nothing is dispatched here; the invoker consumes the returned
//! description.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use cumulo_common::{CumuloError, ExecutorConfig, ExecutorId, JobId, Result};
use cumulo_storage::{ByteRange, StorageBackend};

use crate::descriptor::JobDescription;
use crate::layout;

/// Serialized user function: an opaque code blob plus the transitive module
/// manifest needed to reconstruct it remotely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionBundle {
    /// Opaque serialized function.
    pub code: Vec<u8>,
    /// Names of modules the function needs at the worker.
    pub modules: Vec<String>,
}

/// Well-known bindings a caller may opt into having injected worker-side.
///
/// The caller states what the function accepts; the worker glue injects
/// exactly the named bindings and nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtraBinding {
    /// A storage handle scoped to the job's bucket.
    Storage,
    /// The call's own `(executor_id, job_id, call_id)` identity.
    CallIdentity,
}

impl ExtraBinding {
    /// Parameter name the worker glue injects this binding under.
    pub fn wire_name(self) -> &'static str {
        match self {
            ExtraBinding::Storage => "storage",
            ExtraBinding::CallIdentity => "call_identity",
        }
    }
}

/// Per-job build options.
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    /// Modules stripped from the bundle manifest regardless of need.
    pub exclude_modules: Vec<String>,
    /// Bindings injected into every call of the job.
    pub extra_bindings: Vec<ExtraBinding>,
    /// Overrides the session's per-invocation memory size.
    pub runtime_memory_mb: Option<u32>,
    /// Overrides the session's worker-side execution timeout.
    pub execution_timeout_secs: Option<u64>,
}

/// One call's normalized argument set.
///
/// The serialized form of this enum is the per-call slice of the aggregated
/// data blob, and the shape the worker glue decodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallArgs {
    /// Positional arguments.
    Positional(Vec<serde_json::Value>),
    /// Named arguments.
    Named(serde_json::Map<String, serde_json::Value>),
    /// A single bare value.
    Single(serde_json::Value),
}

impl CallArgs {
    /// Normalizes one raw argument value: arrays become positional sets,
    /// objects named sets, and anything else a single-value set.
    pub fn normalize(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Array(items) => CallArgs::Positional(items),
            serde_json::Value::Object(map) => CallArgs::Named(map),
            other => CallArgs::Single(other),
        }
    }
}

/// Builds job descriptions by staging serialized payloads in storage.
pub struct JobBuilder {
    storage: Arc<dyn StorageBackend>,
    config: Arc<ExecutorConfig>,
}

impl JobBuilder {
    pub fn new(storage: Arc<dyn StorageBackend>, config: Arc<ExecutorConfig>) -> Self {
        Self { storage, config }
    }

    /// Serializes and uploads everything one job needs, returning its
    /// description. No calls are dispatched.
    ///
    /// `preinstalled_modules` is the compute collaborator's manifest of
    /// modules already present in the target runtime; they are stripped from
    /// the uploaded bundle alongside the caller's explicit exclusions.
    ///
    /// # Errors
    /// All failures here are synchronous build-time failures: ambiguous
    /// argument shapes, the aggregate-size ceiling, or storage upload
    /// errors.
    pub async fn build_job(
        &self,
        executor_id: &ExecutorId,
        job_id: &JobId,
        function: &FunctionBundle,
        args: &[serde_json::Value],
        preinstalled_modules: &[String],
        opts: &JobOptions,
    ) -> Result<JobDescription> {
        if args.is_empty() {
            return Err(CumuloError::Build("job has no calls".to_string()));
        }

        let reserved: Vec<&str> = opts.extra_bindings.iter().map(|b| b.wire_name()).collect();
        let mut encoded_calls = Vec::with_capacity(args.len());
        for (index, raw) in args.iter().enumerate() {
            let call_args = CallArgs::normalize(raw.clone());
            if let CallArgs::Named(map) = &call_args {
                if let Some(clash) = reserved.iter().find(|r| map.contains_key(**r)) {
                    return Err(CumuloError::Build(format!(
                        "ambiguous argument shape: call {index} names '{clash}', \
                         which is reserved by an extra binding"
                    )));
                }
            }
            let bytes = serde_json::to_vec(&call_args)
                .map_err(|e| CumuloError::Build(format!("serialize arguments of call {index}: {e}")))?;
            encoded_calls.push(bytes);
        }

        let total: usize = encoded_calls.iter().map(Vec::len).sum();
        if total > self.config.max_agg_data_bytes {
            return Err(CumuloError::Build(format!(
                "exceeded maximum aggregate data size: {total} > {} bytes",
                self.config.max_agg_data_bytes
            )));
        }

        let mut agg_data = Vec::with_capacity(total);
        let mut data_ranges = Vec::with_capacity(encoded_calls.len());
        for bytes in &encoded_calls {
            let start = agg_data.len() as u64;
            agg_data.extend_from_slice(bytes);
            data_ranges.push(ByteRange::new(start, agg_data.len() as u64));
        }

        let bundle = FunctionBundle {
            code: function.code.clone(),
            modules: function
                .modules
                .iter()
                .filter(|m| {
                    !opts.exclude_modules.contains(m) && !preinstalled_modules.contains(m)
                })
                .cloned()
                .collect(),
        };
        let bundle_bytes = bincode::serialize(&bundle)
            .map_err(|e| CumuloError::Build(format!("serialize function bundle: {e}")))?;

        let prefix = &self.config.storage_prefix;
        let data_key = layout::agg_data_key(prefix, executor_id, job_id);
        let function_key = layout::func_key(prefix, executor_id, job_id);
        self.storage
            .put_object(&self.config.storage_bucket, &data_key, agg_data)
            .await?;
        self.storage
            .put_object(&self.config.storage_bucket, &function_key, bundle_bytes)
            .await?;

        info!(
            executor_id = %executor_id,
            job_id = %job_id,
            total_calls = args.len(),
            agg_bytes = total,
            operator = "JobBuilder",
            "job staged"
        );

        Ok(JobDescription {
            executor_id: executor_id.clone(),
            job_id: job_id.clone(),
            function_key,
            data_key,
            data_ranges,
            runtime_name: self.config.runtime_name.clone(),
            runtime_memory_mb: opts.runtime_memory_mb.unwrap_or(self.config.runtime_memory_mb),
            execution_timeout_secs: opts
                .execution_timeout_secs
                .unwrap_or(self.config.execution_timeout_secs),
            total_calls: args.len() as u32,
        })
    }
}
