//! Loopback compute backend for integration tests.
//!
//! Plays the role of the remote execution side of the wire contract: each
//! `invoke` spawns a task that reads the function bundle and its argument
//! slice from storage, interprets the bundle's opcode, and writes exactly
//! one output envelope and one status document under the keys named in the
//! payload (publishing the status to a feed when one is configured).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use cumulo_common::{ActivationId, CallKey, ExecutorConfig, Result};
use cumulo_dispatch::{ComputeBackend, StatusFeed, job_topic};
use cumulo_job::envelope::{
    CallStatus, RemoteErrorRecord, ResultEnvelope, TAG_TIMEOUT, TAG_VERSION_MISMATCH,
};
use cumulo_job::{CallArgs, FunctionBundle, InvocationPayload, epoch_secs, layout};
use cumulo_storage::StorageBackend;

pub struct LoopbackCompute {
    storage: Arc<dyn StorageBackend>,
    config: Arc<ExecutorConfig>,
    feed: Option<Arc<dyn StatusFeed>>,
    refusals: AtomicU32,
    attempts: AtomicU32,
    sequence: AtomicU32,
    worker_version: String,
}

impl LoopbackCompute {
    pub fn new(storage: Arc<dyn StorageBackend>, config: Arc<ExecutorConfig>) -> Self {
        Self {
            storage,
            config,
            feed: None,
            refusals: AtomicU32::new(0),
            attempts: AtomicU32::new(0),
            sequence: AtomicU32::new(0),
            worker_version: cumulo_common::engine_version().to_string(),
        }
    }

    /// Publish every status document to `feed` as well as storage.
    pub fn with_feed(mut self, feed: Arc<dyn StatusFeed>) -> Self {
        self.feed = Some(feed);
        self
    }

    /// Refuse the first `n` invokes with `None` (backend rate limiting).
    pub fn with_refusals(self, n: u32) -> Self {
        self.refusals.store(n, Ordering::SeqCst);
        self
    }

    /// Report this version from the worker side.
    pub fn with_worker_version(mut self, version: &str) -> Self {
        self.worker_version = version.to_string();
        self
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ComputeBackend for LoopbackCompute {
    async fn invoke(
        &self,
        _runtime_name: &str,
        _runtime_memory_mb: u32,
        payload: &InvocationPayload,
    ) -> Result<Option<ActivationId>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Ok(None);
        }
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let storage = Arc::clone(&self.storage);
        let config = Arc::clone(&self.config);
        let feed = self.feed.clone();
        let worker_version = self.worker_version.clone();
        let payload = payload.clone();
        tokio::spawn(async move {
            run_call(storage, config, feed, worker_version, payload).await;
        });
        Ok(Some(ActivationId(format!("loopback-{seq}"))))
    }

    fn preinstalled_modules(&self, _runtime_name: &str) -> Vec<String> {
        vec!["builtins".to_string()]
    }
}

fn args_value(args: &CallArgs) -> Value {
    match args {
        CallArgs::Positional(items) => Value::Array(items.clone()),
        CallArgs::Named(map) => Value::Object(map.clone()),
        CallArgs::Single(value) => value.clone(),
    }
}

fn first_number(args: &CallArgs) -> f64 {
    match args {
        CallArgs::Positional(items) => items.first().and_then(Value::as_f64).unwrap_or(0.0),
        CallArgs::Named(map) => map.values().next().and_then(Value::as_f64).unwrap_or(0.0),
        CallArgs::Single(value) => value.as_f64().unwrap_or(0.0),
    }
}

async fn run_call(
    storage: Arc<dyn StorageBackend>,
    config: Arc<ExecutorConfig>,
    feed: Option<Arc<dyn StatusFeed>>,
    worker_version: String,
    payload: InvocationPayload,
) {
    // Emulate a little network/startup latency.
    tokio::time::sleep(Duration::from_millis(5)).await;
    let start_time = epoch_secs();
    let bucket = &config.storage_bucket;

    let key = CallKey {
        executor_id: payload.executor_id.clone(),
        job_id: payload.job_id.clone(),
        call_id: payload.call_id.clone(),
    };
    let mut status = CallStatus {
        executor_id: key.executor_id.clone(),
        job_id: key.job_id.clone(),
        call_id: key.call_id.clone(),
        start_time,
        end_time: start_time,
        setup_time: 0.0,
        exec_time: 0.0,
        exception: None,
        exception_args: Vec::new(),
        new_futures: None,
        stats: BTreeMap::from([("peak_memory_mb".to_string(), 48.0)]),
        engine_version: worker_version.clone(),
    };

    let envelope = if payload.engine_version != worker_version {
        status.exception = Some(true);
        status.exception_args = vec![
            TAG_VERSION_MISMATCH.to_string(),
            format!("orchestrator {} != worker {worker_version}", payload.engine_version),
        ];
        ResultEnvelope::failure(RemoteErrorRecord {
            tag: TAG_VERSION_MISMATCH.to_string(),
            message: format!("orchestrator {} != worker {worker_version}", payload.engine_version),
            remote_trace: None,
            encode_fallback: false,
        })
    } else {
        let bundle_raw = storage
            .get_object(bucket, &payload.func_key, None)
            .await
            .expect("loopback: function bundle readable");
        let bundle: FunctionBundle =
            bincode::deserialize(&bundle_raw).expect("loopback: bundle decodes");
        let args_raw = storage
            .get_object(bucket, &payload.data_key, payload.data_byte_range)
            .await
            .expect("loopback: argument slice readable");
        let args: CallArgs = serde_json::from_slice(&args_raw).expect("loopback: args decode");
        let opcode = String::from_utf8(bundle.code.clone()).expect("loopback: utf8 opcode");

        execute_opcode(&opcode, &args, &key, &mut status, &storage, &config, feed.as_deref()).await
    };

    storage
        .put_object(
            bucket,
            &payload.output_key,
            envelope.encode().expect("loopback: envelope encodes"),
        )
        .await
        .expect("loopback: envelope written");

    status.end_time = epoch_secs();
    status.exec_time = status.end_time - status.start_time;
    storage
        .put_object(
            bucket,
            &payload.status_key,
            status.encode().expect("loopback: status encodes"),
        )
        .await
        .expect("loopback: status written");

    if let Some(feed) = feed {
        feed.publish(&job_topic(&key), &status)
            .await
            .expect("loopback: status published");
    }
}

async fn execute_opcode(
    opcode: &str,
    args: &CallArgs,
    key: &CallKey,
    status: &mut CallStatus,
    storage: &Arc<dyn StorageBackend>,
    config: &Arc<ExecutorConfig>,
    feed: Option<&dyn StatusFeed>,
) -> ResultEnvelope {
    if opcode == "echo" {
        return ResultEnvelope::success(&args_value(args)).expect("loopback: encode result");
    }
    if opcode == "double" {
        return ResultEnvelope::success(&json!(first_number(args) * 2.0)).expect("loopback: encode result");
    }
    if opcode == "one" {
        return ResultEnvelope::success(&json!(1)).expect("loopback: encode result");
    }
    if opcode == "sum" {
        // Reduce shape: one positional argument holding the value list.
        let total: f64 = match args {
            CallArgs::Positional(items) => items
                .first()
                .and_then(Value::as_array)
                .map(|list| list.iter().filter_map(Value::as_f64).sum())
                .unwrap_or(0.0),
            _ => 0.0,
        };
        return ResultEnvelope::success(&json!(total)).expect("loopback: encode result");
    }
    if opcode == "outatime" {
        status.exception = Some(true);
        status.exception_args = vec![TAG_TIMEOUT.to_string(), "execution timed out".to_string()];
        return ResultEnvelope::failure(RemoteErrorRecord {
            tag: TAG_TIMEOUT.to_string(),
            message: "execution timed out".to_string(),
            remote_trace: None,
            encode_fallback: false,
        });
    }
    if let Some(rest) = opcode.strip_prefix("fail:") {
        let (type_name, message) = rest.split_once(':').unwrap_or((rest, "failure"));
        status.exception = Some(true);
        status.exception_args = vec![type_name.to_string(), message.to_string()];
        return ResultEnvelope::failure(RemoteErrorRecord {
            tag: type_name.to_string(),
            message: message.to_string(),
            remote_trace: Some(format!("remote trace of {type_name}")),
            encode_fallback: false,
        });
    }
    if let Some(rest) = opcode.strip_prefix("spawn:") {
        // "spawn:<job_id>:<count>" dispatches <count> child calls under the
        // same executor and completes them immediately.
        let (job, count) = rest.split_once(':').expect("loopback: spawn directive");
        let count: u32 = count.parse().expect("loopback: spawn count");
        let child_job = cumulo_common::JobId(job.to_string());
        let mut children = Vec::new();
        for index in 0..count {
            let child = CallKey::new(key.executor_id.clone(), child_job.clone(), index);
            let child_status = CallStatus {
                executor_id: child.executor_id.clone(),
                job_id: child.job_id.clone(),
                call_id: child.call_id.clone(),
                new_futures: None,
                exception: None,
                exception_args: Vec::new(),
                ..status.clone()
            };
            storage
                .put_object(
                    &config.storage_bucket,
                    &layout::output_key(&config.storage_prefix, &child),
                    ResultEnvelope::success(&json!(format!("spawned-child-{index}")))
                        .expect("loopback: encode result")
                        .encode()
                        .expect("loopback: child envelope encodes"),
                )
                .await
                .expect("loopback: child envelope written");
            storage
                .put_object(
                    &config.storage_bucket,
                    &layout::status_key(&config.storage_prefix, &child),
                    child_status.encode().expect("loopback: child status encodes"),
                )
                .await
                .expect("loopback: child status written");
            if let Some(feed) = feed {
                feed.publish(&job_topic(&child), &child_status)
                    .await
                    .expect("loopback: child status published");
            }
            children.push(child);
        }
        status.new_futures = Some(format!("{job}/{count}"));
        return ResultEnvelope::spawned(children);
    }
    panic!("loopback: unknown opcode '{opcode}'");
}
