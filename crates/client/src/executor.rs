//! The public function-executor API.
//!
//! Responsibilities:
//! - turn (function, inputs, options) into built and dispatched jobs;
//! - hand out call futures in call-id order;
//! - front the wait engine for completion and result collection;
//! - orchestrate map/reduce over partitioned inputs;
//! - schedule out-of-band cleanup of a session's job objects.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tracing::{error, info, warn};

use cumulo_common::{ExecutorId, JobId, JobKind, Result};
use cumulo_dispatch::{CallFuture, CallOutput, ComputeBackend, Invoker, WaitEngine, WaitMode, WaitOptions};
use cumulo_job::{FunctionBundle, InputSource, JobBuilder, JobOptions, layout, partition};

use crate::cleaner::purge_job_prefixes;
use crate::session::SharedSession;

/// Options of one `map_reduce` run.
#[derive(Debug, Clone, Default)]
pub struct MapReduceOptions {
    /// Chunk size for partitioning the input; `None` disables chunking.
    pub chunk_size: Option<u64>,
    /// Dispatch one reducer per discovered source object instead of one
    /// global reducer, slicing the flat map-result list by the
    /// partitioner's per-object counts.
    pub reducer_one_per_object: bool,
    /// Build options shared by the map and reduce jobs.
    pub job: JobOptions,
}

/// Client-facing executor bound to one session.
pub struct FunctionExecutor {
    session: SharedSession,
    builder: JobBuilder,
    invoker: Invoker,
    waiter: WaitEngine,
    issued_jobs: Mutex<Vec<JobId>>,
}

impl FunctionExecutor {
    pub fn new(session: SharedSession) -> Self {
        let storage = Arc::clone(session.storage());
        let config = Arc::clone(session.config());
        let mut waiter = WaitEngine::new(Arc::clone(&storage), Arc::clone(&config));
        if let Some(feed) = session.feed() {
            waiter = waiter.with_feed(Arc::clone(feed));
        }
        Self {
            builder: JobBuilder::new(Arc::clone(&storage), Arc::clone(&config)),
            invoker: Invoker::new(Arc::clone(session.compute()), storage, config),
            waiter,
            issued_jobs: Mutex::new(Vec::new()),
            session,
        }
    }

    pub fn session(&self) -> &SharedSession {
        &self.session
    }

    /// Applies `function` to every argument set, one call per set, and
    /// returns the call futures in call-id order.
    pub async fn map(
        &self,
        function: &FunctionBundle,
        args: Vec<Value>,
        opts: &JobOptions,
    ) -> Result<Vec<CallFuture>> {
        self.submit(JobKind::Map, function, args, opts).await
    }

    /// Dispatches a single asynchronous call.
    pub async fn call_async(
        &self,
        function: &FunctionBundle,
        arg: Value,
        opts: &JobOptions,
    ) -> Result<CallFuture> {
        let mut futures = self.submit(JobKind::Async, function, vec![arg], opts).await?;
        Ok(futures.pop().expect("single-call job yields one future"))
    }

    /// Partitions `source`, maps over the partitions, then dispatches the
    /// reduce phase over the collected map results.
    ///
    /// The map results are collected client-side and regrouped before the
    /// reduce dispatch: with `reducer_one_per_object` the flat result list
    /// is sliced by the partitioner's per-object counts (prefix sums), so
    /// each reducer sees exactly the results of one source object's
    /// partitions; otherwise a single reducer sees everything. Returns the
    /// reducer futures.
    pub async fn map_reduce(
        &self,
        map_function: &FunctionBundle,
        source: &InputSource,
        reduce_function: &FunctionBundle,
        opts: &MapReduceOptions,
    ) -> Result<Vec<CallFuture>> {
        let plan = partition(source, opts.chunk_size, self.session.storage().as_ref()).await?;
        let map_args: Vec<Value> = plan.partitions.iter().map(|p| p.to_args()).collect();
        let map_futures = self
            .submit(JobKind::Map, map_function, map_args, &opts.job)
            .await?;
        let map_results = self.get_result(map_futures, None).await?;

        let groups: Vec<Vec<Value>> = if opts.reducer_one_per_object {
            let mut groups = Vec::with_capacity(plan.parts_per_object.len());
            let mut offset = 0;
            for count in &plan.parts_per_object {
                groups.push(map_results[offset..offset + count].to_vec());
                offset += count;
            }
            groups
        } else {
            vec![map_results]
        };
        // Each reducer receives its group as one positional argument.
        let reduce_args: Vec<Value> = groups
            .into_iter()
            .map(|group| Value::Array(vec![Value::Array(group)]))
            .collect();
        self.submit(JobKind::Reduce, reduce_function, reduce_args, &opts.job)
            .await
    }

    /// Partitions `futures` into `(done, not_done)`; see
    /// [`WaitEngine::wait`].
    pub async fn wait(
        &self,
        futures: Vec<CallFuture>,
        mode: WaitMode,
        opts: &WaitOptions,
    ) -> Result<(Vec<CallFuture>, Vec<CallFuture>)> {
        self.waiter.wait(futures, mode, opts).await
    }

    /// Waits for all futures (spawned children included), downloads their
    /// outputs, and returns the values in job/call order.
    ///
    /// The first remote failure is raised. On a `timeout` expiry the values
    /// resolved so far are returned (soft budget, matching `wait`).
    pub async fn get_result(
        &self,
        futures: Vec<CallFuture>,
        timeout: Option<Duration>,
    ) -> Result<Vec<Value>> {
        let opts = WaitOptions {
            download_results: true,
            timeout,
        };
        let (mut done, not_done) = self
            .waiter
            .wait(futures, WaitMode::AllCompleted, &opts)
            .await?;
        if !not_done.is_empty() {
            warn!(
                pending = not_done.len(),
                operator = "FunctionExecutor",
                "returning partial results after wait budget expiry"
            );
        }
        done.sort_by(|a, b| {
            (a.key().job_id.as_str(), a.key().call_id.as_str())
                .cmp(&(b.key().job_id.as_str(), b.key().call_id.as_str()))
        });
        let mut values = Vec::with_capacity(done.len());
        for future in &done {
            if let Some(err) = future.remote_error() {
                return Err(err.clone().into());
            }
            match future.output() {
                Some(CallOutput::Value(value)) => values.push(value.clone()),
                // A spawned call contributes through its children.
                Some(CallOutput::Spawned(_)) | None => {}
            }
        }
        Ok(values)
    }

    /// Deletes every storage object of the jobs this executor issued, in a
    /// background task. The caller path never blocks on cleanup.
    pub fn clean(&self) -> tokio::task::JoinHandle<()> {
        let jobs = self.issued_jobs.lock().expect("issued-jobs lock").clone();
        let storage = Arc::clone(self.session.storage());
        let config = Arc::clone(self.session.config());
        let executor_id = self.session.executor_id().clone();
        tokio::spawn(async move {
            let prefixes: Vec<String> = jobs
                .iter()
                .map(|job_id| {
                    format!("{}/", layout::job_prefix(&config.storage_prefix, &executor_id, job_id))
                })
                .collect();
            match purge_job_prefixes(
                storage,
                &config.storage_bucket,
                executor_id.as_str(),
                &prefixes,
            )
            .await
            {
                Ok(deleted) => info!(
                    executor_id = %executor_id,
                    jobs = jobs.len(),
                    deleted,
                    operator = "Cleaner",
                    "job objects cleaned"
                ),
                Err(e) => error!(
                    executor_id = %executor_id,
                    error = %e,
                    operator = "Cleaner",
                    "cleanup failed"
                ),
            }
        })
    }

    async fn submit(
        &self,
        kind: JobKind,
        function: &FunctionBundle,
        args: Vec<Value>,
        opts: &JobOptions,
    ) -> Result<Vec<CallFuture>> {
        let executor_id: &ExecutorId = self.session.executor_id();
        let job_id = self.session.next_job_id(kind);
        let preinstalled = self
            .session
            .compute()
            .preinstalled_modules(&self.session.config().runtime_name);
        let job = self
            .builder
            .build_job(executor_id, &job_id, function, &args, &preinstalled, opts)
            .await?;
        self.session.metrics().record_job_built(
            executor_id.as_str(),
            kind_label(kind),
            job.total_calls as u64,
        );
        let bindings: Vec<String> = opts
            .extra_bindings
            .iter()
            .map(|b| b.wire_name().to_string())
            .collect();
        let futures = self.invoker.run(&job, bindings).await?;
        info!(
            executor_id = %executor_id,
            job_id = %job_id,
            calls = futures.len(),
            operator = "FunctionExecutor",
            "job dispatched"
        );
        self.issued_jobs.lock().expect("issued-jobs lock").push(job_id);
        Ok(futures)
    }
}

fn kind_label(kind: JobKind) -> &'static str {
    match kind {
        JobKind::Map => "map",
        JobKind::Reduce => "reduce",
        JobKind::Async => "async",
    }
}
