//! Invoker: rate-limited concurrent dispatch of one job's calls.
//!
//! Responsibilities:
//! - pull pending calls from a shared queue with a bounded dispatcher pool;
//! - gate in-flight dispatch attempts with a pre-loaded token bucket (a
//!   semaphore: tokens are loaded once per run and never refill);
//! - retry backend refusals with bounded jittered backoff;
//! - record host-side timing metadata on every future.
//!
//! The invoker never blocks on call completion; it only holds a token while
//! the dispatch network call itself is outstanding. Exhausting the retry
//! budget for any single call fails the whole job, since job completeness
//! depends on every call.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, warn};

use cumulo_common::{CumuloError, ExecutorConfig, Result, global_metrics};
use cumulo_job::descriptor::{InvocationPayload, JobDescription, epoch_secs};
use cumulo_storage::StorageBackend;

use crate::compute::ComputeBackend;
use crate::future::CallFuture;

#[derive(Debug, Clone, Copy)]
struct PendingCall {
    index: u32,
    attempt: u32,
}

struct RunState {
    queue: Mutex<VecDeque<PendingCall>>,
    slots: Semaphore,
    remaining: AtomicU32,
    results: Mutex<Vec<Option<CallFuture>>>,
    failure: Mutex<Option<CumuloError>>,
}

/// Dispatches job descriptions through a compute backend.
pub struct Invoker {
    compute: Arc<dyn ComputeBackend>,
    storage: Arc<dyn StorageBackend>,
    config: Arc<ExecutorConfig>,
}

impl Invoker {
    pub fn new(
        compute: Arc<dyn ComputeBackend>,
        storage: Arc<dyn StorageBackend>,
        config: Arc<ExecutorConfig>,
    ) -> Self {
        Self {
            compute,
            storage,
            config,
        }
    }

    /// Dispatches every call of `job`, returning one future per call in
    /// call-id order.
    ///
    /// # Errors
    /// [`CumuloError::Dispatch`] when any call exhausts its retry budget, and
    /// any transport error the backend surfaces. Either is fatal to the job.
    pub async fn run(
        &self,
        job: &JobDescription,
        extra_bindings: Vec<String>,
    ) -> Result<Vec<CallFuture>> {
        let total = job.total_calls;
        if total == 0 {
            return Ok(Vec::new());
        }
        let state = Arc::new(RunState {
            queue: Mutex::new((0..total).map(|index| PendingCall { index, attempt: 0 }).collect()),
            slots: Semaphore::new(self.config.worker_slots),
            remaining: AtomicU32::new(total),
            results: Mutex::new(vec![None; total as usize]),
            failure: Mutex::new(None),
        });
        let job = Arc::new(job.clone());
        let extra_bindings = Arc::new(extra_bindings);

        let pool = self.config.invoke_pool_threads.min(total as usize).max(1);
        let mut workers = JoinSet::new();
        for _ in 0..pool {
            let state = Arc::clone(&state);
            let job = Arc::clone(&job);
            let extra_bindings = Arc::clone(&extra_bindings);
            let compute = Arc::clone(&self.compute);
            let storage = Arc::clone(&self.storage);
            let config = Arc::clone(&self.config);
            workers.spawn(async move {
                dispatch_loop(state, job, extra_bindings, compute, storage, config).await;
            });
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                return Err(CumuloError::Dispatch(format!("dispatcher task failed: {e}")));
            }
        }

        if let Some(err) = state.failure.lock().await.take() {
            return Err(err);
        }
        let mut results = state.results.lock().await;
        let futures: Vec<CallFuture> = results
            .iter_mut()
            .map(|slot| slot.take().expect("every call dispatched"))
            .collect();
        Ok(futures)
    }
}

async fn dispatch_loop(
    state: Arc<RunState>,
    job: Arc<JobDescription>,
    extra_bindings: Arc<Vec<String>>,
    compute: Arc<dyn ComputeBackend>,
    storage: Arc<dyn StorageBackend>,
    config: Arc<ExecutorConfig>,
) {
    loop {
        if state.remaining.load(Ordering::Acquire) == 0 {
            return;
        }
        let call = state.queue.lock().await.pop_front();
        let Some(call) = call else {
            // Retries still in flight on other dispatchers may re-enqueue.
            sleep(Duration::from_millis(20)).await;
            continue;
        };

        let permit = match state.slots.acquire().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        global_metrics().set_inflight_dispatches(
            job.executor_id.as_str(),
            (config.worker_slots - state.slots.available_permits()) as i64,
        );
        let payload = InvocationPayload::for_call(
            &job,
            &config.storage_prefix,
            call.index,
            extra_bindings.as_ref().clone(),
        );
        let submit_time = payload.host_submit_time;
        let started = Instant::now();
        let outcome = compute
            .invoke(&job.runtime_name, job.runtime_memory_mb, &payload)
            .await;
        drop(permit);

        match outcome {
            Ok(Some(activation_id)) => {
                global_metrics().record_invoke(
                    job.executor_id.as_str(),
                    job.job_id.as_str(),
                    started.elapsed().as_secs_f64(),
                );
                debug!(
                    key = %job.call_key(call.index),
                    activation_id = %activation_id,
                    attempt = call.attempt,
                    operator = "InvokerDispatch",
                    "call dispatched"
                );
                let mut future = CallFuture::new(
                    job.call_key(call.index),
                    Arc::clone(&storage),
                    Arc::clone(&config),
                );
                future.mark_invoked(activation_id, submit_time, epoch_secs());
                state.results.lock().await[call.index as usize] = Some(future);
                state.remaining.fetch_sub(1, Ordering::AcqRel);
            }
            Ok(None) => {
                let next_attempt = call.attempt + 1;
                if next_attempt > config.invoke_max_retries {
                    fail(
                        &state,
                        CumuloError::Dispatch(format!(
                            "call {} exhausted {} dispatch retries",
                            job.call_key(call.index),
                            config.invoke_max_retries
                        )),
                    )
                    .await;
                    return;
                }
                global_metrics()
                    .inc_invoke_retries(job.executor_id.as_str(), job.job_id.as_str());
                let backoff = jittered_backoff(&config.invoke_retry_backoff_ms, call.attempt);
                warn!(
                    key = %job.call_key(call.index),
                    attempt = next_attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    operator = "InvokerDispatch",
                    "backend refused dispatch; re-enqueueing"
                );
                sleep(backoff).await;
                state.queue.lock().await.push_back(PendingCall {
                    index: call.index,
                    attempt: next_attempt,
                });
            }
            Err(e) => {
                fail(&state, e).await;
                return;
            }
        }
    }
}

async fn fail(state: &RunState, err: CumuloError) {
    let mut failure = state.failure.lock().await;
    if failure.is_none() {
        *failure = Some(err);
    }
    state.remaining.store(0, Ordering::Release);
}

/// Draws the sleep before the `attempt`-th re-dispatch: the configured
/// backoff entry (the last one repeating) scaled by a 0.5–1.5 jitter factor.
fn jittered_backoff(backoff_ms: &[u64], attempt: u32) -> Duration {
    let base = backoff_ms
        .get(attempt as usize)
        .or(backoff_ms.last())
        .copied()
        .unwrap_or(1_000);
    let factor: f64 = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_millis((base as f64 * factor) as u64)
}
