//! Per-call future: the client-side lifecycle state machine of one remote
//! invocation.
//!
//! Lifecycle:
//! - `New`: constructed but not yet dispatched;
//! - `Invoked`: dispatched, no status observed yet;
//! - `Ready`: a status object was observed, outcome known;
//! - `Success` / `Error` / `Spawned`: terminal. `Spawned` is the redirect
//!   state of a call whose result is itself a set of further calls to track.
//!
//! A future is mutated only client-side (by the wait engines and by
//! `status()`/`result()`); workers communicate exclusively through the
//! storage/feed content addressed by the future's call key.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::debug;

use cumulo_common::{
    ActivationId, CallKey, CumuloError, ExecutorConfig, RemoteError, Result, global_metrics,
};
use cumulo_job::envelope::{CallStatus, ResultEnvelope};
use cumulo_job::layout;
use cumulo_storage::StorageBackend;

/// Lifecycle states of one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Constructed but not yet dispatched.
    New,
    /// Dispatched; no status observed yet.
    Invoked,
    /// Status observed; output not yet fetched.
    Ready,
    /// Output fetched and decoded.
    Success,
    /// The call failed remotely.
    Error,
    /// The call's result is a set of further calls to track.
    Spawned,
}

/// A resolved call output.
#[derive(Debug, Clone)]
pub enum CallOutput {
    /// The call's return value.
    Value(serde_json::Value),
    /// Child futures the caller must continue waiting on instead of this
    /// call.
    Spawned(Vec<CallFuture>),
}

/// Client-side handle tracking one call's lifecycle and result.
#[derive(Clone)]
pub struct CallFuture {
    key: CallKey,
    status_key: String,
    output_key: String,
    state: CallState,
    activation_id: Option<ActivationId>,
    host_submit_time: Option<f64>,
    host_invoke_time: Option<f64>,
    status: Option<CallStatus>,
    output: Option<CallOutput>,
    error: Option<RemoteError>,
    storage: Arc<dyn StorageBackend>,
    config: Arc<ExecutorConfig>,
}

impl fmt::Debug for CallFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallFuture")
            .field("key", &self.key)
            .field("state", &self.state)
            .field("activation_id", &self.activation_id)
            .finish_non_exhaustive()
    }
}

impl CallFuture {
    /// Builds a not-yet-dispatched future for `key`.
    pub fn new(key: CallKey, storage: Arc<dyn StorageBackend>, config: Arc<ExecutorConfig>) -> Self {
        let prefix = &config.storage_prefix;
        Self {
            status_key: layout::status_key(prefix, &key),
            output_key: layout::output_key(prefix, &key),
            key,
            state: CallState::New,
            activation_id: None,
            host_submit_time: None,
            host_invoke_time: None,
            status: None,
            output: None,
            error: None,
            storage,
            config,
        }
    }

    /// Builds a future for a call dispatched elsewhere (a spawned child),
    /// starting in `Invoked` with no activation id.
    pub fn tracked(
        key: CallKey,
        storage: Arc<dyn StorageBackend>,
        config: Arc<ExecutorConfig>,
    ) -> Self {
        let mut fut = Self::new(key, storage, config);
        fut.state = CallState::Invoked;
        fut
    }

    /// Records a successful dispatch.
    pub fn mark_invoked(
        &mut self,
        activation_id: ActivationId,
        host_submit_time: f64,
        host_invoke_time: f64,
    ) {
        self.activation_id = Some(activation_id);
        self.host_submit_time = Some(host_submit_time);
        self.host_invoke_time = Some(host_invoke_time);
        self.state = CallState::Invoked;
    }

    /// The call's unique `(executor_id, job_id, call_id)` triple.
    pub fn key(&self) -> &CallKey {
        &self.key
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CallState {
        self.state
    }

    /// Activation id assigned by the compute backend, once dispatched.
    pub fn activation_id(&self) -> Option<&ActivationId> {
        self.activation_id.as_ref()
    }

    /// Host-side submit timestamp (epoch seconds), once dispatched.
    pub fn host_submit_time(&self) -> Option<f64> {
        self.host_submit_time
    }

    /// Host-side invoke-completion timestamp (epoch seconds), once
    /// dispatched.
    pub fn host_invoke_time(&self) -> Option<f64> {
        self.host_invoke_time
    }

    /// The cached remote status, once observed.
    pub fn run_status(&self) -> Option<&CallStatus> {
        self.status.as_ref()
    }

    /// The cached remote failure, once classified.
    pub fn remote_error(&self) -> Option<&RemoteError> {
        self.error.as_ref()
    }

    /// The cached output, once resolved.
    pub fn output(&self) -> Option<&CallOutput> {
        self.output.as_ref()
    }

    /// The child futures of a `Spawned` call.
    pub fn spawned_children(&self) -> Option<&[CallFuture]> {
        match &self.output {
            Some(CallOutput::Spawned(children)) => Some(children),
            _ => None,
        }
    }

    /// True once a status has been observed (`Ready` or terminal).
    pub fn completed(&self) -> bool {
        !matches!(self.state, CallState::New | CallState::Invoked)
    }

    /// True in a terminal state.
    pub fn terminal(&self) -> bool {
        matches!(
            self.state,
            CallState::Success | CallState::Error | CallState::Spawned
        )
    }

    /// Remote cancellation is not supported by the execution model; a
    /// dispatched call cannot be killed from the orchestrator.
    pub fn cancel(&self) -> Result<()> {
        Err(CumuloError::Unsupported(
            "remote cancellation is not supported".to_string(),
        ))
    }

    fn ensure_dispatched(&self) -> Result<()> {
        if self.state == CallState::New {
            return Err(CumuloError::State("job not yet invoked".to_string()));
        }
        Ok(())
    }

    /// Feeds an externally observed status document into the state machine.
    ///
    /// Used by the wait engines so a status learned from a listing, a direct
    /// probe, or a feed message is ingested exactly once. No-op once the
    /// future has already left `Invoked`.
    pub fn ingest_status(&mut self, status: CallStatus) {
        if self.completed() {
            return;
        }
        if let Some(err) = status.remote_error() {
            self.error = Some(err);
            self.state = CallState::Error;
        } else {
            self.state = CallState::Ready;
        }
        self.status = Some(status);
    }

    /// One direct status probe: fetches the status object if present and
    /// ingests it. Returns whether the call is now completed. A missing
    /// object is the expected eventually-consistent gap, not an error.
    pub async fn poll_status_once(&mut self) -> Result<bool> {
        if self.completed() {
            return Ok(true);
        }
        self.ensure_dispatched()?;
        match self
            .storage
            .get_object(&self.config.storage_bucket, &self.status_key, None)
            .await
        {
            Ok(raw) => {
                let status = CallStatus::decode(&raw)?;
                self.ingest_status(status);
                Ok(true)
            }
            Err(CumuloError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Blocks until the call's status object is visible, then interprets it.
    ///
    /// On a worker-reported failure the classified error is raised when
    /// `throw` is set, otherwise `None` is returned and the future stays in
    /// `Error`.
    ///
    /// # Errors
    /// [`CumuloError::State`] when the call was never dispatched.
    pub async fn status(&mut self, throw: bool) -> Result<Option<CallStatus>> {
        self.ensure_dispatched()?;
        while !self.poll_status_once().await? {
            sleep(Duration::from_millis(self.config.status_poll_interval_ms)).await;
        }
        match &self.error {
            Some(err) if throw => Err(err.clone().into()),
            Some(_) => Ok(None),
            None => Ok(self.status.clone()),
        }
    }

    /// Blocks until the call's output is retrievable and returns it.
    ///
    /// A call whose result is itself a set of futures transitions to
    /// `Spawned` and returns the child futures; the caller must continue
    /// waiting on those instead. Terminal results are cached: repeated
    /// calls return the cached value without touching storage.
    ///
    /// # Errors
    /// - [`CumuloError::State`] when the call was never dispatched;
    /// - [`CumuloError::Storage`] ("unable to get output") once the output
    ///   fetch retry ceiling is hit;
    /// - the classified remote error, when `throw` is set and the call
    ///   failed.
    pub async fn result(&mut self, throw: bool) -> Result<Option<CallOutput>> {
        self.ensure_dispatched()?;
        if let Some(output) = &self.output {
            return Ok(Some(output.clone()));
        }
        if self.state != CallState::Error {
            self.status(false).await?;
        }
        if self.state == CallState::Error {
            let err = self.error.clone().unwrap_or_else(|| {
                RemoteError::new(
                    cumulo_common::RemoteErrorKind::User {
                        type_name: "unknown".to_string(),
                    },
                    "call failed with no recorded error",
                )
            });
            return if throw { Err(err.into()) } else { Ok(None) };
        }

        let envelope = self.fetch_envelope().await?;
        global_metrics()
            .inc_results_downloaded(self.key.executor_id.as_str(), self.key.job_id.as_str());

        if let Some(children) = envelope.spawned {
            let futures: Vec<CallFuture> = children
                .into_iter()
                .map(|key| {
                    CallFuture::tracked(key, Arc::clone(&self.storage), Arc::clone(&self.config))
                })
                .collect();
            debug!(
                key = %self.key,
                children = futures.len(),
                operator = "CallFuture",
                "call redirected to spawned futures"
            );
            self.state = CallState::Spawned;
            self.output = Some(CallOutput::Spawned(futures));
            return Ok(self.output.clone());
        }

        if !envelope.success {
            let err = envelope
                .error
                .as_ref()
                .map(|record| record.to_remote_error())
                .unwrap_or_else(|| {
                    RemoteError::new(
                        cumulo_common::RemoteErrorKind::User {
                            type_name: "unknown".to_string(),
                        },
                        "envelope reports failure with no error record",
                    )
                });
            self.error = Some(err.clone());
            self.state = CallState::Error;
            return if throw { Err(err.into()) } else { Ok(None) };
        }

        let value = envelope.decode_value()?.unwrap_or(serde_json::Value::Null);
        self.state = CallState::Success;
        self.output = Some(CallOutput::Value(value));
        Ok(self.output.clone())
    }

    /// Fetches the output envelope, retrying over the status-to-output
    /// visibility gap.
    async fn fetch_envelope(&self) -> Result<ResultEnvelope> {
        let mut attempt = 0u32;
        loop {
            match self
                .storage
                .get_object(&self.config.storage_bucket, &self.output_key, None)
                .await
            {
                Ok(raw) => return ResultEnvelope::decode(&raw),
                Err(CumuloError::NotFound(_)) => {
                    if attempt >= self.config.output_fetch_retries {
                        return Err(CumuloError::Storage(format!(
                            "unable to get output of call {}",
                            self.key
                        )));
                    }
                    attempt += 1;
                    sleep(Duration::from_millis(self.config.output_fetch_backoff_ms)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
