//! Wait/monitor engine: determines which of a set of call futures are
//! complete and optionally retrieves their results.
//!
//! Two implementations sit behind one contract:
//! - storage polling: per round, one bulk prefix listing per tracked job
//!   (cheap, amortized over all calls) plus a bounded number of direct
//!   per-call status probes for the stragglers a lagging listing misses;
//! - push feed: one subscriber per tracked job topic, consuming status
//!   documents the workers publish themselves.
//!
//! Both modes merge newly spawned child futures into the tracked set, and
//! both release their background work (probe streams, subscriptions) on
//! completion or error.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep, timeout, timeout_at};
use tracing::{debug, warn};

use cumulo_common::{CallKey, CumuloError, ExecutorConfig, ExecutorId, JobId, Result, global_metrics};
use cumulo_job::envelope::CallStatus;
use cumulo_job::layout;
use cumulo_storage::StorageBackend;

use crate::feed::{StatusFeed, job_topic};
use crate::future::{CallFuture, CallState};

/// When a `wait` call returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// Return once every tracked future is accounted for.
    AllCompleted,
    /// Return as soon as at least one future resolves.
    AnyCompleted,
    /// Perform exactly one observation round and return what is known.
    Always,
}

impl WaitMode {
    fn label(self) -> &'static str {
        match self {
            WaitMode::AllCompleted => "all",
            WaitMode::AnyCompleted => "any",
            WaitMode::Always => "always",
        }
    }
}

/// Per-wait behavior knobs.
#[derive(Debug, Clone)]
pub struct WaitOptions {
    /// Fetch and decode output envelopes for completed calls.
    pub download_results: bool,
    /// Soft client-side budget: on expiry the partial done/not-done split is
    /// returned without further blocking. Remote work may still complete
    /// and write to storage afterwards.
    pub timeout: Option<Duration>,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            download_results: true,
            timeout: None,
        }
    }
}

/// Completion monitor over a storage backend and an optional push feed.
pub struct WaitEngine {
    storage: Arc<dyn StorageBackend>,
    feed: Option<Arc<dyn StatusFeed>>,
    config: Arc<ExecutorConfig>,
}

impl WaitEngine {
    pub fn new(storage: Arc<dyn StorageBackend>, config: Arc<ExecutorConfig>) -> Self {
        Self {
            storage,
            feed: None,
            config,
        }
    }

    /// Switches the engine to push-based monitoring.
    pub fn with_feed(mut self, feed: Arc<dyn StatusFeed>) -> Self {
        self.feed = Some(feed);
        self
    }

    /// Partitions `futures` into `(done, not_done)` according to `mode`.
    ///
    /// Futures that spawn further calls are resolved into the `done` set
    /// while their children join the tracked set and are themselves waited
    /// on. The relative order of returned futures is not specified.
    pub async fn wait(
        &self,
        futures: Vec<CallFuture>,
        mode: WaitMode,
        opts: &WaitOptions,
    ) -> Result<(Vec<CallFuture>, Vec<CallFuture>)> {
        if futures.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }
        match &self.feed {
            Some(feed) => self.feed_wait(Arc::clone(feed), futures, mode, opts).await,
            None => self.poll_wait(futures, mode, opts).await,
        }
    }

    async fn poll_wait(
        &self,
        futures: Vec<CallFuture>,
        mode: WaitMode,
        opts: &WaitOptions,
    ) -> Result<(Vec<CallFuture>, Vec<CallFuture>)> {
        let deadline = opts.timeout.map(|t| Instant::now() + t);
        let executor_label = futures[0].key().executor_id.as_str().to_string();
        let mut known: HashSet<CallKey> = futures.iter().map(|f| f.key().clone()).collect();
        let mut done = Vec::new();
        let mut pending = Vec::new();
        for f in futures {
            if f.completed() {
                done.push(f);
            } else {
                pending.push(f);
            }
        }
        self.resolve_completed(&mut done, &mut pending, &mut known, opts.download_results)
            .await?;

        loop {
            if pending.is_empty() {
                break;
            }
            if mode == WaitMode::AnyCompleted && !done.is_empty() {
                break;
            }

            global_metrics().inc_wait_rounds(&executor_label, mode.label());
            let listed = self.list_done_calls(&pending).await?;
            let fetched = self.probe_statuses(&pending, &listed, mode).await?;
            for (key, status) in fetched {
                if let Some(f) = pending.iter_mut().find(|f| f.key() == &key) {
                    f.ingest_status(status);
                }
            }
            self.resolve_completed(&mut done, &mut pending, &mut known, opts.download_results)
                .await?;

            if mode == WaitMode::Always {
                break;
            }
            if pending.is_empty() {
                break;
            }
            if mode == WaitMode::AnyCompleted && !done.is_empty() {
                break;
            }

            let mut pause = self.round_sleep(done.len(), done.len() + pending.len());
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    warn!(
                        pending = pending.len(),
                        operator = "WaitEngine",
                        "client-side wait budget expired; returning partial split"
                    );
                    break;
                }
                pause = pause.min(deadline - now);
            }
            sleep(pause).await;
        }
        Ok((done, pending))
    }

    /// One bulk listing per tracked job, intersected down to call keys with
    /// a visible status object.
    async fn list_done_calls(&self, pending: &[CallFuture]) -> Result<HashSet<CallKey>> {
        let mut jobs: HashMap<(ExecutorId, JobId), String> = HashMap::new();
        for f in pending {
            let key = f.key();
            jobs.entry((key.executor_id.clone(), key.job_id.clone()))
                .or_insert_with(|| {
                    format!(
                        "{}/",
                        layout::job_prefix(
                            &self.config.storage_prefix,
                            &key.executor_id,
                            &key.job_id
                        )
                    )
                });
        }
        let mut listed = HashSet::new();
        for ((executor_id, job_id), prefix) in jobs {
            let keys = self
                .storage
                .list_keys(&self.config.storage_bucket, &prefix)
                .await?;
            for key in keys {
                if let Some(call_id) = layout::call_id_of_status_key(&key) {
                    listed.insert(CallKey {
                        executor_id: executor_id.clone(),
                        job_id: job_id.clone(),
                        call_id,
                    });
                }
            }
        }
        Ok(listed)
    }

    /// Fetches status documents for this round's candidates: every pending
    /// call the listing confirmed, plus at most `wait_direct_query_limit`
    /// unconfirmed stragglers. A candidate whose direct fetch says
    /// not-found (listing lag) simply stays pending for the round.
    async fn probe_statuses(
        &self,
        pending: &[CallFuture],
        listed: &HashSet<CallKey>,
        mode: WaitMode,
    ) -> Result<Vec<(CallKey, CallStatus)>> {
        let executor_label = pending
            .first()
            .map(|f| f.key().executor_id.as_str().to_string())
            .unwrap_or_default();
        let mut probes: Vec<(CallKey, String)> = Vec::new();
        let mut listed_probes = 0u64;
        for f in pending {
            if listed.contains(f.key()) {
                probes.push((
                    f.key().clone(),
                    layout::status_key(&self.config.storage_prefix, f.key()),
                ));
                listed_probes += 1;
            }
        }
        let mut direct_probes = 0u64;
        for f in pending {
            if direct_probes as usize >= self.config.wait_direct_query_limit {
                break;
            }
            if !listed.contains(f.key()) {
                probes.push((
                    f.key().clone(),
                    layout::status_key(&self.config.storage_prefix, f.key()),
                ));
                direct_probes += 1;
            }
        }
        global_metrics().inc_status_fetches(&executor_label, "list", listed_probes);
        global_metrics().inc_status_fetches(&executor_label, "direct", direct_probes);

        let storage = Arc::clone(&self.storage);
        let bucket = self.config.storage_bucket.clone();
        let mut stream = futures::stream::iter(probes.into_iter().map(|(key, status_key)| {
            let storage = Arc::clone(&storage);
            let bucket = bucket.clone();
            async move {
                match storage.get_object(&bucket, &status_key, None).await {
                    Ok(raw) => Ok(Some((key, CallStatus::decode(&raw)?))),
                    Err(CumuloError::NotFound(_)) => Ok(None),
                    Err(e) => Err(e),
                }
            }
        }))
        .buffer_unordered(self.config.wait_concurrent_status_fetches);

        let mut found = Vec::new();
        while let Some(item) = stream.next().await {
            if let Some(pair) = item? {
                found.push(pair);
                // Early stop: one resolution satisfies an any-completed wait.
                if mode == WaitMode::AnyCompleted {
                    break;
                }
            }
        }
        Ok(found)
    }

    /// Moves completed futures from `pending` into `done`, fetching output
    /// envelopes where required and merging spawned children into the
    /// tracked set.
    ///
    /// An envelope is fetched when results were requested, and also for any
    /// future whose status carries a spawn marker: the child call keys only
    /// exist in the envelope, and both wait modes must grow their tracked
    /// set from them.
    async fn resolve_completed(
        &self,
        done: &mut Vec<CallFuture>,
        pending: &mut Vec<CallFuture>,
        known: &mut HashSet<CallKey>,
        download_results: bool,
    ) -> Result<()> {
        let (completed, still): (Vec<_>, Vec<_>) =
            std::mem::take(pending).into_iter().partition(CallFuture::completed);
        *pending = still;
        if completed.is_empty() {
            return Ok(());
        }

        let mut stream = futures::stream::iter(completed.into_iter().map(|mut f| async move {
            let spawned = f
                .run_status()
                .and_then(CallStatus::spawned_marker)
                .is_some();
            if (download_results || spawned) && !f.terminal() {
                f.result(false).await?;
            }
            Ok::<CallFuture, CumuloError>(f)
        }))
        .buffer_unordered(self.config.wait_concurrent_status_fetches);

        while let Some(resolved) = stream.next().await {
            let f = resolved?;
            if f.state() == CallState::Spawned {
                let children: Vec<CallFuture> = f
                    .spawned_children()
                    .unwrap_or_default()
                    .iter()
                    .filter(|c| known.insert(c.key().clone()))
                    .cloned()
                    .collect();
                debug!(
                    key = %f.key(),
                    children = children.len(),
                    operator = "WaitEngine",
                    "tracking spawned futures"
                );
                pending.extend(children);
            }
            done.push(f);
        }
        Ok(())
    }

    fn round_sleep(&self, done: usize, total: usize) -> Duration {
        let total = total.max(1);
        let frac = done as f64 / total as f64;
        let base = self.config.wait_poll_interval_ms as f64;
        let ms = (base * (1.0 - frac)).max(self.config.wait_min_poll_interval_ms as f64);
        Duration::from_millis(ms as u64)
    }

    async fn feed_wait(
        &self,
        feed: Arc<dyn StatusFeed>,
        futures: Vec<CallFuture>,
        mode: WaitMode,
        opts: &WaitOptions,
    ) -> Result<(Vec<CallFuture>, Vec<CallFuture>)> {
        let deadline = opts.timeout.map(|t| Instant::now() + t);
        let executor_label = futures[0].key().executor_id.as_str().to_string();
        let mut known: HashSet<CallKey> = futures.iter().map(|f| f.key().clone()).collect();
        let mut done = Vec::new();
        let mut pending = Vec::new();
        for f in futures {
            if f.completed() {
                done.push(f);
            } else {
                pending.push(f);
            }
        }
        self.resolve_completed(&mut done, &mut pending, &mut known, opts.download_results)
            .await?;
        if pending.is_empty() || (mode == WaitMode::AnyCompleted && !done.is_empty()) {
            return Ok((done, pending));
        }

        // One subscriber per distinct job; forwarders merge every
        // subscription into a single channel and are aborted on return.
        let (tx, mut rx) = mpsc::channel::<CallStatus>(1024);
        let mut forwarders = JoinSet::new();
        let mut topics = HashSet::new();
        for f in &pending {
            let topic = job_topic(f.key());
            if topics.insert(topic.clone()) {
                subscribe_topic(&feed, &topic, &tx, &mut forwarders).await?;
            }
        }

        loop {
            if pending.is_empty() {
                break;
            }
            if mode == WaitMode::AnyCompleted && !done.is_empty() {
                break;
            }

            let message = match mode {
                // One observation round: drain whatever arrives promptly,
                // without blocking until completion.
                WaitMode::Always => match timeout(Duration::from_millis(100), rx.recv()).await {
                    Ok(msg) => msg,
                    Err(_) => None,
                },
                _ => match deadline {
                    Some(deadline) => match timeout_at(deadline, rx.recv()).await {
                        Ok(msg) => msg,
                        Err(_) => {
                            warn!(
                                pending = pending.len(),
                                operator = "WaitEngine",
                                "client-side wait budget expired; returning partial split"
                            );
                            break;
                        }
                    },
                    None => rx.recv().await,
                },
            };
            let Some(status) = message else {
                if mode == WaitMode::Always {
                    break;
                }
                return Err(CumuloError::Storage(
                    "status feed closed while calls were pending".to_string(),
                ));
            };
            global_metrics().inc_status_fetches(&executor_label, "feed", 1);

            // A spawn marker grows the expected set: child call ids are the
            // zero-padded sequence below the advertised count, and the new
            // job gets its own subscription.
            if let Some((job_id, count)) = status.spawned_marker() {
                let executor_id = status.executor_id.clone();
                for index in 0..count {
                    let key = CallKey::new(executor_id.clone(), job_id.clone(), index);
                    if known.insert(key.clone()) {
                        pending.push(CallFuture::tracked(
                            key,
                            Arc::clone(&self.storage),
                            Arc::clone(&self.config),
                        ));
                    }
                }
                let topic = format!("{executor_id}/{job_id}");
                if topics.insert(topic.clone()) {
                    subscribe_topic(&feed, &topic, &tx, &mut forwarders).await?;
                }
            }

            let status_key = status.call_key();
            if let Some(f) = pending.iter_mut().find(|f| f.key() == &status_key) {
                f.ingest_status(status);
            }
            self.resolve_completed(&mut done, &mut pending, &mut known, opts.download_results)
                .await?;
        }

        // Dropping the join set aborts the forwarders, releasing every
        // subscription.
        drop(forwarders);
        Ok((done, pending))
    }
}

async fn subscribe_topic(
    feed: &Arc<dyn StatusFeed>,
    topic: &str,
    tx: &mpsc::Sender<CallStatus>,
    forwarders: &mut JoinSet<()>,
) -> Result<()> {
    let mut subscription = feed.subscribe(topic).await?;
    let tx = tx.clone();
    forwarders.spawn(async move {
        while let Some(status) = subscription.recv().await {
            if tx.send(status).await.is_err() {
                break;
            }
        }
    });
    Ok(())
}
