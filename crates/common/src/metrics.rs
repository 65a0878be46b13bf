use std::sync::{Arc, OnceLock};

use prometheus::{CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};

#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    jobs_built: CounterVec,
    calls_invoked: CounterVec,
    invoke_retries: CounterVec,
    invoke_seconds: HistogramVec,
    inflight_dispatches: GaugeVec,
    wait_rounds: CounterVec,
    status_fetches: CounterVec,
    results_downloaded: CounterVec,
    objects_cleaned: CounterVec,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    pub fn record_job_built(&self, executor_id: &str, kind: &str, calls: u64) {
        self.inner
            .jobs_built
            .with_label_values(&[executor_id, kind])
            .inc_by(calls as f64);
    }

    pub fn record_invoke(&self, executor_id: &str, job_id: &str, secs: f64) {
        let labels = [executor_id, job_id];
        self.inner.calls_invoked.with_label_values(&labels).inc();
        self.inner
            .invoke_seconds
            .with_label_values(&labels)
            .observe(secs.max(0.0));
    }

    pub fn inc_invoke_retries(&self, executor_id: &str, job_id: &str) {
        self.inner
            .invoke_retries
            .with_label_values(&[executor_id, job_id])
            .inc();
    }

    pub fn set_inflight_dispatches(&self, executor_id: &str, inflight: i64) {
        self.inner
            .inflight_dispatches
            .with_label_values(&[executor_id])
            .set(inflight as f64);
    }

    pub fn inc_wait_rounds(&self, executor_id: &str, mode: &str) {
        self.inner
            .wait_rounds
            .with_label_values(&[executor_id, mode])
            .inc();
    }

    /// `channel` is one of `list`, `direct`, or `feed`.
    pub fn inc_status_fetches(&self, executor_id: &str, channel: &str, n: u64) {
        self.inner
            .status_fetches
            .with_label_values(&[executor_id, channel])
            .inc_by(n as f64);
    }

    pub fn inc_results_downloaded(&self, executor_id: &str, job_id: &str) {
        self.inner
            .results_downloaded
            .with_label_values(&[executor_id, job_id])
            .inc();
    }

    pub fn inc_objects_cleaned(&self, executor_id: &str, n: u64) {
        self.inner
            .objects_cleaned
            .with_label_values(&[executor_id])
            .inc_by(n as f64);
    }

    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&metric_families, &mut buf).is_err() {
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let jobs_built = CounterVec::new(
            Opts::new("cumulo_jobs_built_total", "Jobs built, weighted by call count"),
            &["executor_id", "kind"],
        )
        .expect("metric definition");
        let calls_invoked = CounterVec::new(
            Opts::new("cumulo_calls_invoked_total", "Successfully dispatched calls"),
            &["executor_id", "job_id"],
        )
        .expect("metric definition");
        let invoke_retries = CounterVec::new(
            Opts::new("cumulo_invoke_retries_total", "Re-dispatch attempts after backend refusals"),
            &["executor_id", "job_id"],
        )
        .expect("metric definition");
        let invoke_seconds = HistogramVec::new(
            HistogramOpts::new("cumulo_invoke_seconds", "Latency of one dispatch network call"),
            &["executor_id", "job_id"],
        )
        .expect("metric definition");
        let inflight_dispatches = GaugeVec::new(
            Opts::new("cumulo_inflight_dispatches", "Dispatch attempts currently holding a slot"),
            &["executor_id"],
        )
        .expect("metric definition");
        let wait_rounds = CounterVec::new(
            Opts::new("cumulo_wait_rounds_total", "Wait-engine polling rounds"),
            &["executor_id", "mode"],
        )
        .expect("metric definition");
        let status_fetches = CounterVec::new(
            Opts::new("cumulo_status_fetches_total", "Status observations by channel"),
            &["executor_id", "channel"],
        )
        .expect("metric definition");
        let results_downloaded = CounterVec::new(
            Opts::new("cumulo_results_downloaded_total", "Output envelopes fetched and decoded"),
            &["executor_id", "job_id"],
        )
        .expect("metric definition");
        let objects_cleaned = CounterVec::new(
            Opts::new("cumulo_objects_cleaned_total", "Storage objects deleted by the cleaner"),
            &["executor_id"],
        )
        .expect("metric definition");

        for c in [
            &jobs_built,
            &calls_invoked,
            &invoke_retries,
            &status_fetches,
            &results_downloaded,
            &wait_rounds,
            &objects_cleaned,
        ] {
            registry.register(Box::new(c.clone())).expect("register metric");
        }
        registry
            .register(Box::new(invoke_seconds.clone()))
            .expect("register metric");
        registry
            .register(Box::new(inflight_dispatches.clone()))
            .expect("register metric");

        Self {
            registry,
            jobs_built,
            calls_invoked,
            invoke_retries,
            invoke_seconds,
            inflight_dispatches,
            wait_rounds,
            status_fetches,
            results_downloaded,
            objects_cleaned,
        }
    }
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

/// Process-global metrics handle shared by all sessions.
pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}
