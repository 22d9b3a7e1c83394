//! Metrics collection and HTTP exposure.
//!
//! Each process builds one [`MetricsCollector`] and hands clones to every
//! component that records. Counters and step timings are keyed by a metric
//! name plus one label (status, stage, queue). A 1-second tick rolls the
//! event count into a ring buffer of throughput points. Everything is
//! served as JSON by [`spawn_metrics_server`].

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

// ── Constants ────────────────────────────────────────────────────────

/// Ring buffer capacity: 5 minutes at 1-second granularity.
const RING_BUFFER_CAPACITY: usize = 300;

/// Snapshot interval for the time-series ring buffer.
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(1);

/// Metric names shared across services.
pub mod names {
    /// Jobs published by the fanout, labelled by queue.
    pub const JOBS_SUBMITTED: &str = "jobs_submitted_total";
    /// Submissions rejected at ingress, labelled by reason.
    pub const SUBMISSIONS_REJECTED: &str = "submissions_rejected_total";
    /// Failed publishes, labelled by queue.
    pub const PUBLISH_ERRORS: &str = "publish_errors_total";
    /// Jobs dropped before processing, labelled `decode_error` or `malformed`.
    pub const JOBS_DROPPED: &str = "jobs_dropped_total";
    /// Finished jobs, labelled `success` or `error`.
    pub const IMAGES_PROCESSED: &str = "images_processed_total";
    /// Stage failures, labelled by stage.
    pub const STAGE_FAILURES: &str = "stage_failures_total";
    pub const RESULTS_PUBLISHED: &str = "results_published_total";
    /// Persisted results, labelled `success`, `error` or `decode_error`.
    pub const RECORDS_STORED: &str = "records_stored_total";
    /// Frames moved by the broker, labelled by queue.
    pub const MESSAGES_FORWARDED: &str = "messages_forwarded_total";

    /// Ingress requests, labelled `METHOD /route STATUS`.
    pub const HTTP_REQUESTS: &str = "http_requests_total";

    pub const ACTIVE_WORKERS: &str = "active_workers";
    pub const HTTP_IN_FLIGHT: &str = "http_requests_in_flight";

    /// Per-step durations, labelled by step.
    pub const PROCESSING_DURATION: &str = "image_processing_duration_seconds";
    pub const JOB_DURATION: &str = "job_processing_duration_seconds";
    pub const STORAGE_DURATION: &str = "storage_duration_seconds";
    /// Ingress request latency, labelled `METHOD /route`.
    pub const HTTP_REQUEST_DURATION: &str = "http_request_duration_seconds";
}

// ── Ring buffer ──────────────────────────────────────────────────────

/// A fixed-size ring buffer backed by `VecDeque`.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    buf: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Push an item, evicting the oldest if at capacity.
    pub fn push(&mut self, item: T) {
        if self.buf.len() == self.capacity {
            self.buf.pop_front();
        }
        self.buf.push_back(item);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Iterate over items from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.buf.iter()
    }
}

// ── Snapshot types ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct GaugeSnapshot {
    pub current: i64,
    /// Highest value seen since start.
    pub peak: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimingSnapshot {
    pub count: u64,
    pub total_secs: f64,
    pub mean_secs: f64,
    pub max_secs: f64,
}

/// A point-in-time snapshot stored in the ring buffer.
#[derive(Debug, Clone, Serialize)]
pub struct TimeSeriesPoint {
    /// Seconds since the collector was created.
    pub elapsed_secs: f64,
    /// Counter increments in the window that just closed.
    pub events_per_sec: f64,
    pub total_events: u64,
}

/// Complete JSON response from `GET /metrics`.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsResponse {
    pub service: String,
    pub uptime_secs: f64,
    pub counters: BTreeMap<String, BTreeMap<String, u64>>,
    pub gauges: BTreeMap<String, GaugeSnapshot>,
    pub timings: BTreeMap<String, BTreeMap<String, TimingSnapshot>>,
    pub time_series: Vec<TimeSeriesPoint>,
}

// ── MetricsCollector ─────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy)]
struct TimingState {
    count: u64,
    total: Duration,
    max: Duration,
}

#[derive(Debug)]
struct Inner {
    counters: BTreeMap<String, BTreeMap<String, u64>>,
    gauges: BTreeMap<String, GaugeSnapshot>,
    timings: BTreeMap<String, BTreeMap<String, TimingState>>,
    total_events: u64,
    window_events: u64,
    ring: RingBuffer<TimeSeriesPoint>,
}

/// Thread-safe metrics registry. Cheap to clone.
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    service: Arc<str>,
    inner: Arc<Mutex<Inner>>,
    start: Instant,
}

impl MetricsCollector {
    pub fn new(service: &str) -> Self {
        Self {
            service: Arc::from(service),
            inner: Arc::new(Mutex::new(Inner {
                counters: BTreeMap::new(),
                gauges: BTreeMap::new(),
                timings: BTreeMap::new(),
                total_events: 0,
                window_events: 0,
                ring: RingBuffer::new(RING_BUFFER_CAPACITY),
            })),
            start: Instant::now(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Recording never leaves the maps half-updated, so a poisoned lock is still usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Increment a labelled counter by one.
    pub fn incr(&self, name: &str, label: &str) {
        self.add(name, label, 1);
    }

    pub fn add(&self, name: &str, label: &str, n: u64) {
        let mut inner = self.lock();
        *inner
            .counters
            .entry(name.to_string())
            .or_default()
            .entry(label.to_string())
            .or_insert(0) += n;
        inner.total_events += n;
        inner.window_events += n;
    }

    pub fn counter(&self, name: &str, label: &str) -> u64 {
        self.lock()
            .counters
            .get(name)
            .and_then(|labels| labels.get(label))
            .copied()
            .unwrap_or(0)
    }

    /// Sum of a counter across all labels.
    pub fn counter_total(&self, name: &str) -> u64 {
        self.lock()
            .counters
            .get(name)
            .map(|labels| labels.values().sum())
            .unwrap_or(0)
    }

    /// Record one duration sample.
    pub fn observe(&self, name: &str, label: &str, elapsed: Duration) {
        let mut inner = self.lock();
        let state = inner
            .timings
            .entry(name.to_string())
            .or_default()
            .entry(label.to_string())
            .or_default();
        state.count += 1;
        state.total += elapsed;
        state.max = state.max.max(elapsed);
    }

    /// Number of samples recorded for a timing.
    pub fn timing_count(&self, name: &str, label: &str) -> u64 {
        self.lock()
            .timings
            .get(name)
            .and_then(|labels| labels.get(label))
            .map(|t| t.count)
            .unwrap_or(0)
    }

    fn shift_gauge(&self, name: &str, delta: i64) {
        let mut inner = self.lock();
        let gauge = inner.gauges.entry(name.to_string()).or_default();
        gauge.current += delta;
        gauge.peak = gauge.peak.max(gauge.current);
    }

    /// Increment a gauge for as long as the returned guard lives.
    pub fn track(&self, name: &'static str) -> GaugeGuard {
        self.shift_gauge(name, 1);
        GaugeGuard {
            collector: self.clone(),
            name,
        }
    }

    pub fn gauge(&self, name: &str) -> GaugeSnapshot {
        self.lock().gauges.get(name).copied().unwrap_or_default()
    }

    /// Close the current 1-second window and push a time-series point.
    ///
    /// Called by the background tick task every second.
    pub fn tick(&self) {
        let elapsed = self.start.elapsed().as_secs_f64();
        let mut inner = self.lock();
        let point = TimeSeriesPoint {
            elapsed_secs: elapsed,
            events_per_sec: inner.window_events as f64,
            total_events: inner.total_events,
        };
        inner.window_events = 0;
        inner.ring.push(point);
    }

    /// Build a complete snapshot for the HTTP response.
    pub fn snapshot(&self) -> MetricsResponse {
        let inner = self.lock();
        let timings = inner
            .timings
            .iter()
            .map(|(name, labels)| {
                let labels = labels
                    .iter()
                    .map(|(label, t)| {
                        let total_secs = t.total.as_secs_f64();
                        let mean_secs = if t.count == 0 { 0.0 } else { total_secs / t.count as f64 };
                        (
                            label.clone(),
                            TimingSnapshot {
                                count: t.count,
                                total_secs,
                                mean_secs,
                                max_secs: t.max.as_secs_f64(),
                            },
                        )
                    })
                    .collect();
                (name.clone(), labels)
            })
            .collect();

        MetricsResponse {
            service: self.service.to_string(),
            uptime_secs: self.start.elapsed().as_secs_f64(),
            counters: inner.counters.clone(),
            gauges: inner.gauges.clone(),
            timings,
            time_series: inner.ring.iter().cloned().collect(),
        }
    }
}

/// Decrements its gauge when dropped, including on panic unwind.
#[must_use = "the gauge drops back as soon as the guard is dropped"]
pub struct GaugeGuard {
    collector: MetricsCollector,
    name: &'static str,
}

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.collector.shift_gauge(self.name, -1);
    }
}

// ── HTTP server ──────────────────────────────────────────────────────

/// Router serving the snapshot at `path` and a liveness probe at `/health`.
pub fn metrics_router(collector: MetricsCollector, path: &str) -> Router {
    Router::new()
        .route(path, get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(collector)
}

/// Spawn an HTTP server for `app` on the given port.
///
/// Returns a `JoinHandle` that resolves when the server shuts down.
pub fn spawn_metrics_server(
    port: u16,
    app: Router,
    shutdown: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(port, error = %e, "failed to bind metrics HTTP server");
                return;
            }
        };

        tracing::info!(port, "metrics HTTP server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut rx = shutdown;
                while !*rx.borrow() {
                    if rx.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await
            .ok();

        tracing::info!("metrics HTTP server stopped");
    })
}

/// Spawn the background tick task that closes rate windows every second.
pub fn spawn_tick_task(
    collector: MetricsCollector,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SNAPSHOT_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    collector.tick();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

/// `GET /metrics` → JSON snapshot.
async fn metrics_handler(State(collector): State<MetricsCollector>) -> Json<MetricsResponse> {
    Json(collector.snapshot())
}

async fn health_handler(State(collector): State<MetricsCollector>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": collector.service(),
        "timestamp": chrono::Utc::now(),
    }))
}

// ── Tests ────────────────────────────────────────────────────────────
