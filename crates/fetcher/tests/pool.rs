//! Worker pool behaviour against in-memory queues, a scripted image source
//! and scripted object storage.

use std::collections::HashSet;
use std::io::{self, Cursor};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use imgflow_bus::metrics::names;
use imgflow_bus::queues::{FETCHER_SOURCE, INGESTOR_SOURCE, RESULT_QUEUE, WORK_QUEUE};
use imgflow_bus::{
    decode, Envelope, Job, JobMessage, MemoryQueue, MetricsCollector, ProcessedResult,
    ProcessingType, QueueMessage, QueueSender, ResultStatus, TraceContext,
};
use imgflow_core::AckMode;
use imgflow_fetcher::{
    DownloadError, DownloadedImage, ImageSource, ImageStore, JobPipeline, ObjectImageStore,
    PoolConfig, StorageError, WorkerPool,
};
use tokio::sync::{Notify, Semaphore};

fn png(width: u32, height: u32) -> Vec<u8> {
    let img = DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, 90])
    }));
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png).unwrap();
    buf.into_inner()
}

/// Serves one fixed image, failing for chosen urls, and records how many
/// downloads overlap.
struct ScriptedSource {
    image: DownloadedImage,
    failing: HashSet<String>,
    delay: Duration,
    gate: Option<Arc<Semaphore>>,
    started: Arc<Notify>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedSource {
    fn new(delay: Duration) -> Self {
        Self {
            image: DownloadedImage::decode(&png(64, 48)).unwrap(),
            failing: HashSet::new(),
            delay,
            gate: None,
            started: Arc::new(Notify::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    fn failing(mut self, url: &str) -> Self {
        self.failing.insert(url.to_string());
        self
    }

    /// Hold every download until the gate gets a permit.
    fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }
}

#[async_trait]
impl ImageSource for ScriptedSource {
    async fn download(&self, url: &str) -> Result<DownloadedImage, DownloadError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.started.notify_one();

        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing.contains(url) {
            return Err(DownloadError::Status(404));
        }
        Ok(self.image.clone())
    }
}

/// In-memory object storage that refuses uploads for chosen processing
/// types and can fail size lookups.
struct ScriptedStore {
    inner: ObjectImageStore,
    failing_puts: HashSet<ProcessingType>,
    size_fails: bool,
}

impl ScriptedStore {
    fn new() -> Self {
        Self {
            inner: ObjectImageStore::in_memory("images"),
            failing_puts: HashSet::new(),
            size_fails: false,
        }
    }

    fn failing_put(mut self, kind: ProcessingType) -> Self {
        self.failing_puts.insert(kind);
        self
    }

    fn failing_size(mut self) -> Self {
        self.size_fails = true;
        self
    }
}

#[async_trait]
impl ImageStore for ScriptedStore {
    async fn put(&self, image: &DynamicImage, kind: ProcessingType) -> Result<String, StorageError> {
        if self.failing_puts.contains(&kind) {
            return Err(StorageError::Io(io::Error::other("bucket unavailable")));
        }
        self.inner.put(image, kind).await
    }

    async fn size(&self, key: &str) -> Result<u64, StorageError> {
        if self.size_fails {
            return Err(StorageError::Io(io::Error::other("head timed out")));
        }
        self.inner.size(key).await
    }

    fn location(&self, key: &str) -> String {
        self.inner.location(key)
    }
}

struct Harness {
    jobs: Arc<MemoryQueue>,
    results: Arc<MemoryQueue>,
    source: Arc<ScriptedSource>,
    metrics: MetricsCollector,
    pool: Arc<WorkerPool>,
}

fn harness(jobs: MemoryQueue, source: ScriptedSource, concurrency: usize, ack_mode: AckMode) -> Harness {
    harness_with(
        jobs,
        source,
        ScriptedStore::new(),
        MemoryQueue::new(RESULT_QUEUE),
        concurrency,
        ack_mode,
    )
}

fn harness_with(
    jobs: MemoryQueue,
    source: ScriptedSource,
    store: ScriptedStore,
    results: MemoryQueue,
    concurrency: usize,
    ack_mode: AckMode,
) -> Harness {
    let jobs = Arc::new(jobs);
    let results = Arc::new(results);
    let source = Arc::new(source);
    let metrics = MetricsCollector::new(FETCHER_SOURCE);
    let pipeline = Arc::new(JobPipeline::new(
        source.clone(),
        Arc::new(store),
        results.clone(),
        metrics.clone(),
    ));
    let pool = Arc::new(WorkerPool::new(
        jobs.clone(),
        pipeline,
        PoolConfig {
            concurrency,
            ack_mode,
            drain_timeout: Duration::from_secs(10),
        },
    ));
    Harness {
        jobs,
        results,
        source,
        metrics,
        pool,
    }
}

async fn enqueue(queue: &MemoryQueue, job: &Job, trace: &TraceContext) {
    let body = Envelope::encode(trace.trace_id(), INGESTOR_SOURCE, job).unwrap();
    queue
        .send(QueueMessage::with_headers(body, trace.child().carrier()))
        .await
        .unwrap();
}

async fn run_to_completion(h: &Harness) {
    h.jobs.close();
    tokio::time::timeout(Duration::from_secs(10), h.pool.run())
        .await
        .expect("pool should finish once the queue is closed")
        .unwrap();
}

fn results(messages: Vec<QueueMessage>) -> Vec<(Envelope, ProcessedResult)> {
    messages
        .iter()
        .map(|m| {
            let decoded = decode::<ProcessedResult>(&m.body).unwrap();
            (decoded.envelope, decoded.payload)
        })
        .collect()
}

#[tokio::test]
async fn never_runs_more_than_k_jobs() {
    let h = harness(
        MemoryQueue::new(WORK_QUEUE),
        ScriptedSource::new(Duration::from_millis(40)),
        5,
        AckMode::OnDelivery,
    );
    let trace = TraceContext::root("burst");
    for i in 0..20 {
        enqueue(&h.jobs, &Job::new(format!("http://x/{i}.png"), ProcessingType::Original), &trace).await;
    }

    run_to_completion(&h).await;

    assert_eq!(h.source.max_in_flight.load(Ordering::SeqCst), 5);
    let gauge = h.metrics.gauge(names::ACTIVE_WORKERS);
    assert!(gauge.peak <= 5, "peak {} exceeds the limit", gauge.peak);
    assert_eq!(gauge.current, 0);
    assert_eq!(h.results.drain().await.len(), 20);
    assert_eq!(h.metrics.counter(names::IMAGES_PROCESSED, "success"), 20);
}

#[tokio::test]
async fn download_failure_only_drops_its_own_job() {
    let h = harness(
        MemoryQueue::new(WORK_QUEUE),
        ScriptedSource::new(Duration::from_millis(10)).failing("http://x/broken.png"),
        5,
        AckMode::OnDelivery,
    );
    let trace = TraceContext::root("t-1");
    enqueue(&h.jobs, &Job::new("http://x/broken.png", ProcessingType::Blur), &trace).await;
    enqueue(&h.jobs, &Job::new("http://x/fine.png", ProcessingType::Grayscale), &trace).await;

    run_to_completion(&h).await;

    let published = results(h.results.drain().await);
    assert_eq!(published.len(), 1);
    let (_, result) = &published[0];
    assert_eq!(result.source_url, "http://x/fine.png");
    assert_eq!(result.processing_type, ProcessingType::Grayscale);
    assert_eq!(h.metrics.counter(names::IMAGES_PROCESSED, "error"), 1);
    assert_eq!(h.metrics.counter(names::STAGE_FAILURES, "download"), 1);
}

#[tokio::test]
async fn upload_failure_only_drops_its_own_job() {
    let h = harness_with(
        MemoryQueue::new(WORK_QUEUE),
        ScriptedSource::new(Duration::ZERO),
        ScriptedStore::new().failing_put(ProcessingType::Blur),
        MemoryQueue::new(RESULT_QUEUE),
        5,
        AckMode::OnDelivery,
    );
    let trace = TraceContext::root("t-2");
    enqueue(&h.jobs, &Job::new("http://x/a.png", ProcessingType::Blur), &trace).await;
    enqueue(&h.jobs, &Job::new("http://x/a.png", ProcessingType::Sharpen), &trace).await;

    run_to_completion(&h).await;

    let published = results(h.results.drain().await);
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].1.processing_type, ProcessingType::Sharpen);
    assert_eq!(h.metrics.counter(names::STAGE_FAILURES, "upload"), 1);
    assert_eq!(h.metrics.counter(names::IMAGES_PROCESSED, "error"), 1);
    assert_eq!(h.metrics.counter(names::IMAGES_PROCESSED, "success"), 1);
}

#[tokio::test]
async fn result_publish_failure_is_counted_against_the_publish_stage() {
    let h = harness_with(
        MemoryQueue::new(WORK_QUEUE),
        ScriptedSource::new(Duration::ZERO),
        ScriptedStore::new(),
        MemoryQueue::failing_after(RESULT_QUEUE, 0),
        5,
        AckMode::OnDelivery,
    );
    enqueue(&h.jobs, &Job::new("http://x/a.png", ProcessingType::Grayscale), &TraceContext::root("")).await;

    run_to_completion(&h).await;

    assert_eq!(h.results.sent_count(), 0);
    assert_eq!(h.metrics.counter(names::STAGE_FAILURES, "publish"), 1);
    assert_eq!(h.metrics.counter(names::PUBLISH_ERRORS, RESULT_QUEUE), 1);
    assert_eq!(h.metrics.counter(names::RESULTS_PUBLISHED, RESULT_QUEUE), 0);
    assert_eq!(h.metrics.counter(names::IMAGES_PROCESSED, "error"), 1);
}

#[tokio::test]
async fn size_lookup_failure_reports_zero_bytes() {
    let h = harness_with(
        MemoryQueue::new(WORK_QUEUE),
        ScriptedSource::new(Duration::ZERO),
        ScriptedStore::new().failing_size(),
        MemoryQueue::new(RESULT_QUEUE),
        1,
        AckMode::OnDelivery,
    );
    enqueue(&h.jobs, &Job::new("http://x/a.png", ProcessingType::Original), &TraceContext::root("")).await;

    run_to_completion(&h).await;

    let published = results(h.results.drain().await);
    assert_eq!(published.len(), 1);
    let result = &published[0].1;
    assert_eq!(result.status, ResultStatus::Success);
    assert_eq!(result.file_size, 0);
    assert!(result.storage_path.starts_with("s3://images/"));
    assert_eq!(h.metrics.counter_total(names::STAGE_FAILURES), 0);
}

#[tokio::test]
async fn result_describes_the_source_image_and_keeps_the_trace() {
    let h = harness(
        MemoryQueue::new(WORK_QUEUE),
        ScriptedSource::new(Duration::ZERO),
        5,
        AckMode::OnDelivery,
    );
    let trace = TraceContext::root("req-7");
    enqueue(&h.jobs, &Job::new("http://x/a.png", ProcessingType::Resize), &trace).await;

    run_to_completion(&h).await;

    let messages = h.results.drain().await;
    assert_eq!(messages.len(), 1);
    let downstream = TraceContext::continue_from("", &messages[0].headers);
    assert_eq!(downstream.otel_trace_id(), trace.otel_trace_id());

    let (envelope, result) = results(messages).remove(0);
    assert_eq!(envelope.trace_id, "req-7");
    assert_eq!(envelope.source, FETCHER_SOURCE);
    assert_eq!(result.trace_id, "req-7");
    assert_eq!(result.status, ResultStatus::Success);
    assert_eq!((result.width, result.height), (64, 48));
    assert_eq!(result.format, "png");
    assert!(result.storage_path.starts_with("s3://images/"));
    assert!(result.storage_path.ends_with("_resize.jpg"));
    assert!(result.file_size > 0);
    assert_eq!(h.metrics.counter(names::RESULTS_PUBLISHED, RESULT_QUEUE), 1);
}

#[tokio::test]
async fn undecodable_and_malformed_jobs_are_dropped() {
    let h = harness(
        MemoryQueue::new(WORK_QUEUE),
        ScriptedSource::new(Duration::ZERO),
        2,
        AckMode::OnDelivery,
    );
    h.jobs.send(QueueMessage::new(b"not json".to_vec())).await.unwrap();

    let two_urls = JobMessage {
        urls: vec!["a".into(), "b".into()],
        processing_types: vec!["blur".into()],
        ..JobMessage::default()
    };
    let body = Envelope::encode("t", INGESTOR_SOURCE, &two_urls).unwrap();
    h.jobs.send(QueueMessage::new(body)).await.unwrap();

    let unknown = JobMessage {
        url: Some("a".into()),
        processing_type: Some("sepia".into()),
        ..JobMessage::default()
    };
    let body = Envelope::encode("t", INGESTOR_SOURCE, &unknown).unwrap();
    h.jobs.send(QueueMessage::new(body)).await.unwrap();

    run_to_completion(&h).await;

    assert!(h.results.drain().await.is_empty());
    assert_eq!(h.metrics.counter(names::JOBS_DROPPED, "decode_error"), 1);
    assert_eq!(h.metrics.counter(names::JOBS_DROPPED, "malformed"), 2);
    assert_eq!(h.source.max_in_flight.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn legacy_plural_job_is_processed() {
    let h = harness(
        MemoryQueue::new(WORK_QUEUE),
        ScriptedSource::new(Duration::ZERO),
        1,
        AckMode::OnDelivery,
    );
    let legacy = JobMessage {
        urls: vec!["http://x/old.png".into()],
        processing_types: vec!["sharpen".into()],
        ..JobMessage::default()
    };
    let body = Envelope::encode("old", INGESTOR_SOURCE, &legacy).unwrap();
    h.jobs.send(QueueMessage::new(body)).await.unwrap();

    run_to_completion(&h).await;

    let published = results(h.results.drain().await);
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].1.processing_type, ProcessingType::Sharpen);
}

#[tokio::test]
async fn after_processing_holds_the_ack_until_the_job_ends() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness(
        MemoryQueue::with_manual_ack(WORK_QUEUE),
        ScriptedSource::new(Duration::ZERO).gated(gate.clone()),
        5,
        AckMode::AfterProcessing,
    );
    enqueue(&h.jobs, &Job::new("http://x/a.png", ProcessingType::Original), &TraceContext::root("")).await;

    let pool = h.pool.clone();
    let running = tokio::spawn(async move { pool.run().await });

    tokio::time::timeout(Duration::from_secs(5), h.source.started.notified())
        .await
        .expect("job should start");
    assert_eq!(h.jobs.unacked_count(), 1);

    gate.add_permits(1);
    h.jobs.close();
    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(h.jobs.unacked_count(), 0);
    assert_eq!(h.results.drain().await.len(), 1);
}

#[tokio::test]
async fn on_delivery_acks_before_the_job_runs() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness(
        MemoryQueue::with_manual_ack(WORK_QUEUE),
        ScriptedSource::new(Duration::ZERO).gated(gate.clone()),
        5,
        AckMode::OnDelivery,
    );
    enqueue(&h.jobs, &Job::new("http://x/a.png", ProcessingType::Original), &TraceContext::root("")).await;

    let pool = h.pool.clone();
    let running = tokio::spawn(async move { pool.run().await });

    tokio::time::timeout(Duration::from_secs(5), h.source.started.notified())
        .await
        .expect("job should start");
    assert_eq!(h.jobs.unacked_count(), 0);

    gate.add_permits(1);
    h.jobs.close();
    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn shutdown_waits_for_in_flight_jobs() {
    let h = harness(
        MemoryQueue::new(WORK_QUEUE),
        ScriptedSource::new(Duration::from_millis(100)),
        2,
        AckMode::OnDelivery,
    );
    let trace = TraceContext::root("");
    enqueue(&h.jobs, &Job::new("http://x/1.png", ProcessingType::Original), &trace).await;

    let pool = h.pool.clone();
    let running = tokio::spawn(async move { pool.run().await });
    tokio::time::timeout(Duration::from_secs(5), h.source.started.notified())
        .await
        .expect("job should start");
    assert_eq!(h.pool.in_flight(), 1);

    // The queue stays open; only the shutdown request ends the loop.
    h.pool.shutdown();
    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(h.pool.in_flight(), 0);
    assert_eq!(h.results.drain().await.len(), 1);
}
