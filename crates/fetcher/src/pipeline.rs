//! The per-job pipeline: decode, download, transform, upload, publish.

use std::sync::Arc;
use std::time::Instant;

use imgflow_bus::metrics::names;
use imgflow_bus::queues::FETCHER_SOURCE;
use imgflow_bus::{
    decode, BusError, Delivery, Envelope, Job, JobMessage, MetricsCollector, ProcessedResult,
    QueueMessage, QueueSender, ResultStatus, TraceContext,
};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::processor::{self, DownloadError, DownloadedImage, ImageSource, UnsupportedTransform};
use crate::storage::{ImageStore, StorageError};

/// A failed stage aborts its job and nothing else.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("download failed: {0}")]
    Download(#[from] DownloadError),

    #[error("transform failed: {0}")]
    Transform(String),

    #[error("upload failed: {0}")]
    Upload(#[from] StorageError),

    #[error("result encode failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("result publish failed: {0}")]
    Publish(#[from] BusError),
}

impl StageError {
    /// Stage label used in metrics.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Download(_) => "download",
            Self::Transform(_) => "transform",
            Self::Upload(_) => "upload",
            Self::Encode(_) | Self::Publish(_) => "publish",
        }
    }
}

impl From<UnsupportedTransform> for StageError {
    fn from(e: UnsupportedTransform) -> Self {
        Self::Transform(e.to_string())
    }
}

/// How one delivery ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Result published to the result queue.
    Completed { storage_path: String },
    /// Undecodable or malformed message.
    Dropped { reason: &'static str },
    /// A stage failed; no result was published.
    Failed { stage: &'static str },
}

/// Everything a worker task needs, shared across tasks.
pub struct JobPipeline {
    source: Arc<dyn ImageSource>,
    store: Arc<dyn ImageStore>,
    results: Arc<dyn QueueSender>,
    metrics: MetricsCollector,
}

impl JobPipeline {
    pub fn new(
        source: Arc<dyn ImageSource>,
        store: Arc<dyn ImageStore>,
        results: Arc<dyn QueueSender>,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            source,
            store,
            results,
            metrics,
        }
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Run one delivery to completion. Never fails; every failure is
    /// logged, counted and reported in the outcome.
    pub async fn process(&self, delivery: &Delivery) -> JobOutcome {
        let decoded = match decode::<JobMessage>(delivery.body()) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(trace_id = %e.trace_id(), error = %e, "dropping undecodable job");
                self.metrics.incr(names::JOBS_DROPPED, "decode_error");
                return JobOutcome::Dropped { reason: "decode_error" };
            }
        };

        let ctx = TraceContext::continue_from(decoded.envelope.trace_id.clone(), delivery.headers());
        let span = info_span!(
            "process_job",
            trace_id = %ctx.trace_id(),
            otel_trace_id = %ctx.otel_trace_id(),
            span_id = %ctx.span_id(),
            parent_span_id = %ctx.parent_span_id(),
            source = %decoded.envelope.source,
        );

        let job = match Job::try_from(decoded.payload) {
            Ok(job) => job,
            Err(e) => {
                span.in_scope(|| warn!(error = %e, "dropping malformed job"));
                self.metrics.incr(names::JOBS_DROPPED, "malformed");
                return JobOutcome::Dropped { reason: "malformed" };
            }
        };

        self.run(job, ctx).instrument(span).await
    }

    async fn run(&self, job: Job, ctx: TraceContext) -> JobOutcome {
        let started = Instant::now();
        let outcome = match self.execute(&job, &ctx).await {
            Ok(storage_path) => {
                info!(url = %job.url, processing_type = %job.processing_type, storage_path = %storage_path, "image processed");
                self.metrics.incr(names::IMAGES_PROCESSED, ResultStatus::Success.as_str());
                JobOutcome::Completed { storage_path }
            }
            Err(e) => {
                warn!(url = %job.url, processing_type = %job.processing_type, stage = e.stage(), error = %e, "job failed");
                self.metrics.incr(names::IMAGES_PROCESSED, ResultStatus::Error.as_str());
                self.metrics.incr(names::STAGE_FAILURES, e.stage());
                JobOutcome::Failed { stage: e.stage() }
            }
        };
        self.metrics.observe(names::JOB_DURATION, job.processing_type.as_str(), started.elapsed());
        outcome
    }

    async fn execute(&self, job: &Job, ctx: &TraceContext) -> Result<String, StageError> {
        let step = Instant::now();
        let downloaded = self.source.download(&job.url).await;
        self.metrics.observe(names::PROCESSING_DURATION, "download", step.elapsed());
        let DownloadedImage { image, format } = downloaded?;
        let (width, height) = (image.width(), image.height());
        debug!(width, height, format = %format, "downloaded");

        let kind = job.processing_type;
        let step = Instant::now();
        let image = tokio::task::spawn_blocking(move || processor::apply(kind, image))
            .await
            .map_err(|e| StageError::Transform(e.to_string()))??;
        self.metrics.observe(names::PROCESSING_DURATION, kind.as_str(), step.elapsed());

        let step = Instant::now();
        let key = self.store.put(&image, kind).await;
        self.metrics.observe(names::PROCESSING_DURATION, "upload", step.elapsed());
        let key = key?;

        let file_size = self.store.size(&key).await.unwrap_or_else(|e| {
            warn!(key = %key, error = %e, "failed to read object size, reporting 0");
            0
        });

        let result = ProcessedResult {
            source_url: job.url.clone(),
            storage_path: self.store.location(&key),
            status: ResultStatus::Success,
            error_msg: None,
            trace_id: ctx.trace_id().to_string(),
            width,
            height,
            format,
            file_size,
            processing_type: kind,
        };

        let body = Envelope::encode(ctx.trace_id(), FETCHER_SOURCE, &result)?;
        let message = QueueMessage::with_headers(body, ctx.child().carrier());
        if let Err(e) = self.results.send(message).await {
            self.metrics.incr(names::PUBLISH_ERRORS, self.results.queue_name());
            return Err(e.into());
        }
        self.metrics.incr(names::RESULTS_PUBLISHED, self.results.queue_name());
        Ok(result.storage_path)
    }
}
