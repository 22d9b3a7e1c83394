//! Turns one submission into one job message per (url, processing type).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use imgflow_bus::metrics::names;
use imgflow_bus::queues::INGESTOR_SOURCE;
use imgflow_bus::{
    BusError, Envelope, Job, MetricsCollector, ProcessingType, QueueMessage, QueueSender,
    TraceContext,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Ingress request body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub processing_types: Vec<String>,
}

/// At least one requested processing type is not allowed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid processing_types provided: {}", .invalid_types.join(", "))]
pub struct ValidationError {
    /// The offending entries, in submission order.
    pub invalid_types: Vec<String>,
}

impl ValidationError {
    pub fn allowed_types(&self) -> Vec<&'static str> {
        ProcessingType::allowed()
    }
}

#[derive(Debug, Error)]
pub enum FanoutError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("failed to encode job: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("publish failed after {published} of {planned} jobs: {source}")]
    Publish {
        published: usize,
        planned: usize,
        source: BusError,
    },
}

/// Outcome of a fully published submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FanoutReport {
    pub jobs: usize,
    pub urls: usize,
    pub processing_types: Vec<ProcessingType>,
}

/// Parse every requested type; any unknown entry rejects the whole list.
pub fn validate(types: &[String]) -> Result<Vec<ProcessingType>, ValidationError> {
    let mut parsed = Vec::with_capacity(types.len());
    let mut invalid_types = Vec::new();
    for raw in types {
        match raw.parse::<ProcessingType>() {
            Ok(t) => parsed.push(t),
            Err(_) => invalid_types.push(raw.clone()),
        }
    }
    if invalid_types.is_empty() {
        Ok(parsed)
    } else {
        Err(ValidationError { invalid_types })
    }
}

/// Processing types published per url: `original` first, then each other
/// requested type once, in first-seen order.
pub fn per_url_types(requested: &[ProcessingType]) -> Vec<ProcessingType> {
    let mut types = vec![ProcessingType::Original];
    for &t in requested {
        if !types.contains(&t) {
            types.push(t);
        }
    }
    types
}

/// Every job a submission expands to, in publish order.
pub fn plan(urls: &[String], requested: &[ProcessingType]) -> Vec<Job> {
    let types = per_url_types(requested);
    urls.iter()
        .flat_map(|url| types.iter().map(move |&t| Job::new(url.clone(), t)))
        .collect()
}

/// Publishes the jobs of a submission onto the work queue.
#[derive(Clone)]
pub struct FanoutPublisher {
    sender: Arc<dyn QueueSender>,
    metrics: MetricsCollector,
    /// Outcome of the most recent send, true until the first failure.
    last_send_ok: Arc<AtomicBool>,
}

impl FanoutPublisher {
    pub fn new(sender: Arc<dyn QueueSender>, metrics: MetricsCollector) -> Self {
        Self {
            sender,
            metrics,
            last_send_ok: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn queue_name(&self) -> &str {
        self.sender.queue_name()
    }

    /// Whether the underlying queue sender is still open.
    pub fn is_connected(&self) -> bool {
        !self.sender.is_closed()
    }

    pub fn last_send_ok(&self) -> bool {
        self.last_send_ok.load(Ordering::Relaxed)
    }

    /// Open, and the most recent send went through. A later successful
    /// send clears an earlier failure.
    pub fn is_healthy(&self) -> bool {
        self.is_connected() && self.last_send_ok()
    }

    /// Validate and publish.
    ///
    /// Nothing is published when validation fails. Publishing stops at the
    /// first failed send; jobs already sent stay queued.
    #[instrument(skip_all, fields(trace_id = %trace.trace_id(), urls = submission.urls.len()))]
    pub async fn publish(
        &self,
        submission: &Submission,
        trace: &TraceContext,
    ) -> Result<FanoutReport, FanoutError> {
        let requested = validate(&submission.processing_types).map_err(|e| {
            self.metrics.incr(names::SUBMISSIONS_REJECTED, "invalid_type");
            warn!(invalid = ?e.invalid_types, "rejecting submission");
            e
        })?;

        let jobs = plan(&submission.urls, &requested);
        let queue = self.sender.queue_name().to_string();

        for (published, job) in jobs.iter().enumerate() {
            let body = Envelope::encode(trace.trace_id(), INGESTOR_SOURCE, job)?;
            let headers = trace.child().carrier();
            if let Err(source) = self.sender.send(QueueMessage::with_headers(body, headers)).await {
                self.last_send_ok.store(false, Ordering::Relaxed);
                self.metrics.incr(names::PUBLISH_ERRORS, &queue);
                warn!(
                    url = %job.url,
                    processing_type = %job.processing_type,
                    error = %source,
                    published,
                    "publish failed, aborting fanout"
                );
                return Err(FanoutError::Publish {
                    published,
                    planned: jobs.len(),
                    source,
                });
            }
            self.last_send_ok.store(true, Ordering::Relaxed);
            self.metrics.incr(names::JOBS_SUBMITTED, &queue);
            debug!(url = %job.url, processing_type = %job.processing_type, "job published");
        }

        info!(jobs = jobs.len(), "submission fanned out");
        Ok(FanoutReport {
            jobs: jobs.len(),
            urls: submission.urls.len(),
            processing_types: per_url_types(&requested),
        })
    }
}
