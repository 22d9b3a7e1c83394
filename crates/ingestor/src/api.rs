//! HTTP ingress: job submission plus health, status and metrics endpoints.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::middleware;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use imgflow_bus::metrics::names;
use imgflow_bus::queues::INGESTOR_SOURCE;
use imgflow_bus::trace::{TRACEPARENT, TRACESTATE};
use imgflow_bus::{Headers, MetricsCollector, TraceContext};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::{DefaultOnResponse, TraceLayer};
use tracing::{error, info_span, Instrument, Level};

use crate::fanout::{FanoutError, FanoutPublisher, Submission};
use crate::middleware::track_requests;

/// Header carrying the caller's trace id into the envelope.
pub const TRACE_ID_HEADER: &str = "x-trace-id";

pub struct AppState {
    pub publisher: FanoutPublisher,
    pub metrics: MetricsCollector,
    /// Redacted config echoed by `/status`.
    pub config: Value,
    pub metrics_path: String,
}

pub type SharedState = Arc<AppState>;

pub fn build_router(state: SharedState) -> Router {
    let metrics_path = state.metrics_path.clone();
    Router::new()
        .route("/submit", post(submit))
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/queue/status", get(queue_status))
        .route("/stats", get(stats))
        .route(&metrics_path, get(metrics))
        .route_layer(middleware::from_fn_with_state(state.metrics.clone(), track_requests))
        .layer(TraceLayer::new_for_http().on_response(DefaultOnResponse::new().level(Level::INFO)))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Trace context for an incoming request: continues a caller-supplied
/// `traceparent` when present, otherwise starts a new trace. The envelope
/// trace id comes from `X-Trace-ID` and stays empty when absent.
fn request_trace(headers: &HeaderMap) -> TraceContext {
    let trace_id = headers
        .get(TRACE_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let mut carrier = Headers::new();
    for key in [TRACEPARENT, TRACESTATE] {
        if let Some(value) = headers.get(key).and_then(|v| v.to_str().ok()) {
            carrier.insert(key.to_string(), value.to_string());
        }
    }
    TraceContext::continue_from(trace_id, &carrier)
}

/// `POST /submit`: validate and fan out.
///
/// 202 when every job was published, 400 on malformed JSON or invalid
/// processing types, 500 when a publish failed mid-fanout.
async fn submit(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Result<Json<Submission>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    let Json(submission) = body.map_err(|rejection| {
        state.metrics.incr(names::SUBMISSIONS_REJECTED, "bad_request");
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": rejection.body_text() })),
        )
    })?;

    let trace = request_trace(&headers);
    let span = info_span!(
        "submit",
        trace_id = %trace.trace_id(),
        otel_trace_id = %trace.otel_trace_id(),
        span_id = %trace.span_id(),
        parent_span_id = %trace.parent_span_id(),
    );

    match state.publisher.publish(&submission, &trace).instrument(span).await {
        Ok(report) => Ok((
            StatusCode::ACCEPTED,
            Json(json!({
                "status": "accepted",
                "jobs": report.jobs,
                "trace_id": trace.trace_id(),
            })),
        )),
        Err(FanoutError::Validation(invalid)) => Err((
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "invalid processing_types provided",
                "invalid_types": invalid.invalid_types,
                "allowed_types": invalid.allowed_types(),
            })),
        )),
        Err(e) => {
            error!(error = %e, trace_id = %trace.trace_id(), "submission failed");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "publish failed" })),
            ))
        }
    }
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now(),
        "service": INGESTOR_SOURCE,
    }))
}

/// Queue health is the sender's own view: open, and the last publish went
/// through. The broker is never probed.
async fn status(State(state): State<SharedState>) -> Json<Value> {
    let queue = if state.publisher.is_healthy() { "healthy" } else { "unhealthy" };
    Json(json!({
        "service": INGESTOR_SOURCE,
        "status": "running",
        "timestamp": Utc::now(),
        "dependencies": { "queue": queue },
        "config": state.config,
    }))
}

async fn queue_status(
    State(state): State<SharedState>,
) -> Result<Json<Value>, (StatusCode, String)> {
    if !state.publisher.is_connected() {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            "queue connection not available".to_string(),
        ));
    }
    if !state.publisher.last_send_ok() {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            "last publish to the queue failed".to_string(),
        ));
    }
    let queue_name = state.publisher.queue_name().to_string();
    Ok(Json(json!({
        "queue_name": queue_name,
        "published": state.metrics.counter(names::JOBS_SUBMITTED, &queue_name),
        "publish_errors": state.metrics.counter(names::PUBLISH_ERRORS, &queue_name),
        "timestamp": Utc::now(),
    })))
}

async fn stats(State(state): State<SharedState>) -> Json<Value> {
    Json(json!({
        "service": INGESTOR_SOURCE,
        "timestamp": Utc::now(),
        "metrics": {
            "endpoints": {
                "health": "/health",
                "status": "/status",
                "queue": "/queue/status",
                "metrics": state.metrics_path,
                "submit": "/submit",
            },
        },
    }))
}

async fn metrics(State(state): State<SharedState>) -> Json<imgflow_bus::metrics::MetricsResponse> {
    Json(state.metrics.snapshot())
}
