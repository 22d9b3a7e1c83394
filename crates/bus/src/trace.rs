//! Trace context carried with every queue message.
//!
//! Two identifiers travel together: the caller-supplied `trace_id` that is
//! written into the [`Envelope`](crate::envelope::Envelope), and a W3C span
//! context that is written into the transport headers as `traceparent` /
//! `tracestate`. [`TraceContext`] owns both so a hop derives them once and
//! hands the same value to the encoder and the header injector.

use std::collections::HashMap;
use std::fmt;

use opentelemetry::propagation::{Extractor, Injector, TextMapPropagator};
use opentelemetry::trace::{SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState};
use opentelemetry::Context;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use uuid::Uuid;

/// W3C Trace Context header names
pub const TRACEPARENT: &str = "traceparent";
pub const TRACESTATE: &str = "tracestate";

/// Transport headers attached to a queue message.
pub type Headers = HashMap<String, String>;

struct HeaderInjector<'a>(&'a mut Headers);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(key.to_ascii_lowercase(), value);
    }
}

struct HeaderExtractor<'a>(&'a Headers);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .or_else(|| {
                self.0
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(key))
                    .map(|(_, v)| v)
            })
            .map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        vec![TRACEPARENT, TRACESTATE]
    }
}

/// Per-hop trace state.
#[derive(Debug, Clone)]
pub struct TraceContext {
    trace_id: String,
    span: SpanContext,
    parent_span_id: Option<SpanId>,
}

impl TraceContext {
    /// Start a new trace. `trace_id` is the envelope-level id and may be empty.
    pub fn root(trace_id: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            span: new_span(random_trace_id()),
            parent_span_id: None,
        }
    }

    /// Continue the trace found in `headers`, or start a new one when the
    /// headers carry no valid `traceparent`.
    ///
    /// The returned context is a child: it shares the upstream trace id but
    /// has a fresh span id, with the upstream span recorded as its parent.
    pub fn continue_from(trace_id: impl Into<String>, headers: &Headers) -> Self {
        let propagator = TraceContextPropagator::new();
        let cx = propagator.extract(&HeaderExtractor(headers));
        let upstream = cx.span().span_context().clone();
        if !upstream.is_valid() {
            return Self::root(trace_id);
        }
        Self {
            trace_id: trace_id.into(),
            span: child_span(&upstream),
            parent_span_id: Some(upstream.span_id()),
        }
    }

    /// Derive a child span for the next hop.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span: child_span(&self.span),
            parent_span_id: Some(self.span.span_id()),
        }
    }

    /// Write `traceparent`/`tracestate` for this span into `headers`.
    pub fn inject(&self, headers: &mut Headers) {
        let propagator = TraceContextPropagator::new();
        let cx = Context::new().with_remote_span_context(self.span.clone());
        propagator.inject_context(&cx, &mut HeaderInjector(headers));
    }

    /// Fresh header map carrying only this span.
    pub fn carrier(&self) -> Headers {
        let mut headers = Headers::new();
        self.inject(&mut headers);
        headers
    }

    /// The envelope-level trace id.
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// W3C trace id as 32 lowercase hex characters.
    pub fn otel_trace_id(&self) -> String {
        self.span.trace_id().to_string()
    }

    pub fn span_id(&self) -> String {
        self.span.span_id().to_string()
    }

    /// Parent span id, or "" for a root span.
    pub fn parent_span_id(&self) -> String {
        self.parent_span_id
            .map(|id| id.to_string())
            .unwrap_or_default()
    }
}

impl fmt::Display for TraceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.otel_trace_id(), self.span_id())
    }
}

fn random_trace_id() -> TraceId {
    TraceId::from_bytes(Uuid::new_v4().into_bytes())
}

fn random_span_id() -> SpanId {
    let bytes = Uuid::new_v4().into_bytes();
    let mut id = [0u8; 8];
    id.copy_from_slice(&bytes[..8]);
    SpanId::from_bytes(id)
}

fn new_span(trace_id: TraceId) -> SpanContext {
    SpanContext::new(
        trace_id,
        random_span_id(),
        TraceFlags::SAMPLED,
        true,
        TraceState::default(),
    )
}

fn child_span(parent: &SpanContext) -> SpanContext {
    SpanContext::new(
        parent.trace_id(),
        random_span_id(),
        parent.trace_flags(),
        true,
        parent.trace_state().clone(),
    )
}
