//! Sequential consumer of the result queue.
//!
//! Results are stored one at a time in arrival order. A result that cannot
//! be decoded or stored is logged, counted and consumed all the same.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use imgflow_bus::metrics::names;
use imgflow_bus::{
    decode, BusError, Delivery, MetricsCollector, ProcessedResult, QueueReceiver, Service,
    TraceContext,
};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};

use crate::store::{NewImageRecord, RecordStore};

/// How one delivery ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    Stored { id: i64 },
    DecodeFailed,
    StoreFailed,
}

pub struct ResultPersister {
    receiver: Arc<dyn QueueReceiver>,
    store: Arc<dyn RecordStore>,
    metrics: MetricsCollector,
    shutdown: Notify,
}

impl ResultPersister {
    pub fn new(
        receiver: Arc<dyn QueueReceiver>,
        store: Arc<dyn RecordStore>,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            receiver,
            store,
            metrics,
            shutdown: Notify::new(),
        }
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Consume until the queue closes or [`ResultPersister::shutdown`] is
    /// called. A result already being stored is finished first.
    pub async fn run(&self) -> Result<(), BusError> {
        let queue = self.receiver.queue_name().to_string();
        info!(queue = %queue, "result persister consuming");

        loop {
            let mut delivery = tokio::select! {
                _ = self.shutdown.notified() => {
                    info!(queue = %queue, "result persister stopping");
                    break;
                }
                received = self.receiver.recv() => match received {
                    Ok(delivery) => delivery,
                    Err(BusError::Closed(_)) => {
                        info!(queue = %queue, "result queue closed");
                        break;
                    }
                    Err(e) => {
                        warn!(queue = %queue, error = %e, "receive failed");
                        continue;
                    }
                },
            };

            self.handle(&delivery).await;
            if let Err(e) = delivery.ack().await {
                warn!(delivery_tag = delivery.delivery_tag(), error = %e, "ack failed");
            }
        }
        Ok(())
    }

    /// Decode and store one delivery.
    pub async fn handle(&self, delivery: &Delivery) -> PersistOutcome {
        let decoded = match decode::<ProcessedResult>(delivery.body()) {
            Ok(decoded) => decoded,
            Err(e) => {
                error!(trace_id = %e.trace_id(), error = %e, "failed to decode processed result");
                self.metrics.incr(names::RECORDS_STORED, "decode_error");
                return PersistOutcome::DecodeFailed;
            }
        };

        let ctx = TraceContext::continue_from(decoded.envelope.trace_id.clone(), delivery.headers());
        let span = info_span!(
            "store_record",
            trace_id = %ctx.trace_id(),
            otel_trace_id = %ctx.otel_trace_id(),
            span_id = %ctx.span_id(),
            parent_span_id = %ctx.parent_span_id(),
            source = %decoded.envelope.source,
        );

        let record = NewImageRecord::from_result(decoded.envelope.timestamp, &decoded.payload);
        self.store_record(record).instrument(span).await
    }

    async fn store_record(&self, record: NewImageRecord) -> PersistOutcome {
        let started = Instant::now();
        let stored = self.store.insert(&record).await;
        self.metrics.observe(names::STORAGE_DURATION, "insert", started.elapsed());

        match stored {
            Ok(id) => {
                info!(
                    id,
                    source_url = %record.source_url,
                    processing_type = %record.processing_type,
                    storage_path = %record.storage_path,
                    "image record stored"
                );
                self.metrics.incr(names::RECORDS_STORED, "success");
                PersistOutcome::Stored { id }
            }
            Err(e) => {
                error!(source_url = %record.source_url, error = %e, "failed to store image record");
                self.metrics.incr(names::RECORDS_STORED, "error");
                PersistOutcome::StoreFailed
            }
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}

/// Runs a [`ResultPersister`] under the service runner.
pub struct PersisterService {
    persister: Arc<ResultPersister>,
    consume_loop: Mutex<Option<JoinHandle<Result<(), BusError>>>>,
}

impl PersisterService {
    pub fn new(persister: Arc<ResultPersister>) -> Self {
        Self {
            persister,
            consume_loop: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Service for PersisterService {
    async fn start(&self) -> Result<(), BusError> {
        let persister = self.persister.clone();
        *self.consume_loop.lock().await = Some(tokio::spawn(async move { persister.run().await }));
        Ok(())
    }

    async fn stop(&self) -> Result<(), BusError> {
        self.persister.shutdown();
        if let Some(handle) = self.consume_loop.lock().await.take() {
            handle
                .await
                .map_err(|e| BusError::Transport(format!("consume loop: {e}")))??;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "metadata-service"
    }
}
