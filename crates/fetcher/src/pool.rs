//! Bounded-concurrency consumer of the work queue.
//!
//! One loop pulls deliveries and, for each, takes a semaphore permit before
//! spawning the job task; at capacity the loop itself waits, so no more than
//! `concurrency` jobs ever run at once. The permit travels with the task and
//! is released when it ends, however it ends.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use imgflow_bus::metrics::names;
use imgflow_bus::{BusError, Delivery, QueueReceiver, Service};
use imgflow_core::config::WorkerConfig;
use imgflow_core::AckMode;
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::pipeline::JobPipeline;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub concurrency: usize,
    pub ack_mode: AckMode,
    /// Upper bound on waiting for in-flight jobs at shutdown.
    pub drain_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            ack_mode: AckMode::OnDelivery,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&WorkerConfig> for PoolConfig {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            ack_mode: config.ack_mode,
            drain_timeout: config.shutdown_timeout(),
        }
    }
}

pub struct WorkerPool {
    receiver: Arc<dyn QueueReceiver>,
    pipeline: Arc<JobPipeline>,
    semaphore: Arc<Semaphore>,
    config: PoolConfig,
    shutdown: Notify,
}

impl WorkerPool {
    pub fn new(receiver: Arc<dyn QueueReceiver>, pipeline: Arc<JobPipeline>, config: PoolConfig) -> Self {
        let concurrency = config.concurrency.max(1);
        Self {
            receiver,
            pipeline,
            semaphore: Arc::new(Semaphore::new(concurrency)),
            config: PoolConfig { concurrency, ..config },
            shutdown: Notify::new(),
        }
    }

    /// Consume until the queue closes or [`WorkerPool::shutdown`] is called,
    /// then wait for in-flight jobs (bounded by the drain timeout).
    pub async fn run(&self) -> Result<(), BusError> {
        let queue = self.receiver.queue_name().to_string();
        if self.config.ack_mode == AckMode::AfterProcessing && !self.receiver.supports_ack() {
            warn!(
                queue = %queue,
                "after_processing ack requested but the transport settles on receipt; deliveries are effectively acked on delivery"
            );
        }
        info!(
            queue = %queue,
            concurrency = self.config.concurrency,
            ack_mode = %self.config.ack_mode,
            "worker pool consuming"
        );

        loop {
            let mut delivery = tokio::select! {
                _ = self.shutdown.notified() => {
                    info!(queue = %queue, "worker pool stopping");
                    break;
                }
                received = self.receiver.recv() => match received {
                    Ok(delivery) => delivery,
                    Err(BusError::Closed(_)) => {
                        info!(queue = %queue, "work queue closed");
                        break;
                    }
                    Err(e) => {
                        warn!(queue = %queue, error = %e, "receive failed");
                        continue;
                    }
                },
            };

            if self.config.ack_mode == AckMode::OnDelivery {
                ack(&mut delivery).await;
            }

            let permit = match self.semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    error!("worker semaphore closed");
                    break;
                }
            };

            let pipeline = self.pipeline.clone();
            let ack_after = self.config.ack_mode == AckMode::AfterProcessing;
            tokio::spawn(async move {
                let _permit = permit;
                let _active = pipeline.metrics().track(names::ACTIVE_WORKERS);
                let outcome = pipeline.process(&delivery).await;
                debug!(?outcome, "job finished");
                if ack_after {
                    ack(&mut delivery).await;
                }
            });
        }

        self.drain().await;
        Ok(())
    }

    /// Wait until every permit is back, i.e. no job is running.
    async fn drain(&self) {
        let all = self.config.concurrency as u32;
        match tokio::time::timeout(self.config.drain_timeout, self.semaphore.acquire_many(all)).await {
            Ok(Ok(_permits)) => info!("worker pool drained"),
            Ok(Err(_)) => warn!("worker semaphore closed while draining"),
            Err(_) => warn!(
                in_flight = self.config.concurrency - self.semaphore.available_permits(),
                "drain timed out, abandoning in-flight jobs"
            ),
        }
    }

    /// Ask the consume loop to stop taking deliveries.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Jobs currently running.
    pub fn in_flight(&self) -> usize {
        self.config.concurrency - self.semaphore.available_permits()
    }
}

async fn ack(delivery: &mut Delivery) {
    if let Err(e) = delivery.ack().await {
        warn!(delivery_tag = delivery.delivery_tag(), error = %e, "ack failed");
    }
}

/// Runs a [`WorkerPool`] under the service runner.
pub struct WorkerService {
    pool: Arc<WorkerPool>,
    consume_loop: Mutex<Option<JoinHandle<Result<(), BusError>>>>,
}

impl WorkerService {
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        Self {
            pool,
            consume_loop: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Service for WorkerService {
    async fn start(&self) -> Result<(), BusError> {
        let pool = self.pool.clone();
        *self.consume_loop.lock().await = Some(tokio::spawn(async move { pool.run().await }));
        Ok(())
    }

    async fn stop(&self) -> Result<(), BusError> {
        self.pool.shutdown();
        if let Some(handle) = self.consume_loop.lock().await.take() {
            handle
                .await
                .map_err(|e| BusError::Transport(format!("consume loop: {e}")))??;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "image-fetcher"
    }
}
