//! imgflow-fetcher: worker pool consuming `image.urls`.
//!
//! Each job is downloaded, transformed, uploaded to object storage and
//! reported on `image.processed`.
//!
//! # Usage
//!
//! ```bash
//! # Defaults: 5 concurrent jobs, MinIO at minio:9000
//! imgflow-fetcher
//!
//! # Local run without MinIO
//! STORAGE_BACKEND=local STORAGE_LOCAL_DIR=/tmp/images imgflow-fetcher --concurrency 8
//! ```

use std::sync::Arc;

use clap::Parser;
use imgflow_bus::metrics::{metrics_router, MetricsCollector};
use imgflow_bus::queues::{FETCHER_SOURCE, RESULT_QUEUE, WORK_QUEUE};
use imgflow_bus::{QueueEndpoints, ServiceBuilder, ServiceRunner, ZmqQueueReceiver, ZmqQueueSender};
use imgflow_core::config::{load_dotenv, Config};
use imgflow_core::AckMode;
use imgflow_fetcher::{
    HttpImageSource, JobPipeline, ObjectImageStore, PoolConfig, WorkerPool, WorkerService,
};

const DEFAULT_METRICS_PORT: u16 = 8081;

/// Image worker pool for the image pipeline.
#[derive(Parser, Debug)]
#[command(name = "imgflow-fetcher", version, about)]
struct Cli {
    /// Maximum number of jobs processed at once.
    #[arg(long, env = "WORKER_CONCURRENCY")]
    concurrency: Option<usize>,

    /// When deliveries are acknowledged: on_delivery or after_processing.
    #[arg(long, env = "WORKER_ACK_MODE")]
    ack_mode: Option<AckMode>,

    /// Broker host to consume from.
    #[arg(long, env = "BROKER_HOST")]
    broker_host: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    tracing::info!(?cli, "starting imgflow-fetcher");

    let mut config = Config::from_env()?;
    if let Some(concurrency) = cli.concurrency {
        anyhow::ensure!(concurrency > 0, "--concurrency must be at least 1");
        config.worker.concurrency = concurrency;
    }
    if let Some(mode) = cli.ack_mode {
        config.worker.ack_mode = mode;
    }
    if let Some(host) = cli.broker_host {
        config.broker.host = host;
    }
    config.log_summary();

    let endpoints = QueueEndpoints::connect(&config.broker);
    let jobs = Arc::new(ZmqQueueReceiver::connect(WORK_QUEUE, &endpoints.work_consumer).await?);
    let results = Arc::new(ZmqQueueSender::connect(RESULT_QUEUE, &endpoints.result_producer).await?);

    let metrics = MetricsCollector::new(FETCHER_SOURCE);
    let source = Arc::new(HttpImageSource::new(config.worker.download_timeout())?);
    let store = Arc::new(ObjectImageStore::from_config(&config.storage)?);
    let pipeline = Arc::new(JobPipeline::new(source, store, results, metrics.clone()));
    let pool = Arc::new(WorkerPool::new(jobs, pipeline, PoolConfig::from(&config.worker)));

    let mut builder = ServiceBuilder::new(FETCHER_SOURCE)
        .shutdown_timeout(config.worker.shutdown_timeout())
        .tick(metrics.clone());
    if config.metrics.enabled {
        builder = builder.metrics_server(
            config.metrics.port_or(DEFAULT_METRICS_PORT),
            metrics_router(metrics, &config.metrics.path),
        );
    }

    ServiceRunner::run(Arc::new(WorkerService::new(pool)), builder.build(), None).await?;
    tracing::info!("imgflow-fetcher exited cleanly");
    Ok(())
}
