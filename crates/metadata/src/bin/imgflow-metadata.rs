//! imgflow-metadata: persists processed-image results.
//!
//! Consumes `image.processed` and writes one `image_records` row per
//! result. The metrics port also serves `/records` and `/records/{id}`.
//!
//! # Usage
//!
//! ```bash
//! # PostgreSQL from DB_* variables
//! imgflow-metadata
//!
//! # Without a database
//! imgflow-metadata --in-memory
//! ```

use std::sync::Arc;

use clap::Parser;
use imgflow_bus::metrics::{metrics_router, MetricsCollector};
use imgflow_bus::queues::{METADATA_SOURCE, RESULT_QUEUE};
use imgflow_bus::{QueueEndpoints, ServiceBuilder, ServiceRunner, ZmqQueueReceiver};
use imgflow_core::config::{load_dotenv, Config};
use imgflow_metadata::{
    records_router, MemoryRecordStore, PersisterService, PgRecordStore, RecordStore,
    ResultPersister,
};

const DEFAULT_METRICS_PORT: u16 = 8082;

/// Result persister for the image pipeline.
#[derive(Parser, Debug)]
#[command(name = "imgflow-metadata", version, about)]
struct Cli {
    /// Keep records in process memory instead of PostgreSQL.
    #[arg(long)]
    in_memory: bool,

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
    tracing::info!(?cli, "starting imgflow-metadata");

    let mut config = Config::from_env()?;
    if let Some(host) = cli.broker_host {
        config.broker.host = host;
    }
    config.log_summary();

    let store: Arc<dyn RecordStore> = if cli.in_memory {
        tracing::warn!("records kept in memory, they are lost on exit");
        Arc::new(MemoryRecordStore::new())
    } else {
        Arc::new(PgRecordStore::connect(&config.postgres).await?)
    };

    let endpoints = QueueEndpoints::connect(&config.broker);
    let results = Arc::new(ZmqQueueReceiver::connect(RESULT_QUEUE, &endpoints.result_consumer).await?);

    let metrics = MetricsCollector::new(METADATA_SOURCE);
    let persister = Arc::new(ResultPersister::new(results, store.clone(), metrics.clone()));

    let mut builder = ServiceBuilder::new(METADATA_SOURCE)
        .shutdown_timeout(config.worker.shutdown_timeout())
        .tick(metrics.clone());
    if config.metrics.enabled {
        builder = builder.metrics_server(
            config.metrics.port_or(DEFAULT_METRICS_PORT),
            metrics_router(metrics, &config.metrics.path).merge(records_router(store)),
        );
    }

    ServiceRunner::run(Arc::new(PersisterService::new(persister)), builder.build(), None).await?;
    tracing::info!("imgflow-metadata exited cleanly");
    Ok(())
}
