//! imgflow-ingestor: HTTP ingress that fans submissions out onto `image.urls`.
//!
//! # Usage
//!
//! ```bash
//! # Defaults: listen 0.0.0.0:8080, broker at broker:5560
//! imgflow-ingestor
//!
//! # Local broker
//! BROKER_HOST=127.0.0.1 imgflow-ingestor --port 9000
//! ```

use std::sync::Arc;

use clap::Parser;
use imgflow_bus::metrics::{metrics_router, MetricsCollector};
use imgflow_bus::queues::{INGESTOR_SOURCE, WORK_QUEUE};
use imgflow_bus::{QueueEndpoints, ServiceBuilder, ServiceRunner, ZmqQueueSender};
use imgflow_core::config::{load_dotenv, Config};
use imgflow_ingestor::{build_router, with_rate_limit, AppState, FanoutPublisher, HttpService};

const DEFAULT_METRICS_PORT: u16 = 8083;

/// HTTP ingress for the image pipeline.
#[derive(Parser, Debug)]
#[command(name = "imgflow-ingestor", version, about)]
struct Cli {
    /// Interface to listen on.
    #[arg(long, env = "SERVER_HOST")]
    host: Option<String>,

    /// Port to listen on.
    #[arg(long, env = "SERVER_PORT")]
    port: Option<u16>,

    /// Broker host to publish jobs to.
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
    tracing::info!(?cli, "starting imgflow-ingestor");

    let mut config = Config::from_env()?;
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(host) = cli.broker_host {
        config.broker.host = host;
    }
    config.log_summary();

    let endpoints = QueueEndpoints::connect(&config.broker);
    let sender = Arc::new(ZmqQueueSender::connect(WORK_QUEUE, &endpoints.work_producer).await?);

    let metrics = MetricsCollector::new(INGESTOR_SOURCE);
    let state = Arc::new(AppState {
        publisher: FanoutPublisher::new(sender.clone(), metrics.clone()),
        metrics: metrics.clone(),
        config: config.redacted_summary(),
        metrics_path: config.metrics.path.clone(),
    });

    let app = with_rate_limit(build_router(state), config.server.rate_limit_per_sec);
    let service = HttpService::new(config.server.bind_addr(), app)
        .on_stop(move || sender.close());

    let mut builder = ServiceBuilder::new(INGESTOR_SOURCE)
        .shutdown_timeout(config.worker.shutdown_timeout())
        .tick(metrics.clone());
    if config.metrics.enabled {
        builder = builder.metrics_server(
            config.metrics.port_or(DEFAULT_METRICS_PORT),
            metrics_router(metrics, &config.metrics.path),
        );
    }

    ServiceRunner::run(Arc::new(service), builder.build(), None).await?;
    tracing::info!("imgflow-ingestor exited cleanly");
    Ok(())
}
