//! imgflow-broker: hosts the `image.urls` and `image.processed` queues.
//!
//! Each queue gets a PULL frontend (producers connect) and a PUSH backend
//! (consumers connect); frames are streamed between them unchanged.
//!
//! # Usage
//!
//! ```bash
//! # Defaults: bind 0.0.0.0, work 5560/5561, results 5562/5563
//! imgflow-broker
//!
//! # Custom ports
//! imgflow-broker --work-frontend-port 6000 --work-backend-port 6001
//!
//! # Via environment variables
//! BROKER_BIND_HOST=127.0.0.1 METRICS_PORT=8084 imgflow-broker
//! ```

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use imgflow_bus::broker::QueueBroker;
use imgflow_bus::metrics::{metrics_router, names, spawn_metrics_server, spawn_tick_task, MetricsCollector};
use imgflow_core::config::{load_dotenv, Config};

const DEFAULT_METRICS_PORT: u16 = 8084;

/// Queue broker for the image pipeline.
#[derive(Parser, Debug)]
#[command(name = "imgflow-broker", version, about)]
struct Cli {
    /// Interface to bind all queue sockets on.
    #[arg(long, env = "BROKER_BIND_HOST")]
    bind_host: Option<String>,

    /// Work queue frontend port (producers connect here).
    #[arg(long, env = "BROKER_WORK_FRONTEND_PORT")]
    work_frontend_port: Option<u16>,

    /// Work queue backend port (workers connect here).
    #[arg(long, env = "BROKER_WORK_BACKEND_PORT")]
    work_backend_port: Option<u16>,

    /// Result queue frontend port.
    #[arg(long, env = "BROKER_RESULT_FRONTEND_PORT")]
    result_frontend_port: Option<u16>,

    /// Result queue backend port.
    #[arg(long, env = "BROKER_RESULT_BACKEND_PORT")]
    result_backend_port: Option<u16>,

    /// Interval in seconds between metrics log lines (0 = disabled).
    #[arg(long, env = "BROKER_METRICS_INTERVAL", default_value_t = 30)]
    metrics_interval: u64,
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
    tracing::info!(?cli, "starting imgflow-broker");

    let mut config = Config::from_env()?;
    if let Some(host) = cli.bind_host {
        config.broker.bind_host = host;
    }
    if let Some(port) = cli.work_frontend_port {
        config.broker.work.frontend = port;
    }
    if let Some(port) = cli.work_backend_port {
        config.broker.work.backend = port;
    }
    if let Some(port) = cli.result_frontend_port {
        config.broker.results.frontend = port;
    }
    if let Some(port) = cli.result_backend_port {
        config.broker.results.backend = port;
    }
    config.log_summary();

    let collector = MetricsCollector::new("queue-broker");
    let broker = Arc::new(QueueBroker::from_config(&config.broker, collector.clone()));

    let (metrics_tx, metrics_rx) = tokio::sync::watch::channel(false);
    let _tick = spawn_tick_task(collector.clone(), metrics_rx.clone());
    let metrics_server = if config.metrics.enabled {
        let app = metrics_router(collector.clone(), &config.metrics.path);
        Some(spawn_metrics_server(
            config.metrics.port_or(DEFAULT_METRICS_PORT),
            app,
            metrics_rx,
        ))
    } else {
        None
    };

    let broker_for_signal = broker.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received");
        broker_for_signal.shutdown();
    });

    if cli.metrics_interval > 0 {
        let collector = collector.clone();
        let every = Duration::from_secs(cli.metrics_interval);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let snapshot = collector.snapshot();
                let forwarded = snapshot.counters.get(names::MESSAGES_FORWARDED);
                tracing::info!(
                    total = collector.counter_total(names::MESSAGES_FORWARDED),
                    "broker metrics"
                );
                for (queue, count) in forwarded.into_iter().flatten() {
                    tracing::debug!(queue = %queue, count, "queue stats");
                }
            }
        });
    }

    // Run the broker (blocks until shutdown).
    broker.run().await?;

    let _ = metrics_tx.send(true);
    if let Some(handle) = metrics_server {
        let _ = handle.await;
    }

    tracing::info!("imgflow-broker exited cleanly");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for ctrl_c");
    }
}
