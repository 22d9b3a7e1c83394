//! Service trait and lifecycle management.
//!
//! Provides the [`Service`] trait for long-running processes,
//! [`ServiceBuilder`] for fluent configuration, and [`ServiceRunner`] for
//! driving start, signal handling, the metrics endpoint and graceful stop.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use tokio::sync::{watch, Notify};
use tracing::{info, warn};

use crate::error::BusError;
use crate::metrics::{spawn_metrics_server, spawn_tick_task, MetricsCollector};

// ── Service trait ────────────────────────────────────────────────────

/// A long-running process of the pipeline (ingress, worker pool, persister).
///
/// `start` must return once the service is running; the work itself lives
/// in tasks the service spawns. `stop` drains in-flight work.
#[async_trait]
pub trait Service: Send + Sync {
    /// Called once when the service starts. Open connections, spawn loops.
    async fn start(&self) -> Result<(), BusError>;

    /// Called once during graceful shutdown. Drain in-flight work.
    async fn stop(&self) -> Result<(), BusError>;

    /// Human-readable name for logging.
    fn name(&self) -> &str;
}

// ── ServiceBuilder ───────────────────────────────────────────────────

/// Fluent builder for a [`ServiceRunnerConfig`].
///
/// # Example
/// ```ignore
/// let config = ServiceBuilder::new("image-fetcher")
///     .shutdown_timeout(Duration::from_secs(30))
///     .metrics_server(8081, metrics_router(collector.clone(), "/metrics"))
///     .tick(collector)
///     .build();
/// ```
pub struct ServiceBuilder {
    name: String,
    shutdown_timeout: Duration,
    metrics_server: Option<(u16, Router)>,
    tick: Option<MetricsCollector>,
}

impl ServiceBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shutdown_timeout: Duration::from_secs(30),
            metrics_server: None,
            tick: None,
        }
    }

    /// Maximum time `stop()` may take (default: 30s).
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Serve `app` on `port` for the lifetime of the service.
    pub fn metrics_server(mut self, port: u16, app: Router) -> Self {
        self.metrics_server = Some((port, app));
        self
    }

    /// Roll the collector's throughput window every second.
    pub fn tick(mut self, collector: MetricsCollector) -> Self {
        self.tick = Some(collector);
        self
    }

    pub fn build(self) -> ServiceRunnerConfig {
        ServiceRunnerConfig {
            name: self.name,
            shutdown_timeout: self.shutdown_timeout,
            metrics_server: self.metrics_server,
            tick: self.tick,
        }
    }
}

/// Configuration produced by [`ServiceBuilder`], consumed by [`ServiceRunner`].
pub struct ServiceRunnerConfig {
    pub name: String,
    pub shutdown_timeout: Duration,
    pub metrics_server: Option<(u16, Router)>,
    pub tick: Option<MetricsCollector>,
}

// ── ServiceRunner ────────────────────────────────────────────────────

/// Runs a [`Service`] until SIGINT/SIGTERM or a programmatic notify.
pub struct ServiceRunner;

impl ServiceRunner {
    /// Run a service to completion.
    ///
    /// Blocks until a shutdown signal is received or `shutdown_notify` is
    /// triggered, then calls `stop()` bounded by the configured timeout.
    pub async fn run(
        service: Arc<dyn Service>,
        config: ServiceRunnerConfig,
        shutdown_notify: Option<Arc<Notify>>,
    ) -> Result<(), BusError> {
        let name = config.name.clone();
        info!(service = %name, "starting service");

        service.start().await?;
        info!(service = %name, "service started");

        let (metrics_tx, metrics_rx) = watch::channel(false);
        let mut background = Vec::new();
        if let Some((port, app)) = config.metrics_server {
            background.push(spawn_metrics_server(port, app, metrics_rx.clone()));
        }
        if let Some(collector) = config.tick {
            background.push(spawn_tick_task(collector, metrics_rx));
        }

        Self::wait_for_shutdown(shutdown_notify).await;
        info!(service = %name, "shutdown signal received");

        info!(service = %name, timeout = ?config.shutdown_timeout, "stopping service");
        match tokio::time::timeout(config.shutdown_timeout, service.stop()).await {
            Ok(Ok(())) => {
                info!(service = %name, "service stopped gracefully");
            }
            Ok(Err(e)) => {
                warn!(service = %name, error = %e, "service stop returned error");
            }
            Err(_) => {
                warn!(service = %name, "service stop timed out, forcing shutdown");
            }
        }

        let _ = metrics_tx.send(true);
        for handle in background {
            let _ = handle.await;
        }

        info!(service = %name, "service shutdown complete");
        Ok(())
    }

    /// Wait for either an OS shutdown signal or a programmatic notification.
    async fn wait_for_shutdown(external: Option<Arc<Notify>>) {
        match external {
            Some(notify) => {
                tokio::select! {
                    _ = Self::os_signal() => {}
                    _ = notify.notified() => {}
                }
            }
            None => {
                Self::os_signal().await;
            }
        }
    }

    /// Wait for SIGINT or SIGTERM (Unix) or Ctrl+C (cross-platform fallback).
    async fn os_signal() {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT");
            let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
            tokio::select! {
                _ = sigint.recv() => {}
                _ = sigterm.recv() => {}
            }
        }

        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to listen for ctrl_c");
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────
