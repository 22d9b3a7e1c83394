use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use imgflow_bus::{BusError, Service};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Serves an axum router as a [`Service`]: `start` binds and spawns the
/// server, `stop` triggers graceful shutdown and waits for in-flight
/// requests. Handlers see the peer address as `ConnectInfo<SocketAddr>`.
pub struct HttpService {
    addr: String,
    app: Router,
    shutdown: Arc<Notify>,
    server: Mutex<Option<JoinHandle<()>>>,
    /// Hook run once the server has drained, e.g. closing the queue sender.
    on_stop: Option<Box<dyn Fn() + Send + Sync>>,
}

impl HttpService {
    pub fn new(addr: impl Into<String>, app: Router) -> Self {
        Self {
            addr: addr.into(),
            app,
            shutdown: Arc::new(Notify::new()),
            server: Mutex::new(None),
            on_stop: None,
        }
    }

    pub fn on_stop(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_stop = Some(Box::new(hook));
        self
    }
}

#[async_trait]
impl Service for HttpService {
    async fn start(&self) -> Result<(), BusError> {
        let listener = tokio::net::TcpListener::bind(self.addr.as_str()).await?;
        info!(addr = %self.addr, "ingress HTTP server listening");

        let app = self.app.clone();
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
                .with_graceful_shutdown(async move { shutdown.notified().await })
                .await;
            if let Err(e) = served {
                error!(error = %e, "ingress HTTP server failed");
            }
        });
        *self.server.lock().await = Some(handle);
        Ok(())
    }

    async fn stop(&self) -> Result<(), BusError> {
        self.shutdown.notify_one();
        if let Some(handle) = self.server.lock().await.take() {
            handle
                .await
                .map_err(|e| BusError::Transport(format!("HTTP server task: {e}")))?;
        }
        if let Some(hook) = &self.on_stop {
            hook();
        }
        info!("ingress HTTP server stopped");
        Ok(())
    }

    fn name(&self) -> &str {
        "url-ingestor"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use axum::routing::get;

    #[tokio::test]
    async fn serves_until_stopped() {
        let app = Router::new().route("/ping", get(|| async { "pong" }));
        let addr = "127.0.0.1:15730";
        let stopped = Arc::new(AtomicBool::new(false));
        let flag = stopped.clone();
        let service = HttpService::new(addr, app).on_stop(move || flag.store(true, Ordering::SeqCst));

        service.start().await.unwrap();

        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        drop(stream);

        tokio::time::timeout(Duration::from_secs(5), service.stop())
            .await
            .expect("stop should finish")
            .unwrap();
        assert!(stopped.load(Ordering::SeqCst));
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }
}
