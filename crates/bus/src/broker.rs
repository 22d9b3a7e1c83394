use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use imgflow_core::config::BrokerConfig;
use tokio::task::JoinSet;
use zeromq::prelude::*;
use zeromq::{PullSocket, PushSocket, ZmqError, ZmqMessage};

use crate::error::BusError;
use crate::messages::queues::{RESULT_QUEUE, WORK_QUEUE};
use crate::metrics::{names, MetricsCollector};
use crate::queue::QueueEndpoints;
use crate::transport::Transport;

/// How often the forward loop wakes up to check the shutdown flag.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long a held-back message waits before the next delivery attempt.
const RETRY_INTERVAL: Duration = Duration::from_millis(25);

/// One named queue hosted by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueRoute {
    pub name: String,
    /// Producers connect PUSH here; the broker binds PULL.
    pub frontend: Transport,
    /// Consumers connect PULL here; the broker binds PUSH.
    pub backend: Transport,
}

impl QueueRoute {
    pub fn new(name: impl Into<String>, frontend: Transport, backend: Transport) -> Self {
        Self {
            name: name.into(),
            frontend,
            backend,
        }
    }
}

/// Streamer that hosts the pipeline's queues.
///
/// For every route the broker binds a PULL frontend and a PUSH backend and
/// forwards frames between them unchanged. The PUSH side load-balances
/// across connected consumers. While no consumer is connected, frames are
/// held in an unbounded in-order backlog and delivered once one connects.
/// The backlog lives in memory only and is lost when the broker stops.
pub struct QueueBroker {
    routes: Vec<QueueRoute>,
    collector: MetricsCollector,
    shutdown: Arc<AtomicBool>,
}

impl QueueBroker {
    pub fn new(routes: Vec<QueueRoute>, collector: MetricsCollector) -> Self {
        Self {
            routes,
            collector,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Broker hosting the work and result queues on the configured ports.
    pub fn from_config(config: &BrokerConfig, collector: MetricsCollector) -> Self {
        let endpoints = QueueEndpoints::bind(config);
        Self::new(
            vec![
                QueueRoute::new(WORK_QUEUE, endpoints.work_producer, endpoints.work_consumer),
                QueueRoute::new(RESULT_QUEUE, endpoints.result_producer, endpoints.result_consumer),
            ],
            collector,
        )
    }

    pub fn routes(&self) -> &[QueueRoute] {
        &self.routes
    }

    pub fn collector(&self) -> &MetricsCollector {
        &self.collector
    }

    /// Signal the broker to shut down gracefully.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Bind every route and run the forward loops until shutdown.
    ///
    /// All sockets are bound before any loop starts, so a bind failure on
    /// one route fails the whole broker.
    pub async fn run(&self) -> Result<(), BusError> {
        let mut bound = Vec::with_capacity(self.routes.len());
        for route in &self.routes {

            let mut frontend = PullSocket::new();
            frontend.bind(&route.frontend.endpoint()).await?;
            tracing::info!(
                queue = %route.name,
                endpoint = %route.frontend,
                "queue frontend (PULL) bound, producers connect here"
            );

            let mut backend = PushSocket::new();
            backend.bind(&route.backend.endpoint()).await?;
            tracing::info!(
                queue = %route.name,
                endpoint = %route.backend,
                "queue backend (PUSH) bound, consumers connect here"
            );

            bound.push((route.name.clone(), frontend, backend));
        }

        let mut loops = JoinSet::new();
        for (name, frontend, backend) in bound {
            let collector = self.collector.clone();
            let shutdown = self.shutdown.clone();
            loops.spawn(forward_loop(name, frontend, backend, collector, shutdown));
        }

        tracing::info!(queues = self.routes.len(), "broker forward loops started");
        while let Some(joined) = loops.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "forward loop panicked");
            }
        }

        tracing::info!(
            forwarded = self.collector.counter_total(names::MESSAGES_FORWARDED),
            "broker stopped"
        );
        Ok(())
    }
}

async fn forward_loop(
    queue: String,
    mut frontend: PullSocket,
    mut backend: PushSocket,
    collector: MetricsCollector,
    shutdown: Arc<AtomicBool>,
) {
    let mut backlog: VecDeque<ZmqMessage> = VecDeque::new();
    let mut waiting = false;

    loop {
        if shutdown.load(Ordering::SeqCst) {
            if !backlog.is_empty() {
                tracing::warn!(queue = %queue, pending = backlog.len(), "undelivered messages dropped at shutdown");
            }
            tracing::info!(queue = %queue, "forward loop shutting down");
            break;
        }

        while let Some(frames) = backlog.pop_front() {
            match backend.send(frames).await {
                Ok(()) => {
                    collector.incr(names::MESSAGES_FORWARDED, &queue);
                    if waiting {
                        tracing::info!(queue = %queue, "consumer connected, delivering backlog");
                        waiting = false;
                    }
                }
                Err(ZmqError::ReturnToSender { message, .. }) => {
                    backlog.push_front(message);
                    if !waiting {
                        tracing::info!(queue = %queue, "no consumer connected, holding messages");
                        waiting = true;
                    }
                    break;
                }
                Err(e) => {
                    tracing::warn!(queue = %queue, error = %e, "backend send error, message lost");
                    collector.incr(names::PUBLISH_ERRORS, &queue);
                }
            }
        }

        // Wake up periodically to check the shutdown flag and retry the backlog.
        let wait = if backlog.is_empty() { POLL_INTERVAL } else { RETRY_INTERVAL };
        match tokio::time::timeout(wait, frontend.recv()).await {
            Ok(Ok(frames)) => {
                let byte_size: usize = frames.iter().map(|f| f.len()).sum();
                tracing::debug!(queue = %queue, bytes = byte_size, backlog = backlog.len(), "forwarding message");
                backlog.push_back(frames);
            }
            Ok(Err(e)) => tracing::warn!(queue = %queue, error = %e, "frontend recv error"),
            Err(_) => {}
        }
    }
}
