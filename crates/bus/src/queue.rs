use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use imgflow_core::config::BrokerConfig;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};
use zeromq::{PullSocket, PushSocket, Socket, SocketRecv, SocketSend};

use crate::delivery::{Delivery, QueueMessage};
use crate::error::BusError;
use crate::messages::queues::{RESULT_QUEUE, WORK_QUEUE};
use crate::traits::{QueueReceiver, QueueSender};
use crate::transport::Transport;

/// Where producers and consumers of each queue attach to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEndpoints {
    pub work_producer: Transport,
    pub work_consumer: Transport,
    pub result_producer: Transport,
    pub result_consumer: Transport,
}

impl QueueEndpoints {
    /// Connect-side endpoints for services talking to the broker.
    pub fn connect(config: &BrokerConfig) -> Self {
        Self::on_host(&config.host, config)
    }

    /// Bind-side endpoints for the broker itself.
    pub fn bind(config: &BrokerConfig) -> Self {
        Self::on_host(&config.bind_host, config)
    }

    fn on_host(host: &str, config: &BrokerConfig) -> Self {
        Self {
            work_producer: Transport::tcp(host, config.work.frontend),
            work_consumer: Transport::tcp(host, config.work.backend),
            result_producer: Transport::tcp(host, config.results.frontend),
            result_consumer: Transport::tcp(host, config.results.backend),
        }
    }

    /// Producer-side endpoint for a named queue.
    pub fn producer(&self, queue: &str) -> Option<&Transport> {
        match queue {
            WORK_QUEUE => Some(&self.work_producer),
            RESULT_QUEUE => Some(&self.result_producer),
            _ => None,
        }
    }

    /// Consumer-side endpoint for a named queue.
    pub fn consumer(&self, queue: &str) -> Option<&Transport> {
        match queue {
            WORK_QUEUE => Some(&self.work_consumer),
            RESULT_QUEUE => Some(&self.result_consumer),
            _ => None,
        }
    }
}

/// PUSH socket that publishes onto a queue hosted by the broker.
///
/// ZeroMQ settles messages at the socket, so there is no broker-side
/// acknowledgement; a message is gone once the consumer's PULL socket
/// has read it.
pub struct ZmqQueueSender {
    queue: String,
    socket: Mutex<PushSocket>,
    closed: AtomicBool,
}

impl ZmqQueueSender {
    /// Connect to the queue's frontend.
    #[instrument(skip_all, fields(queue = %queue, endpoint = %transport))]
    pub async fn connect(queue: &str, transport: &Transport) -> Result<Self, BusError> {
        let mut socket = PushSocket::new();
        let endpoint = transport.endpoint();
        info!(endpoint = %endpoint, "connecting PUSH socket");
        socket.connect(&endpoint).await?;
        Ok(Self::from_socket(queue, socket))
    }

    /// Bind the PUSH side. Used by the broker's backend and by tests
    /// that run without a broker.
    #[instrument(skip_all, fields(queue = %queue, endpoint = %transport))]
    pub async fn bind(queue: &str, transport: &Transport) -> Result<Self, BusError> {
        let mut socket = PushSocket::new();
        let endpoint = transport.endpoint();
        info!(endpoint = %endpoint, "binding PUSH socket");
        socket.bind(&endpoint).await?;
        Ok(Self::from_socket(queue, socket))
    }

    fn from_socket(queue: &str, socket: PushSocket) -> Self {
        Self {
            queue: queue.to_string(),
            socket: Mutex::new(socket),
            closed: AtomicBool::new(false),
        }
    }

    /// Refuse all further sends.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        debug!(queue = %self.queue, "sender closed");
    }
}

#[async_trait]
impl QueueSender for ZmqQueueSender {
    async fn send(&self, message: QueueMessage) -> Result<(), BusError> {
        if self.is_closed() {
            return Err(BusError::Closed(self.queue.clone()));
        }
        let frames = message.to_frames()?;
        let mut socket = self.socket.lock().await;
        socket.send(frames).await?;
        Ok(())
    }

    fn queue_name(&self) -> &str {
        &self.queue
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// PULL socket that consumes a queue hosted by the broker.
///
/// Several receivers on the same backend are load-balanced round-robin by
/// the broker's PUSH socket.
pub struct ZmqQueueReceiver {
    queue: String,
    socket: Mutex<PullSocket>,
}

impl ZmqQueueReceiver {
    /// Connect to the queue's backend.
    #[instrument(skip_all, fields(queue = %queue, endpoint = %transport))]
    pub async fn connect(queue: &str, transport: &Transport) -> Result<Self, BusError> {
        let mut socket = PullSocket::new();
        let endpoint = transport.endpoint();
        info!(endpoint = %endpoint, "connecting PULL socket");
        socket.connect(&endpoint).await?;
        Ok(Self {
            queue: queue.to_string(),
            socket: Mutex::new(socket),
        })
    }

    /// Bind the PULL side. Used by the broker's frontend.
    #[instrument(skip_all, fields(queue = %queue, endpoint = %transport))]
    pub async fn bind(queue: &str, transport: &Transport) -> Result<Self, BusError> {
        let mut socket = PullSocket::new();
        let endpoint = transport.endpoint();
        info!(endpoint = %endpoint, "binding PULL socket");
        socket.bind(&endpoint).await?;
        Ok(Self {
            queue: queue.to_string(),
            socket: Mutex::new(socket),
        })
    }
}

#[async_trait]
impl QueueReceiver for ZmqQueueReceiver {
    async fn recv(&self) -> Result<Delivery, BusError> {
        let mut socket = self.socket.lock().await;
        let frames = socket.recv().await?;
        let message = QueueMessage::from_frames(&frames)?;
        Ok(Delivery::settled(message))
    }

    fn queue_name(&self) -> &str {
        &self.queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::trace::Headers;
    use imgflow_core::config::QueuePorts;

    #[test]
    fn endpoints_follow_broker_config() {
        let config = BrokerConfig {
            host: "broker".into(),
            bind_host: "0.0.0.0".into(),
            work: QueuePorts { frontend: 5560, backend: 5561 },
            results: QueuePorts { frontend: 5562, backend: 5563 },
        };
        let connect = QueueEndpoints::connect(&config);
        assert_eq!(connect.producer(WORK_QUEUE).unwrap().endpoint(), "tcp://broker:5560");
        assert_eq!(connect.consumer(RESULT_QUEUE).unwrap().endpoint(), "tcp://broker:5563");
        assert!(connect.producer("nope").is_none());

        let bind = QueueEndpoints::bind(&config);
        assert_eq!(bind.work_consumer.endpoint(), "tcp://0.0.0.0:5561");
    }

    #[tokio::test]
    async fn push_pull_preserves_headers() {
        let transport = Transport::tcp("127.0.0.1", 15710);
        let receiver = ZmqQueueReceiver::bind(WORK_QUEUE, &transport).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let sender = ZmqQueueSender::connect(WORK_QUEUE, &transport).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut headers = Headers::new();
        headers.insert("traceparent".into(), "00-x".into());
        sender
            .send(QueueMessage::with_headers(b"hello".to_vec(), headers.clone()))
            .await
            .unwrap();

        let delivery = tokio::time::timeout(Duration::from_secs(2), receiver.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.body(), b"hello");
        assert_eq!(delivery.headers(), &headers);
        assert!(!delivery.needs_ack());
        assert!(!receiver.supports_ack());
    }

    #[tokio::test]
    async fn closed_sender_refuses() {
        let transport = Transport::tcp("127.0.0.1", 15711);
        let _receiver = ZmqQueueReceiver::bind(RESULT_QUEUE, &transport).await.unwrap();
        let sender = ZmqQueueSender::connect(RESULT_QUEUE, &transport).await.unwrap();
        sender.close();
        assert!(sender.is_closed());
        let err = sender.send(QueueMessage::new(vec![1])).await.unwrap_err();
        assert!(matches!(err, BusError::Closed(ref q) if q == RESULT_QUEUE));
    }
}
