use std::sync::Arc;

use async_trait::async_trait;

use crate::delivery::{Delivery, QueueMessage};
use crate::error::BusError;

/// Publishes messages onto a named queue.
///
/// Senders are shared across tasks; implementations must allow concurrent
/// `send` calls.
#[async_trait]
pub trait QueueSender: Send + Sync {
    /// Push one message onto the queue.
    async fn send(&self, message: QueueMessage) -> Result<(), BusError>;

    /// Name of the queue this sender publishes to.
    fn queue_name(&self) -> &str;

    /// True once the sender can no longer publish.
    fn is_closed(&self) -> bool {
        false
    }
}

/// Blanket implementation so `Arc<dyn QueueSender>` can be used directly.
#[async_trait]
impl<T: QueueSender + ?Sized> QueueSender for Arc<T> {
    async fn send(&self, message: QueueMessage) -> Result<(), BusError> {
        (**self).send(message).await
    }

    fn queue_name(&self) -> &str {
        (**self).queue_name()
    }

    fn is_closed(&self) -> bool {
        (**self).is_closed()
    }
}

/// Consumes messages from a named queue.
#[async_trait]
pub trait QueueReceiver: Send + Sync {
    /// Pull the next delivery. Blocks until one is available; returns
    /// [`BusError::Closed`] once the queue will never yield again.
    async fn recv(&self) -> Result<Delivery, BusError>;

    fn queue_name(&self) -> &str;

    /// Whether deliveries from this queue wait for an explicit ack.
    fn supports_ack(&self) -> bool {
        false
    }
}

#[async_trait]
impl<T: QueueReceiver + ?Sized> QueueReceiver for Arc<T> {
    async fn recv(&self) -> Result<Delivery, BusError> {
        (**self).recv().await
    }

    fn queue_name(&self) -> &str {
        (**self).queue_name()
    }

    fn supports_ack(&self) -> bool {
        (**self).supports_ack()
    }
}
