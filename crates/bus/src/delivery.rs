use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use zeromq::ZmqMessage;

use crate::error::BusError;
use crate::trace::Headers;

/// A message as it sits on a queue: transport headers plus an opaque body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueMessage {
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl QueueMessage {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            headers: Headers::new(),
            body,
        }
    }

    pub fn with_headers(body: Vec<u8>, headers: Headers) -> Self {
        Self { headers, body }
    }

    /// Two ZeroMQ frames: `[headers JSON, body]`.
    pub fn to_frames(&self) -> Result<ZmqMessage, BusError> {
        let headers = serde_json::to_vec(&self.headers)?;
        let mut frames = ZmqMessage::from(headers);
        frames.push_back(self.body.clone().into());
        Ok(frames)
    }

    pub fn from_frames(frames: &ZmqMessage) -> Result<Self, BusError> {
        let header_frame = frames
            .get(0)
            .ok_or_else(|| BusError::Frame("empty ZMQ message".into()))?;
        let body = frames
            .get(1)
            .ok_or_else(|| BusError::Frame("missing body frame".into()))?;
        let headers = if header_frame.is_empty() {
            Headers::new()
        } else {
            serde_json::from_slice(header_frame.as_ref())?
        };
        Ok(Self {
            headers,
            body: body.to_vec(),
        })
    }
}

/// Settles a delivery with the queue it came from.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self, delivery_tag: u64) -> Result<(), BusError>;
}

/// A received message plus the handle needed to acknowledge it.
///
/// Transports without acknowledgement hand out deliveries with no
/// acknowledger; [`Delivery::ack`] is then a no-op.
pub struct Delivery {
    message: QueueMessage,
    delivery_tag: u64,
    acker: Option<Arc<dyn Acknowledger>>,
}

impl Delivery {
    /// A delivery that was settled by the transport on receipt.
    pub fn settled(message: QueueMessage) -> Self {
        Self {
            message,
            delivery_tag: 0,
            acker: None,
        }
    }

    pub fn with_acker(message: QueueMessage, delivery_tag: u64, acker: Arc<dyn Acknowledger>) -> Self {
        Self {
            message,
            delivery_tag,
            acker: Some(acker),
        }
    }

    pub fn headers(&self) -> &Headers {
        &self.message.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.message.body
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Whether the queue is still waiting for an ack.
    pub fn needs_ack(&self) -> bool {
        self.acker.is_some()
    }

    /// Acknowledge the delivery. Repeated calls after the first are no-ops.
    pub async fn ack(&mut self) -> Result<(), BusError> {
        match self.acker.take() {
            Some(acker) => acker.ack(self.delivery_tag).await,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("headers", &self.message.headers)
            .field("body_len", &self.message.body.len())
            .field("needs_ack", &self.needs_ack())
            .finish()
    }
}
