//! In-process queue with the same contract as the ZeroMQ transport.
//!
//! Backs local runs and the test suites. Unlike ZeroMQ it can hold
//! deliveries until they are acknowledged, which makes the worker pool's
//! ack point observable.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::delivery::{Acknowledger, Delivery, QueueMessage};
use crate::error::BusError;
use crate::traits::{QueueReceiver, QueueSender};

/// Deliveries handed out but not yet acknowledged, keyed by tag.
#[derive(Default)]
struct Ledger {
    pending: StdMutex<BTreeMap<u64, QueueMessage>>,
}

impl Ledger {
    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<u64, QueueMessage>> {
        // A poisoned ledger still holds valid entries.
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Acknowledger for Ledger {
    async fn ack(&self, delivery_tag: u64) -> Result<(), BusError> {
        match self.lock().remove(&delivery_tag) {
            Some(_) => Ok(()),
            None => Err(BusError::Ack(format!("unknown delivery tag {delivery_tag}"))),
        }
    }
}

/// Unbounded in-memory queue usable as both sender and receiver.
pub struct MemoryQueue {
    name: String,
    tx: StdMutex<Option<mpsc::UnboundedSender<QueueMessage>>>,
    rx: Mutex<mpsc::UnboundedReceiver<QueueMessage>>,
    manual_ack: bool,
    ledger: Arc<Ledger>,
    next_tag: AtomicU64,
    sent: AtomicUsize,
    send_limit: Option<usize>,
}

impl MemoryQueue {
    /// Queue that settles deliveries on receipt.
    pub fn new(name: impl Into<String>) -> Self {
        Self::build(name.into(), false, None)
    }

    /// Queue that keeps every delivery pending until it is acknowledged.
    pub fn with_manual_ack(name: impl Into<String>) -> Self {
        Self::build(name.into(), true, None)
    }

    /// Queue whose sends fail once `limit` messages have been accepted.
    pub fn failing_after(name: impl Into<String>, limit: usize) -> Self {
        Self::build(name.into(), false, Some(limit))
    }

    fn build(name: String, manual_ack: bool, send_limit: Option<usize>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            name,
            tx: StdMutex::new(Some(tx)),
            rx: Mutex::new(rx),
            manual_ack,
            ledger: Arc::new(Ledger::default()),
            next_tag: AtomicU64::new(1),
            sent: AtomicUsize::new(0),
            send_limit,
        }
    }

    fn sender(&self) -> Option<mpsc::UnboundedSender<QueueMessage>> {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Stop accepting sends. Receivers drain what is queued, then get
    /// [`BusError::Closed`].
    pub fn close(&self) {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    /// Number of messages accepted by `send` so far.
    pub fn sent_count(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }

    /// Number of deliveries still waiting for an ack.
    pub fn unacked_count(&self) -> usize {
        self.ledger.lock().len()
    }

    /// Put every unacknowledged delivery back on the queue, as a broker
    /// does when a consumer disappears. Returns how many were requeued.
    pub fn redeliver_unacked(&self) -> Result<usize, BusError> {
        let pending = std::mem::take(&mut *self.ledger.lock());
        let tx = self
            .sender()
            .ok_or_else(|| BusError::Closed(self.name.clone()))?;
        let count = pending.len();
        for (_, message) in pending {
            tx.send(message)
                .map_err(|_| BusError::Closed(self.name.clone()))?;
        }
        Ok(count)
    }

    /// Take everything currently queued without blocking.
    pub async fn drain(&self) -> Vec<QueueMessage> {
        let mut rx = self.rx.lock().await;
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            out.push(message);
        }
        out
    }
}

#[async_trait]
impl QueueSender for MemoryQueue {
    async fn send(&self, message: QueueMessage) -> Result<(), BusError> {
        if let Some(limit) = self.send_limit {
            if self.sent.load(Ordering::SeqCst) >= limit {
                return Err(BusError::Transport(format!(
                    "{}: send limit of {limit} reached",
                    self.name
                )));
            }
        }
        let tx = self
            .sender()
            .ok_or_else(|| BusError::Closed(self.name.clone()))?;
        tx.send(message)
            .map_err(|_| BusError::Closed(self.name.clone()))?;
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn queue_name(&self) -> &str {
        &self.name
    }

    fn is_closed(&self) -> bool {
        self.sender().is_none()
    }
}

#[async_trait]
impl QueueReceiver for MemoryQueue {
    async fn recv(&self) -> Result<Delivery, BusError> {
        let message = self
            .rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| BusError::Closed(self.name.clone()))?;

        if !self.manual_ack {
            return Ok(Delivery::settled(message));
        }
        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
        self.ledger.lock().insert(tag, message.clone());
        let acker: Arc<dyn Acknowledger> = self.ledger.clone();
        Ok(Delivery::with_acker(message, tag, acker))
    }

    fn queue_name(&self) -> &str {
        &self.name
    }

    fn supports_ack(&self) -> bool {
        self.manual_ack
    }
}
