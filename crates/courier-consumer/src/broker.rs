//! Message broker abstraction.
//!
//! The consumer only needs three operations: receive the next message,
//! acknowledge it once its deliveries are persisted and queued, or hand it
//! back for redelivery. Brokers are at-least-once; the consumer dedups.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ConsumerError, Result};

/// A message as received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    /// Broker handle used to ack or nack this delivery of the message.
    pub delivery_tag: String,
    /// Routing key or topic the message was published under, if any.
    pub routing_key: Option<String>,
    /// Raw message body.
    pub payload: Bytes,
    /// True when the broker has handed this message out before.
    pub redelivered: bool,
}

/// Source of event messages.
#[async_trait]
pub trait MessageBroker: Send + Sync + std::fmt::Debug {
    /// Waits for the next message. `None` means the broker is closed.
    async fn receive(&self) -> Result<Option<BrokerMessage>>;

    /// Confirms the message is handled and must not be redelivered.
    async fn ack(&self, message: &BrokerMessage) -> Result<()>;

    /// Returns the message to the broker for redelivery.
    async fn nack(&self, message: &BrokerMessage) -> Result<()>;
}

/// Broker backed by an in-process channel.
///
/// Nacked messages are re-queued at the back with `redelivered` set.
#[derive(Debug)]
pub struct InMemoryBroker {
    sender: mpsc::UnboundedSender<BrokerMessage>,
    receiver: Mutex<mpsc::UnboundedReceiver<BrokerMessage>>,
    unacked: Mutex<HashMap<String, BrokerMessage>>,
    acked: Mutex<Vec<String>>,
    nacked: Mutex<Vec<String>>,
    next_tag: AtomicU64,
    closed: CancellationToken,
}

impl InMemoryBroker {
    /// Creates an open, empty broker.
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Mutex::new(receiver),
            unacked: Mutex::new(HashMap::new()),
            acked: Mutex::new(Vec::new()),
            nacked: Mutex::new(Vec::new()),
            next_tag: AtomicU64::new(1),
            closed: CancellationToken::new(),
        }
    }

    /// Publishes a message and returns its delivery tag.
    ///
    /// # Errors
    ///
    /// Returns `Broker` once the broker is closed.
    pub fn publish(&self, routing_key: Option<&str>, payload: impl Into<Bytes>) -> Result<String> {
        let delivery_tag = self.next_tag.fetch_add(1, Ordering::Relaxed).to_string();
        self.enqueue(BrokerMessage {
            delivery_tag: delivery_tag.clone(),
            routing_key: routing_key.map(str::to_string),
            payload: payload.into(),
            redelivered: false,
        })?;
        Ok(delivery_tag)
    }

    /// Stops handing out messages. Pending `receive` calls return `None`.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Delivery tags acknowledged so far, in order.
    pub async fn acked(&self) -> Vec<String> {
        self.acked.lock().await.clone()
    }

    /// Delivery tags returned for redelivery so far, in order.
    pub async fn nacked(&self) -> Vec<String> {
        self.nacked.lock().await.clone()
    }

    /// Number of messages handed out and not yet acked or nacked.
    pub async fn unacked_count(&self) -> usize {
        self.unacked.lock().await.len()
    }

    fn enqueue(&self, message: BrokerMessage) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(ConsumerError::broker("broker is closed"));
        }
        self.sender.send(message).map_err(|_| ConsumerError::broker("broker channel closed"))
    }

    async fn settle(&self, message: &BrokerMessage) -> Result<BrokerMessage> {
        self.unacked.lock().await.remove(&message.delivery_tag).ok_or_else(|| {
            ConsumerError::broker(format!("unknown delivery tag {}", message.delivery_tag))
        })
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn receive(&self) -> Result<Option<BrokerMessage>> {
        let mut receiver = self.receiver.lock().await;
        let message = tokio::select! {
            () = self.closed.cancelled() => return Ok(None),
            message = receiver.recv() => message,
        };

        if let Some(message) = &message {
            self.unacked.lock().await.insert(message.delivery_tag.clone(), message.clone());
        }
        Ok(message)
    }

    async fn ack(&self, message: &BrokerMessage) -> Result<()> {
        self.settle(message).await?;
        self.acked.lock().await.push(message.delivery_tag.clone());
        Ok(())
    }

    async fn nack(&self, message: &BrokerMessage) -> Result<()> {
        let mut message = self.settle(message).await?;
        self.nacked.lock().await.push(message.delivery_tag.clone());
        debug!(delivery_tag = %message.delivery_tag, "message requeued");

        message.redelivered = true;
        message.delivery_tag = self.next_tag.fetch_add(1, Ordering::Relaxed).to_string();
        self.enqueue(message)
    }
}
