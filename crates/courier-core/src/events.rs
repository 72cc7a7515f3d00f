//! Delivery outcome notifications.
//!
//! The engine reports every finished attempt through [`EventHandler`], so
//! alerting, metrics or audit sinks can subscribe without the engine knowing
//! about them.
//!
//! ```text
//! ┌────────────────┐  Succeeded / Failed  ┌───────────────────────┐
//! │ DeliveryEngine │ ───────────────────▶ │ MulticastEventHandler │
//! └────────────────┘                      └───────────────────────┘
//!                                                    │
//!                                          ┌─────────┴─────────┐
//!                                          ▼                   ▼
//!                                     subscriber A        subscriber B
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{DeliveryId, DestinationId, ErrorKind, EventId};

/// Events emitted by the delivery engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DeliveryEvent {
    /// An attempt received a 2xx response.
    Succeeded(DeliverySucceededEvent),

    /// An attempt failed.
    Failed(DeliveryFailedEvent),
}

impl DeliveryEvent {
    /// Returns the delivery the event concerns.
    pub fn delivery_id(&self) -> DeliveryId {
        match self {
            Self::Succeeded(event) => event.delivery_id,
            Self::Failed(event) => event.delivery_id,
        }
    }
}

/// Emitted when a delivery reaches DELIVERED.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliverySucceededEvent {
    /// Delivery that succeeded.
    pub delivery_id: DeliveryId,
    /// Destination that received it.
    pub destination_id: DestinationId,
    /// Producer event id.
    pub event_id: EventId,
    /// Event type.
    pub event_type: String,
    /// Status code returned by the destination.
    pub response_status: u16,
    /// Attempt number, 1-based.
    pub attempt_number: u32,
    /// Duration of the successful attempt.
    pub latency_ms: u64,
    /// When the attempt finished.
    pub delivered_at: DateTime<Utc>,
}

/// Emitted when an attempt fails, whether or not it will be retried.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryFailedEvent {
    /// Delivery that failed.
    pub delivery_id: DeliveryId,
    /// Destination that was attempted.
    pub destination_id: DestinationId,
    /// Producer event id.
    pub event_id: EventId,
    /// Event type.
    pub event_type: String,
    /// Classification of the failure.
    pub error_kind: ErrorKind,
    /// Failure description.
    pub error_message: String,
    /// Attempt number, 1-based.
    pub attempt_number: u32,
    /// When the next attempt is due. `None` means the delivery is FAILED.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// When the attempt finished.
    pub failed_at: DateTime<Utc>,
}

impl DeliveryFailedEvent {
    /// Returns true when no further automatic attempt will be made.
    pub fn is_terminal(&self) -> bool {
        self.next_retry_at.is_none()
    }
}

/// Receives delivery outcome events.
///
/// Implementations must not block delivery processing and must swallow
/// their own errors.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync + std::fmt::Debug {
    /// Handles a delivery event.
    async fn handle_event(&self, event: DeliveryEvent);
}

/// Event handler that discards all events.
#[derive(Debug, Default)]
pub struct NoOpEventHandler;

#[async_trait::async_trait]
impl EventHandler for NoOpEventHandler {
    async fn handle_event(&self, _event: DeliveryEvent) {}
}

/// Forwards events to every registered subscriber concurrently.
#[derive(Debug, Clone, Default)]
pub struct MulticastEventHandler {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl MulticastEventHandler {
    /// Creates a handler with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a subscriber.
    pub fn add_subscriber(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    /// Returns the number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.handlers.len()
    }
}

#[async_trait::async_trait]
impl EventHandler for MulticastEventHandler {
    async fn handle_event(&self, event: DeliveryEvent) {
        let futures = self.handlers.iter().map(|handler| {
            let event = event.clone();
            async move {
                handler.handle_event(event).await;
            }
        });

        futures::future::join_all(futures).await;
    }
}
