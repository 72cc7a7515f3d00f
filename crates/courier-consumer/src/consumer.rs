//! Event consumer: turns broker messages into queued deliveries.
//!
//! For each message the consumer dedups on the event id, resolves the
//! destinations subscribed to the event type, inserts one delivery per
//! destination in a single batch, and queues each on the engine. The
//! message is acknowledged only after that hand-off. Any failure before it
//! nacks the message so the broker redelivers it; the dedup check makes the
//! redelivery harmless once the batch insert has committed.

use std::{sync::Arc, time::Duration};

use courier_core::{DeliveryLog, LogAction};
use courier_delivery::DeliveryEngine;
use serde_json::json;
use tokio::{
    sync::{RwLock, Semaphore},
    task::{JoinHandle, JoinSet},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    broker::{BrokerMessage, MessageBroker},
    error::{ConsumerError, Result},
    message::{parse_message, EventMessage},
};

const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Consumer sizing and shutdown behavior.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Maximum messages processed concurrently.
    pub prefetch: usize,
    /// How long `run` waits for in-flight messages after cancellation.
    pub shutdown_timeout: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            prefetch: crate::DEFAULT_PREFETCH,
            shutdown_timeout: Duration::from_secs(crate::DEFAULT_SHUTDOWN_TIMEOUT_SECONDS),
        }
    }
}

/// Consumer counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Messages received from the broker.
    pub received: u64,
    /// Events that produced at least one delivery.
    pub fanned_out: u64,
    /// Deliveries created across all events.
    pub deliveries_created: u64,
    /// Redelivered events that were already processed.
    pub duplicates: u64,
    /// Events no active destination subscribes to.
    pub unmatched: u64,
    /// Messages acknowledged without processing because they cannot be parsed.
    pub malformed: u64,
    /// Messages handed back to the broker after a failure.
    pub requeued: u64,
}

/// What happened to one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Deliveries were created and queued.
    FannedOut {
        /// Number of deliveries created
        deliveries: usize,
    },
    /// The event id already produced deliveries.
    Duplicate,
    /// No active destination subscribes to the event type.
    NoMatchingDestinations,
    /// The message could not be parsed and was dropped.
    Malformed {
        /// Parse failure
        reason: String,
    },
}

struct ConsumerInner {
    broker: Arc<dyn MessageBroker>,
    engine: DeliveryEngine,
    config: ConsumerConfig,
    stats: RwLock<ConsumerStats>,
}

/// Consumes broker messages and fans each event out to its destinations.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct EventConsumer {
    inner: Arc<ConsumerInner>,
}

impl EventConsumer {
    /// Creates a consumer reading from `broker` and delivering through
    /// `engine`.
    pub fn new(broker: Arc<dyn MessageBroker>, engine: DeliveryEngine, config: ConsumerConfig) -> Self {
        Self {
            inner: Arc::new(ConsumerInner {
                broker,
                engine,
                config,
                stats: RwLock::new(ConsumerStats::default()),
            }),
        }
    }

    /// Returns a snapshot of the counters.
    pub async fn stats(&self) -> ConsumerStats {
        self.inner.stats.read().await.clone()
    }

    /// Parses, processes and settles one broker message.
    ///
    /// Malformed, duplicate and unmatched messages are acknowledged. A
    /// processing failure nacks the message and is returned.
    ///
    /// # Errors
    ///
    /// Returns the processing error after the nack, or a broker error if the
    /// message cannot be settled.
    pub async fn handle_message(&self, message: &BrokerMessage) -> Result<ProcessOutcome> {
        self.inner.stats.write().await.received += 1;
        let broker = &self.inner.broker;

        let event = match parse_message(&message.payload, message.routing_key.as_deref()) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    delivery_tag = %message.delivery_tag,
                    error = %e,
                    "dropping malformed message"
                );
                broker.ack(message).await?;
                self.inner.stats.write().await.malformed += 1;
                return Ok(ProcessOutcome::Malformed { reason: e.to_string() });
            },
        };

        if message.redelivered {
            debug!(event_id = %event.id, "processing redelivered message");
        }

        let span = info_span!(
            "consume_event",
            event_id = %event.id,
            event_type = %event.event_type,
        );

        match self.process_event(event).instrument(span).await {
            Ok(outcome) => {
                broker.ack(message).await?;
                Ok(outcome)
            },
            Err(e) => {
                error!(
                    delivery_tag = %message.delivery_tag,
                    error = %e,
                    "event processing failed, requeueing message"
                );
                broker.nack(message).await?;
                self.inner.stats.write().await.requeued += 1;
                Err(e)
            },
        }
    }

    /// Dedups, resolves destinations, creates deliveries and queues them.
    ///
    /// # Errors
    ///
    /// Returns repository and engine errors. No delivery is created when
    /// the batch insert fails.
    pub async fn process_event(&self, event: EventMessage) -> Result<ProcessOutcome> {
        let repository = self.inner.engine.repository();

        if repository.is_event_processed(&event.id).await? {
            info!(event_id = %event.id, "event already processed, skipping");
            self.inner.stats.write().await.duplicates += 1;
            return Ok(ProcessOutcome::Duplicate);
        }

        let destinations = repository.find_active_destinations_by_event_type(&event.event_type).await?;
        if destinations.is_empty() {
            debug!(
                event_id = %event.id,
                event_type = %event.event_type,
                "no destinations subscribed to event"
            );
            self.inner.stats.write().await.unmatched += 1;
            return Ok(ProcessOutcome::NoMatchingDestinations);
        }

        let prepared = self.inner.engine.prepare_deliveries(
            &destinations,
            &event.id,
            &event.event_type,
            &event.data,
        )?;
        let created = repository.create_deliveries(prepared).await?;

        for delivery in &created {
            repository
                .create_log(DeliveryLog::for_delivery(
                    delivery,
                    LogAction::DeliveryCreated,
                    "delivery created",
                    json!({
                        "event_type": delivery.event_type,
                        "max_attempts": delivery.max_attempts,
                    }),
                    delivery.created_at,
                ))
                .await?;
        }

        for delivery in &created {
            if !self.inner.engine.queue_delivery(delivery.id) {
                debug!(
                    delivery_id = %delivery.id,
                    "engine not accepting work, leaving delivery for the retry sweep"
                );
            }
        }

        info!(
            event_id = %event.id,
            event_type = %event.event_type,
            destinations = destinations.len(),
            deliveries = created.len(),
            "event fanned out"
        );

        let mut stats = self.inner.stats.write().await;
        stats.fanned_out += 1;
        stats.deliveries_created += created.len() as u64;

        Ok(ProcessOutcome::FannedOut { deliveries: created.len() })
    }

    /// Receives and processes messages until `cancel` fires or the broker
    /// closes, with at most `prefetch` messages in flight.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if in-flight messages do not finish within
    /// the configured shutdown timeout. Those messages stay unacknowledged.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let prefetch = self.inner.config.prefetch.max(1);
        let permits = Arc::new(Semaphore::new(prefetch));
        let mut tasks = JoinSet::new();

        info!(prefetch, "event consumer starting");

        loop {
            let permit = tokio::select! {
                () = cancel.cancelled() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_closed) => break,
                },
            };

            let received = tokio::select! {
                () = cancel.cancelled() => break,
                received = self.inner.broker.receive() => received,
            };

            let message = match received {
                Ok(Some(message)) => message,
                Ok(None) => {
                    info!("broker closed, consumer stopping");
                    break;
                },
                Err(e) => {
                    error!(error = %e, "failed to receive message");
                    drop(permit);
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = self.inner.engine.clock().sleep(RECEIVE_ERROR_BACKOFF) => continue,
                    }
                },
            };

            let consumer = self.clone();
            tasks.spawn(async move {
                let _permit = permit;
                if let Err(e) = consumer.handle_message(&message).await {
                    warn!(delivery_tag = %message.delivery_tag, error = %e, "message not processed");
                }
            });

            while let Some(finished) = tasks.try_join_next() {
                if let Err(join_error) = finished {
                    error!(error = %join_error, "message task panicked");
                }
            }
        }

        self.drain(tasks).await
    }

    /// Runs the consumer on a background task.
    pub fn spawn(self) -> ConsumerHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { self.run(token).await });
        ConsumerHandle { cancel, handle }
    }

    async fn drain(&self, mut tasks: JoinSet<()>) -> Result<()> {
        let timeout = self.inner.config.shutdown_timeout;
        info!(in_flight = tasks.len(), "waiting for in-flight messages");

        let drained = tokio::time::timeout(timeout, async {
            while let Some(finished) = tasks.join_next().await {
                if let Err(join_error) = finished {
                    error!(error = %join_error, "message task panicked");
                }
            }
        })
        .await;

        match drained {
            Ok(()) => {
                info!("event consumer stopped");
                Ok(())
            },
            Err(_elapsed) => {
                error!(
                    remaining = tasks.len(),
                    timeout_seconds = timeout.as_secs(),
                    "consumer shutdown timed out, abandoning in-flight messages"
                );
                tasks.abort_all();
                Err(ConsumerError::ShutdownTimeout { timeout })
            },
        }
    }
}

/// Handle to a consumer started with [`EventConsumer::spawn`].
#[derive(Debug)]
pub struct ConsumerHandle {
    cancel: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

impl ConsumerHandle {
    /// Stops receiving and waits for in-flight messages to settle.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` from the consumer loop.
    pub async fn shutdown(self) -> Result<()> {
        self.cancel.cancel();
        match self.handle.await {
            Ok(result) => result,
            Err(join_error) => {
                error!(error = %join_error, "event consumer task panicked");
                Ok(())
            },
        }
    }

    /// Returns true once the consumer loop has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
