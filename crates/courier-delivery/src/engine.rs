//! Delivery engine: one signed HTTP attempt at a time per delivery.
//!
//! The engine owns the delivery state machine:
//!
//! ```text
//!            claim             2xx
//! PENDING ──────────▶ DELIVERING ──────▶ DELIVERED
//!    ▲                    │
//!    │  attempts < max    │ non-2xx, network, timeout
//!    └────────────────────┤
//!                         │  attempts == max
//!                         └────────────────▶ FAILED
//! ```
//!
//! Manual retry re-opens FAILED or PENDING deliveries without resetting the
//! attempt counter. Attempts on one delivery never overlap: a delivery must
//! be claimed (PENDING to DELIVERING) in the repository and registered in the
//! in-process in-flight set before its request is sent.
//!
//! Every finished attempt persists exactly one delivery transition, updates
//! destination counters with atomic increments, and is reported to the
//! configured [`EventHandler`].

use std::{
    collections::HashSet,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use courier_core::{
    Clock, Delivery, DeliveryEvent, DeliveryFailedEvent, DeliveryId, DeliveryLog,
    DeliveryRepository, DeliveryStatus, DeliverySucceededEvent, Destination, DestinationId,
    ErrorKind, EventHandler, EventId, LogAction, NoOpEventHandler,
};
use serde_json::{json, value::RawValue};
use tokio::sync::{RwLock, Semaphore};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    client::{ClientConfig, DeliveryClient, DeliveryRequest, DeliveryResponse},
    error::{DeliveryError, Result},
    rate_limit::RateLimiter,
    retry::{RetryDecision, RetryPolicy},
    signature,
};

/// Event type of the synthetic event sent by [`DeliveryEngine::send_test`].
pub const TEST_EVENT_TYPE: &str = "webhook.test";

/// Configuration for the delivery engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// HTTP client configuration.
    pub client: ClientConfig,

    /// Backoff applied after failed attempts.
    pub retry_policy: RetryPolicy,

    /// Attempt timeout for destinations whose own timeout is zero.
    pub default_timeout: Duration,

    /// Upper bound on queued attempts running at once.
    pub max_concurrent_deliveries: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            client: ClientConfig::default(),
            retry_policy: RetryPolicy::default(),
            default_timeout: Duration::from_secs(crate::DEFAULT_TIMEOUT_SECONDS),
            max_concurrent_deliveries: crate::DEFAULT_MAX_CONCURRENT_DELIVERIES,
        }
    }
}

/// Counters for the engine's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// HTTP attempts made.
    pub attempts: u64,
    /// Deliveries that reached DELIVERED.
    pub successful_deliveries: u64,
    /// Failed attempts that were rescheduled.
    pub retries_scheduled: u64,
    /// Deliveries that reached FAILED.
    pub permanent_failures: u64,
    /// Attempts skipped without a state change.
    pub skipped: u64,
    /// Attempts currently running.
    pub in_flight_deliveries: u64,
}

/// Result of [`DeliveryEngine::attempt_delivery`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The destination answered with a 2xx status.
    Delivered {
        /// Status code returned
        status_code: u16,
    },
    /// The attempt failed and the delivery is PENDING again.
    RetryScheduled {
        /// When the next attempt becomes due
        next_retry_at: DateTime<Utc>,
        /// Classification of the failure
        error_kind: ErrorKind,
    },
    /// The delivery reached FAILED.
    Failed {
        /// Classification of the failure
        error_kind: ErrorKind,
    },
    /// No attempt was made and nothing changed.
    Skipped {
        /// Why the attempt was skipped
        reason: SkipReason,
    },
}

/// Why an attempt was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// An attempt for the same delivery is running in this process.
    AlreadyInFlight,
    /// The delivery is not PENDING, or another worker claimed it first.
    NotPending,
    /// The delivery's `next_retry_at` is still in the future.
    NotDue,
    /// The destination is inactive or suspended.
    DestinationInactive,
}

/// Membership of a delivery in one of the engine's tracking sets, removed
/// on drop.
struct TrackedDelivery<'a> {
    set: &'a Mutex<HashSet<DeliveryId>>,
    id: DeliveryId,
}

impl<'a> TrackedDelivery<'a> {
    fn acquire(set: &'a Mutex<HashSet<DeliveryId>>, id: DeliveryId) -> Option<Self> {
        let inserted = set.lock().unwrap_or_else(PoisonError::into_inner).insert(id);
        inserted.then_some(Self { set, id })
    }

    /// Takes over a membership inserted without a guard.
    fn adopt(set: &'a Mutex<HashSet<DeliveryId>>, id: DeliveryId) -> Self {
        Self { set, id }
    }
}

impl Drop for TrackedDelivery<'_> {
    fn drop(&mut self) {
        self.set.lock().unwrap_or_else(PoisonError::into_inner).remove(&self.id);
    }
}

struct EngineInner {
    repository: Arc<dyn DeliveryRepository>,
    client: DeliveryClient,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    event_handler: Arc<dyn EventHandler>,
    rate_limiter: RateLimiter,
    in_flight: Mutex<HashSet<DeliveryId>>,
    queued: Mutex<HashSet<DeliveryId>>,
    concurrency: Arc<Semaphore>,
    stats: RwLock<EngineStats>,
    tracker: TaskTracker,
}

/// Performs delivery attempts and owns the delivery state machine.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct DeliveryEngine {
    inner: Arc<EngineInner>,
}

impl DeliveryEngine {
    /// Creates an engine that reports outcomes nowhere.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the retry policy is invalid or the HTTP
    /// client cannot be built.
    pub fn new(
        repository: Arc<dyn DeliveryRepository>,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        Self::with_event_handler(repository, config, clock, Arc::new(NoOpEventHandler))
    }

    /// Creates an engine that reports outcomes to `event_handler`.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the retry policy is invalid or the HTTP
    /// client cannot be built.
    pub fn with_event_handler(
        repository: Arc<dyn DeliveryRepository>,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        event_handler: Arc<dyn EventHandler>,
    ) -> Result<Self> {
        config.retry_policy.validate()?;
        if config.max_concurrent_deliveries == 0 {
            return Err(DeliveryError::configuration("max_concurrent_deliveries must be > 0"));
        }

        let client = DeliveryClient::new(config.client.clone())?;
        let concurrency = Arc::new(Semaphore::new(config.max_concurrent_deliveries));

        Ok(Self {
            inner: Arc::new(EngineInner {
                repository,
                client,
                config,
                clock,
                event_handler,
                rate_limiter: RateLimiter::new(),
                in_flight: Mutex::new(HashSet::new()),
                queued: Mutex::new(HashSet::new()),
                concurrency,
                stats: RwLock::new(EngineStats::default()),
                tracker: TaskTracker::new(),
            }),
        })
    }

    /// Returns the engine's repository.
    pub fn repository(&self) -> &Arc<dyn DeliveryRepository> {
        &self.inner.repository
    }

    /// Returns the engine's clock.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    /// Returns current engine statistics.
    pub async fn stats(&self) -> EngineStats {
        self.inner.stats.read().await.clone()
    }

    /// Returns true while an attempt for `delivery_id` runs in this process.
    pub fn is_in_flight(&self, delivery_id: DeliveryId) -> bool {
        self.inner.in_flight.lock().unwrap_or_else(PoisonError::into_inner).contains(&delivery_id)
    }

    /// Returns true from [`queue_delivery`](Self::queue_delivery) until the
    /// queued attempt has finished.
    pub fn is_queued(&self, delivery_id: DeliveryId) -> bool {
        self.inner.queued.lock().unwrap_or_else(PoisonError::into_inner).contains(&delivery_id)
    }

    /// Builds one PENDING delivery per destination for an event.
    ///
    /// The envelope is serialized once and shared by every delivery. Each
    /// delivery gets its own signature.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` if the envelope cannot be serialized.
    pub fn prepare_deliveries(
        &self,
        destinations: &[Destination],
        event_id: &EventId,
        event_type: &str,
        data: &RawValue,
    ) -> Result<Vec<Delivery>> {
        let now = self.inner.clock.now_utc();
        let payload = signature::build_envelope(event_id, event_type, data, now)?;

        destinations
            .iter()
            .map(|destination| {
                let signature = signature::sign(payload.as_bytes(), &destination.secret)?;
                Ok(Delivery::new(
                    destination,
                    event_id.clone(),
                    event_type,
                    payload.clone(),
                    signature,
                    now,
                ))
            })
            .collect()
    }

    /// Schedules an attempt in the background.
    ///
    /// A delivery is queued at most once at a time; queuing it again while
    /// its task is pending is a no-op. Rate-limit waits happen before the
    /// task takes a concurrency permit.
    ///
    /// Returns false once the engine is shutting down. The repository's
    /// `next_retry_at` stays authoritative, so a rejected or lost task is
    /// picked up by the next scheduler sweep.
    pub fn queue_delivery(&self, delivery_id: DeliveryId) -> bool {
        if self.inner.tracker.is_closed() {
            warn!(delivery_id = %delivery_id, "engine is shutting down, delivery not queued");
            return false;
        }

        let newly_queued =
            self.inner.queued.lock().unwrap_or_else(PoisonError::into_inner).insert(delivery_id);
        if !newly_queued {
            debug!(delivery_id = %delivery_id, "delivery already queued");
            return true;
        }

        let engine = self.clone();
        self.inner.tracker.spawn(async move {
            let _queued = TrackedDelivery::adopt(&engine.inner.queued, delivery_id);
            if let Err(e) = engine.throttle(delivery_id).await {
                error!(delivery_id = %delivery_id, error = %e, "queued attempt failed");
                return;
            }
            let Ok(_permit) = engine.inner.concurrency.clone().acquire_owned().await else {
                return;
            };
            match engine.attempt_now(delivery_id).await {
                Ok(outcome) => debug!(delivery_id = %delivery_id, ?outcome, "queued attempt finished"),
                Err(e) => error!(delivery_id = %delivery_id, error = %e, "queued attempt failed"),
            }
        });
        true
    }

    /// Makes one attempt for a due PENDING delivery and persists the outcome.
    ///
    /// Transport and HTTP failures are not errors: they become
    /// `RetryScheduled` or `Failed`. Deliveries that are not PENDING, not yet
    /// due, already in flight, or whose destination is inactive are skipped
    /// unchanged. Waits for the destination's rate limit first.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown delivery, and repository errors.
    pub async fn attempt_delivery(&self, delivery_id: DeliveryId) -> Result<AttemptOutcome> {
        self.throttle(delivery_id).await?;
        self.attempt_now(delivery_id).await
    }

    /// Waits for a rate-limit token if the delivery is about to be attempted
    /// against a throttled destination. Never called while holding a
    /// concurrency permit.
    async fn throttle(&self, delivery_id: DeliveryId) -> Result<()> {
        let repository = &self.inner.repository;
        let Some(delivery) = repository.find_delivery_by_id(delivery_id).await? else {
            return Ok(());
        };
        if !delivery.is_ready(self.inner.clock.now_utc()) {
            return Ok(());
        }
        let Some(destination) = repository.find_destination_by_id(delivery.destination_id).await?
        else {
            return Ok(());
        };
        if let (true, Some(per_second)) = (destination.accepts_deliveries(), destination.rate_limit)
        {
            self.inner
                .rate_limiter
                .acquire(destination.id, per_second, self.inner.clock.as_ref())
                .await;
        }
        Ok(())
    }

    async fn attempt_now(&self, delivery_id: DeliveryId) -> Result<AttemptOutcome> {
        let Some(_guard) = TrackedDelivery::acquire(&self.inner.in_flight, delivery_id) else {
            debug!(delivery_id = %delivery_id, "attempt already in flight");
            return self.skip(SkipReason::AlreadyInFlight).await;
        };

        let repository = &self.inner.repository;
        let delivery = repository
            .find_delivery_by_id(delivery_id)
            .await?
            .ok_or_else(|| DeliveryError::not_found("delivery", delivery_id))?;

        if delivery.status != DeliveryStatus::Pending {
            debug!(delivery_id = %delivery_id, status = %delivery.status, "delivery not pending");
            return self.skip(SkipReason::NotPending).await;
        }

        let now = self.inner.clock.now_utc();
        if !delivery.is_ready(now) {
            debug!(
                delivery_id = %delivery_id,
                next_retry_at = ?delivery.next_retry_at,
                "delivery not due yet"
            );
            return self.skip(SkipReason::NotDue).await;
        }

        let destination = repository.find_destination_by_id(delivery.destination_id).await?;
        if let Some(destination) = &destination {
            if !destination.accepts_deliveries() {
                debug!(
                    delivery_id = %delivery_id,
                    destination_id = %destination.id,
                    "destination inactive, leaving delivery pending"
                );
                return self.skip(SkipReason::DestinationInactive).await;
            }
        }

        let Some(mut claimed) = repository.claim_delivery(delivery_id, now).await? else {
            debug!(delivery_id = %delivery_id, "delivery claimed elsewhere");
            return self.skip(SkipReason::NotPending).await;
        };

        let Some(destination) = destination else {
            return self.fail_orphaned(claimed).await;
        };

        self.inner.stats.write().await.in_flight_deliveries += 1;
        let result = self.execute_attempt(&mut claimed, &destination).await;
        self.inner.stats.write().await.in_flight_deliveries -= 1;
        result
    }

    /// Re-opens a FAILED or PENDING delivery and queues an attempt.
    ///
    /// Attempts are preserved. An exhausted budget is extended by exactly one
    /// attempt and persisted, so a sweep still finds the delivery if the
    /// queued attempt is skipped or lost.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown delivery, `InvalidState` for a
    /// DELIVERED or DELIVERING one, and repository errors.
    pub async fn retry_delivery(&self, delivery_id: DeliveryId) -> Result<Delivery> {
        let repository = &self.inner.repository;
        let mut delivery = repository
            .find_delivery_by_id(delivery_id)
            .await?
            .ok_or_else(|| DeliveryError::not_found("delivery", delivery_id))?;

        let previous_status = delivery.status;
        match previous_status {
            DeliveryStatus::Delivered | DeliveryStatus::Delivering => {
                return Err(DeliveryError::invalid_state(format!(
                    "delivery {delivery_id} is {previous_status} and cannot be retried"
                )));
            },
            DeliveryStatus::Pending | DeliveryStatus::Failed => {},
        }

        let now = self.inner.clock.now_utc();
        delivery.status = DeliveryStatus::Pending;
        delivery.next_retry_at = Some(now);
        delivery.max_attempts = delivery.max_attempts.max(delivery.attempts.saturating_add(1));
        delivery.updated_at = now;
        repository.update_delivery(&delivery).await?;

        repository
            .create_log(DeliveryLog::for_delivery(
                &delivery,
                LogAction::DeliveryRetried,
                "manual retry requested",
                json!({
                    "previous_status": previous_status.to_string(),
                    "attempts": delivery.attempts,
                    "max_attempts": delivery.max_attempts,
                }),
                now,
            ))
            .await?;

        info!(
            delivery_id = %delivery_id,
            previous_status = %previous_status,
            attempts = delivery.attempts,
            "delivery re-opened for manual retry"
        );

        self.queue_delivery(delivery_id);
        Ok(delivery)
    }

    /// Sends a synthetic `webhook.test` event to a destination and returns
    /// the resulting delivery.
    ///
    /// The test delivery has a single-attempt budget and is attempted before
    /// this call returns.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown destination, `InvalidState` for one
    /// that does not accept deliveries, and repository errors.
    pub async fn send_test(&self, destination_id: DestinationId) -> Result<Delivery> {
        let repository = &self.inner.repository;
        let destination = repository
            .find_destination_by_id(destination_id)
            .await?
            .ok_or_else(|| DeliveryError::not_found("destination", destination_id))?;

        if !destination.accepts_deliveries() {
            return Err(DeliveryError::invalid_state(format!(
                "destination {destination_id} is not accepting deliveries"
            )));
        }

        let event_id = EventId::new(format!("test_{}", Uuid::new_v4().simple()));
        let data = serde_json::value::to_raw_value(&json!({
            "message": "Test delivery from courier",
            "destination_id": destination_id,
        }))
        .map_err(|e| DeliveryError::invalid_request(format!("invalid test payload: {e}")))?;

        let mut delivery = self
            .prepare_deliveries(std::slice::from_ref(&destination), &event_id, TEST_EVENT_TYPE, &data)?
            .pop()
            .ok_or_else(|| DeliveryError::invalid_state("no test delivery was prepared"))?;
        delivery.max_attempts = 1;

        let delivery = repository
            .create_delivery(delivery)
            .await?
            .ok_or_else(|| DeliveryError::invalid_state("test delivery already exists"))?;

        repository
            .create_log(DeliveryLog::for_delivery(
                &delivery,
                LogAction::DestinationTested,
                "test delivery sent",
                json!({ "event_id": event_id.as_str() }),
                delivery.created_at,
            ))
            .await?;

        let outcome = self.attempt_delivery(delivery.id).await?;
        info!(
            destination_id = %destination_id,
            delivery_id = %delivery.id,
            ?outcome,
            "destination test finished"
        );

        repository
            .find_delivery_by_id(delivery.id)
            .await?
            .ok_or_else(|| DeliveryError::not_found("delivery", delivery.id))
    }

    /// Stops accepting queued work and waits for running attempts.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if attempts are still running after
    /// `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        info!(
            queued = self.inner.tracker.len(),
            timeout_seconds = timeout.as_secs(),
            "shutting down delivery engine"
        );
        self.inner.tracker.close();

        match tokio::time::timeout(timeout, self.inner.tracker.wait()).await {
            Ok(()) => {
                info!("delivery engine shutdown completed");
                Ok(())
            },
            Err(_elapsed) => {
                error!(
                    remaining = self.inner.tracker.len(),
                    "delivery engine shutdown timed out with attempts still running"
                );
                Err(DeliveryError::ShutdownTimeout { timeout })
            },
        }
    }

    async fn skip(&self, reason: SkipReason) -> Result<AttemptOutcome> {
        self.inner.stats.write().await.skipped += 1;
        Ok(AttemptOutcome::Skipped { reason })
    }

    async fn execute_attempt(
        &self,
        delivery: &mut Delivery,
        destination: &Destination,
    ) -> Result<AttemptOutcome> {
        if !signature::verify(delivery.payload.as_bytes(), &delivery.signature, &destination.secret)
        {
            delivery.signature = signature::sign(delivery.payload.as_bytes(), &destination.secret)?;
            info!(
                delivery_id = %delivery.id,
                destination_id = %destination.id,
                "destination secret changed, payload re-signed"
            );
        }

        delivery.attempts = delivery.attempts.saturating_add(1);
        let timeout = if destination.timeout.is_zero() {
            self.inner.config.default_timeout
        } else {
            destination.timeout
        };

        let request = DeliveryRequest {
            delivery_id: delivery.id,
            destination_id: destination.id,
            event_id: delivery.event_id.clone(),
            event_type: delivery.event_type.clone(),
            url: destination.url.clone(),
            body: Bytes::from(delivery.payload.clone()),
            signature: delivery.signature.clone(),
            attempt_number: delivery.attempts,
            headers: destination.headers.clone(),
            timeout,
        };

        debug!(
            delivery_id = %delivery.id,
            destination_id = %destination.id,
            attempt = delivery.attempts,
            "attempting delivery"
        );

        let result = self.inner.client.deliver(request).await;
        self.inner.stats.write().await.attempts += 1;
        let finished_at = self.inner.clock.now_utc();

        match result {
            Ok(response) if response.is_success => {
                self.record_success(delivery, response, finished_at).await
            },
            Ok(response) => {
                let error_kind = ErrorKind::HttpStatus(response.status_code);
                let message = format!("HTTP {}", response.status_code);
                apply_response(delivery, Some(response));
                self.record_failure(delivery, error_kind, message, finished_at).await
            },
            Err(error) => {
                apply_response(delivery, None);
                self.record_failure(delivery, error.kind(), error.to_string(), finished_at).await
            },
        }
    }

    async fn record_success(
        &self,
        delivery: &mut Delivery,
        response: DeliveryResponse,
        at: DateTime<Utc>,
    ) -> Result<AttemptOutcome> {
        let status_code = response.status_code;
        let latency_ms = duration_ms(response.duration);

        apply_response(delivery, Some(response));
        delivery.status = DeliveryStatus::Delivered;
        delivery.delivered_at = Some(at);
        delivery.next_retry_at = None;
        delivery.error_message = None;
        delivery.error_kind = None;
        delivery.updated_at = at;

        let repository = &self.inner.repository;
        repository.update_delivery(delivery).await?;
        repository.record_success(delivery.destination_id, at).await?;
        repository
            .create_log(DeliveryLog::for_delivery(
                delivery,
                LogAction::DeliverySucceeded,
                format!("delivered with HTTP {status_code}"),
                json!({
                    "status_code": status_code,
                    "attempts": delivery.attempts,
                    "latency_ms": latency_ms,
                }),
                at,
            ))
            .await?;

        self.inner.stats.write().await.successful_deliveries += 1;

        info!(
            delivery_id = %delivery.id,
            destination_id = %delivery.destination_id,
            status_code,
            attempt = delivery.attempts,
            latency_ms,
            "delivery succeeded"
        );

        self.inner
            .event_handler
            .handle_event(DeliveryEvent::Succeeded(DeliverySucceededEvent {
                delivery_id: delivery.id,
                destination_id: delivery.destination_id,
                event_id: delivery.event_id.clone(),
                event_type: delivery.event_type.clone(),
                response_status: status_code,
                attempt_number: delivery.attempts,
                latency_ms,
                delivered_at: at,
            }))
            .await;

        Ok(AttemptOutcome::Delivered { status_code })
    }

    async fn record_failure(
        &self,
        delivery: &mut Delivery,
        error_kind: ErrorKind,
        message: String,
        at: DateTime<Utc>,
    ) -> Result<AttemptOutcome> {
        let decision =
            self.inner.config.retry_policy.decide(delivery.attempts, delivery.max_attempts, at);

        delivery.error_kind = Some(error_kind);
        delivery.error_message = Some(message.clone());
        delivery.updated_at = at;

        let outcome = match decision {
            RetryDecision::Retry { next_retry_at } => {
                delivery.status = DeliveryStatus::Pending;
                delivery.next_retry_at = Some(next_retry_at);
                AttemptOutcome::RetryScheduled { next_retry_at, error_kind }
            },
            RetryDecision::GiveUp { reason } => {
                debug!(delivery_id = %delivery.id, reason = %reason, "giving up on delivery");
                delivery.status = DeliveryStatus::Failed;
                delivery.next_retry_at = None;
                AttemptOutcome::Failed { error_kind }
            },
        };

        let repository = &self.inner.repository;
        repository.update_delivery(delivery).await?;
        repository.increment_failure_count(delivery.destination_id, at).await?;

        match &outcome {
            AttemptOutcome::RetryScheduled { next_retry_at, .. } => {
                self.inner.stats.write().await.retries_scheduled += 1;
                warn!(
                    delivery_id = %delivery.id,
                    destination_id = %delivery.destination_id,
                    attempt = delivery.attempts,
                    max_attempts = delivery.max_attempts,
                    error_kind = %error_kind,
                    error = %message,
                    next_retry_at = %next_retry_at,
                    "delivery attempt failed, retry scheduled"
                );
            },
            _ => {
                self.log_terminal_failure(delivery, error_kind, &message, at).await?;
            },
        }

        self.emit_failure(delivery, error_kind, message, at).await;
        Ok(outcome)
    }

    async fn fail_orphaned(&self, mut delivery: Delivery) -> Result<AttemptOutcome> {
        let at = self.inner.clock.now_utc();
        let message = format!("destination {} not found", delivery.destination_id);

        delivery.status = DeliveryStatus::Failed;
        delivery.next_retry_at = None;
        delivery.error_kind = Some(ErrorKind::Unknown);
        delivery.error_message = Some(message.clone());
        delivery.updated_at = at;

        self.inner.repository.update_delivery(&delivery).await?;
        self.log_terminal_failure(&delivery, ErrorKind::Unknown, &message, at).await?;
        self.emit_failure(&delivery, ErrorKind::Unknown, message, at).await;

        Ok(AttemptOutcome::Failed { error_kind: ErrorKind::Unknown })
    }

    async fn log_terminal_failure(
        &self,
        delivery: &Delivery,
        error_kind: ErrorKind,
        message: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.inner.stats.write().await.permanent_failures += 1;
        error!(
            delivery_id = %delivery.id,
            destination_id = %delivery.destination_id,
            attempts = delivery.attempts,
            error_kind = %error_kind,
            error = %message,
            "delivery failed permanently"
        );

        self.inner
            .repository
            .create_log(DeliveryLog::for_delivery(
                delivery,
                LogAction::DeliveryFailed,
                format!("delivery failed: {message}"),
                json!({
                    "error_kind": error_kind.to_string(),
                    "attempts": delivery.attempts,
                    "max_attempts": delivery.max_attempts,
                }),
                at,
            ))
            .await?;
        Ok(())
    }

    async fn emit_failure(
        &self,
        delivery: &Delivery,
        error_kind: ErrorKind,
        error_message: String,
        at: DateTime<Utc>,
    ) {
        self.inner
            .event_handler
            .handle_event(DeliveryEvent::Failed(DeliveryFailedEvent {
                delivery_id: delivery.id,
                destination_id: delivery.destination_id,
                event_id: delivery.event_id.clone(),
                event_type: delivery.event_type.clone(),
                error_kind,
                error_message,
                attempt_number: delivery.attempts,
                next_retry_at: delivery.next_retry_at,
                failed_at: at,
            }))
            .await;
    }
}

fn apply_response(delivery: &mut Delivery, response: Option<DeliveryResponse>) {
    match response {
        Some(response) => {
            delivery.latency_ms = Some(duration_ms(response.duration));
            delivery.response_status = Some(response.status_code);
            delivery.response_body = Some(response.body);
            delivery.response_headers = Some(response.headers);
        },
        None => {
            delivery.latency_ms = None;
            delivery.response_status = None;
            delivery.response_body = None;
            delivery.response_headers = None;
        },
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
