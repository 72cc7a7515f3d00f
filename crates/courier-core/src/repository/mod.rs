//! Storage seam for the delivery core.
//!
//! The engine, scheduler and consumer depend only on [`DeliveryRepository`].
//! [`memory::InMemoryRepository`] backs tests and single-process runs,
//! [`postgres::PostgresRepository`] backs production.

use std::{future::Future, pin::Pin};

use chrono::{DateTime, Utc};

use crate::{
    error::Result,
    models::{Delivery, DeliveryId, DeliveryLog, Destination, DestinationId, EventId},
};

pub mod memory;
pub mod postgres;

/// Boxed future returned by repository operations.
pub type RepoFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Persistence operations required by the delivery core.
///
/// Every mutation is keyed by id and applied atomically by the
/// implementation. Destination counters are incremented in place, never
/// written back from a cached copy.
pub trait DeliveryRepository: Send + Sync + 'static {
    /// Inserts a delivery.
    ///
    /// Returns `None` when a delivery already exists for the same
    /// (destination, event) pair.
    fn create_delivery(&self, delivery: Delivery) -> RepoFuture<'_, Option<Delivery>>;

    /// Inserts a batch of deliveries in one atomic step.
    ///
    /// Rows that already exist for their (destination, event) pair are
    /// skipped. Returns the rows that were actually inserted.
    fn create_deliveries(&self, deliveries: Vec<Delivery>) -> RepoFuture<'_, Vec<Delivery>>;

    /// Writes all mutable fields of a delivery.
    ///
    /// Fails with `NotFound` when the delivery does not exist.
    fn update_delivery<'a>(&'a self, delivery: &'a Delivery) -> RepoFuture<'a, ()>;

    /// Loads a delivery by id.
    fn find_delivery_by_id(&self, id: DeliveryId) -> RepoFuture<'_, Option<Delivery>>;

    /// Returns PENDING deliveries with `next_retry_at <= now` and attempts
    /// left, oldest due first, at most `batch_size` of them.
    fn find_pending_deliveries(
        &self,
        now: DateTime<Utc>,
        batch_size: usize,
    ) -> RepoFuture<'_, Vec<Delivery>>;

    /// Atomically moves a PENDING delivery whose `next_retry_at` has passed
    /// to DELIVERING. The attempt budget is not checked here.
    ///
    /// Returns `None` when the delivery is missing, not PENDING or not yet
    /// due.
    fn claim_delivery(&self, id: DeliveryId, now: DateTime<Utc>)
        -> RepoFuture<'_, Option<Delivery>>;

    /// Returns DELIVERING deliveries claimed before `claimed_before` to
    /// PENDING. Returns the number of rows released.
    fn release_stale_deliveries(&self, claimed_before: DateTime<Utc>) -> RepoFuture<'_, u64>;

    /// Loads a destination by id.
    fn find_destination_by_id(&self, id: DestinationId) -> RepoFuture<'_, Option<Destination>>;

    /// Returns active destinations subscribed to `event_type`.
    fn find_active_destinations_by_event_type<'a>(
        &'a self,
        event_type: &'a str,
    ) -> RepoFuture<'a, Vec<Destination>>;

    /// Returns true when any delivery exists for `event_id`.
    fn is_event_processed<'a>(&'a self, event_id: &'a EventId) -> RepoFuture<'a, bool>;

    /// Increments the failure and consecutive-failure counters.
    fn increment_failure_count(
        &self,
        id: DestinationId,
        at: DateTime<Utc>,
    ) -> RepoFuture<'_, ()>;

    /// Increments the success counter and resets consecutive failures.
    fn record_success(&self, id: DestinationId, at: DateTime<Utc>) -> RepoFuture<'_, ()>;

    /// Appends an audit log entry.
    fn create_log(&self, log: DeliveryLog) -> RepoFuture<'_, ()>;
}
