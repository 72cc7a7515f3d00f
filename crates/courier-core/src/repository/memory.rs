//! In-memory repository.
//!
//! All state sits behind one lock, so every operation is atomic with respect
//! to the others. Supports error injection for exercising failure paths.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{DeliveryRepository, RepoFuture};
use crate::{
    error::CoreError,
    models::{
        Delivery, DeliveryId, DeliveryLog, DeliveryStatus, Destination, DestinationId, EventId,
    },
};

#[derive(Debug, Default)]
struct State {
    destinations: HashMap<DestinationId, Destination>,
    deliveries: HashMap<DeliveryId, Delivery>,
    pairs: HashSet<(DestinationId, EventId)>,
    logs: Vec<DeliveryLog>,
}

impl State {
    fn insert(&mut self, delivery: Delivery) -> Option<Delivery> {
        let pair = (delivery.destination_id, delivery.event_id.clone());
        if !self.pairs.insert(pair) {
            return None;
        }
        self.deliveries.insert(delivery.id, delivery.clone());
        Some(delivery)
    }
}

/// Repository that keeps everything in process memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRepository {
    state: Arc<RwLock<State>>,
    injected_error: Arc<RwLock<Option<String>>>,
}

impl InMemoryRepository {
    /// Creates an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers or replaces a destination.
    pub async fn add_destination(&self, destination: Destination) {
        self.state.write().await.destinations.insert(destination.id, destination);
    }

    /// Returns a destination snapshot.
    pub async fn destination(&self, id: DestinationId) -> Option<Destination> {
        self.state.read().await.destinations.get(&id).cloned()
    }

    /// Enables or disables a destination.
    pub async fn set_destination_active(&self, id: DestinationId, is_active: bool) {
        if let Some(destination) = self.state.write().await.destinations.get_mut(&id) {
            destination.is_active = is_active;
        }
    }

    /// Inserts or overwrites a delivery without the uniqueness check.
    pub async fn insert_delivery(&self, delivery: Delivery) {
        let mut state = self.state.write().await;
        state.pairs.insert((delivery.destination_id, delivery.event_id.clone()));
        state.deliveries.insert(delivery.id, delivery);
    }

    /// Returns a delivery snapshot.
    pub async fn delivery(&self, id: DeliveryId) -> Option<Delivery> {
        self.state.read().await.deliveries.get(&id).cloned()
    }

    /// Returns every delivery, oldest first.
    pub async fn deliveries(&self) -> Vec<Delivery> {
        let mut deliveries: Vec<Delivery> =
            self.state.read().await.deliveries.values().cloned().collect();
        deliveries.sort_by_key(|d| d.created_at);
        deliveries
    }

    /// Returns every delivery produced by one event.
    pub async fn deliveries_for_event(&self, event_id: &EventId) -> Vec<Delivery> {
        self.deliveries().await.into_iter().filter(|d| &d.event_id == event_id).collect()
    }

    /// Returns the audit log in insertion order.
    pub async fn logs(&self) -> Vec<DeliveryLog> {
        self.state.read().await.logs.clone()
    }

    /// Makes the next repository call fail with a database error.
    pub async fn inject_error(&self, message: impl Into<String>) {
        *self.injected_error.write().await = Some(message.into());
    }

    async fn check_injected(&self) -> crate::error::Result<()> {
        match self.injected_error.write().await.take() {
            Some(message) => Err(CoreError::Database(message)),
            None => Ok(()),
        }
    }
}

impl DeliveryRepository for InMemoryRepository {
    fn create_delivery(&self, delivery: Delivery) -> RepoFuture<'_, Option<Delivery>> {
        Box::pin(async move {
            self.check_injected().await?;
            Ok(self.state.write().await.insert(delivery))
        })
    }

    fn create_deliveries(&self, deliveries: Vec<Delivery>) -> RepoFuture<'_, Vec<Delivery>> {
        Box::pin(async move {
            self.check_injected().await?;
            let mut state = self.state.write().await;
            Ok(deliveries.into_iter().filter_map(|delivery| state.insert(delivery)).collect())
        })
    }

    fn update_delivery<'a>(&'a self, delivery: &'a Delivery) -> RepoFuture<'a, ()> {
        Box::pin(async move {
            self.check_injected().await?;
            let mut state = self.state.write().await;
            let stored = state
                .deliveries
                .get_mut(&delivery.id)
                .ok_or_else(|| CoreError::NotFound(format!("delivery {}", delivery.id)))?;
            *stored = delivery.clone();
            Ok(())
        })
    }

    fn find_delivery_by_id(&self, id: DeliveryId) -> RepoFuture<'_, Option<Delivery>> {
        Box::pin(async move {
            self.check_injected().await?;
            Ok(self.state.read().await.deliveries.get(&id).cloned())
        })
    }

    fn find_pending_deliveries(
        &self,
        now: DateTime<Utc>,
        batch_size: usize,
    ) -> RepoFuture<'_, Vec<Delivery>> {
        Box::pin(async move {
            self.check_injected().await?;
            let state = self.state.read().await;
            let mut due: Vec<Delivery> =
                state.deliveries.values().filter(|d| d.is_due(now)).cloned().collect();
            due.sort_by_key(|d| (d.next_retry_at, d.created_at));
            due.truncate(batch_size);
            Ok(due)
        })
    }

    fn claim_delivery(
        &self,
        id: DeliveryId,
        now: DateTime<Utc>,
    ) -> RepoFuture<'_, Option<Delivery>> {
        Box::pin(async move {
            self.check_injected().await?;
            let mut state = self.state.write().await;
            let Some(delivery) = state.deliveries.get_mut(&id) else {
                return Ok(None);
            };
            if !delivery.is_ready(now) {
                return Ok(None);
            }
            delivery.status = DeliveryStatus::Delivering;
            delivery.last_attempt_at = Some(now);
            delivery.updated_at = now;
            Ok(Some(delivery.clone()))
        })
    }

    fn release_stale_deliveries(&self, claimed_before: DateTime<Utc>) -> RepoFuture<'_, u64> {
        Box::pin(async move {
            self.check_injected().await?;
            let mut state = self.state.write().await;
            let mut released = 0;
            for delivery in state.deliveries.values_mut() {
                let stale = delivery.status == DeliveryStatus::Delivering
                    && delivery.last_attempt_at.map_or(true, |at| at < claimed_before);
                if stale {
                    delivery.status = DeliveryStatus::Pending;
                    released += 1;
                }
            }
            Ok(released)
        })
    }

    fn find_destination_by_id(&self, id: DestinationId) -> RepoFuture<'_, Option<Destination>> {
        Box::pin(async move {
            self.check_injected().await?;
            Ok(self.state.read().await.destinations.get(&id).cloned())
        })
    }

    fn find_active_destinations_by_event_type<'a>(
        &'a self,
        event_type: &'a str,
    ) -> RepoFuture<'a, Vec<Destination>> {
        Box::pin(async move {
            self.check_injected().await?;
            let state = self.state.read().await;
            let mut matching: Vec<Destination> = state
                .destinations
                .values()
                .filter(|d| d.accepts_deliveries() && d.subscribes_to(event_type))
                .cloned()
                .collect();
            matching.sort_by_key(|d| d.created_at);
            Ok(matching)
        })
    }

    fn is_event_processed<'a>(&'a self, event_id: &'a EventId) -> RepoFuture<'a, bool> {
        Box::pin(async move {
            self.check_injected().await?;
            let state = self.state.read().await;
            Ok(state.pairs.iter().any(|(_, seen)| seen == event_id))
        })
    }

    fn increment_failure_count(
        &self,
        id: DestinationId,
        at: DateTime<Utc>,
    ) -> RepoFuture<'_, ()> {
        Box::pin(async move {
            self.check_injected().await?;
            if let Some(destination) = self.state.write().await.destinations.get_mut(&id) {
                destination.failure_count += 1;
                destination.consecutive_failures += 1;
                destination.last_failure_at = Some(at);
                destination.updated_at = at;
            }
            Ok(())
        })
    }

    fn record_success(&self, id: DestinationId, at: DateTime<Utc>) -> RepoFuture<'_, ()> {
        Box::pin(async move {
            self.check_injected().await?;
            if let Some(destination) = self.state.write().await.destinations.get_mut(&id) {
                destination.success_count += 1;
                destination.consecutive_failures = 0;
                destination.last_success_at = Some(at);
                destination.updated_at = at;
            }
            Ok(())
        })
    }

    fn create_log(&self, log: DeliveryLog) -> RepoFuture<'_, ()> {
        Box::pin(async move {
            self.check_injected().await?;
            self.state.write().await.logs.push(log);
            Ok(())
        })
    }
}
