//! Shared test environment.
//!
//! Every test gets its own repository, clock and mock HTTP server, so tests
//! can run in parallel without coordinating.

use std::{future::Future, sync::Arc, time::Duration};

use anyhow::{bail, Result};
use courier_core::{
    Delivery, DeliveryId, DeliveryStatus, Destination, DestinationId, InMemoryRepository,
    TestClock,
};
use wiremock::MockServer;

use crate::fixtures::DestinationBuilder;

/// Default deadline for [`wait_for`] based helpers.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Polls `condition` until it returns true.
///
/// Fails with `description` in the message when `timeout` passes first.
pub async fn wait_for<F, Fut>(description: &str, timeout: Duration, mut condition: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("timed out after {timeout:?} waiting for {description}");
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// In-memory repository, test clock and mock receiver for one test.
pub struct TestEnv {
    /// Repository shared with the component under test.
    pub repository: Arc<InMemoryRepository>,
    /// Clock shared with the component under test.
    pub clock: TestClock,
    /// Mock destination server.
    pub http: MockServer,
}

impl TestEnv {
    /// Starts a fresh environment.
    pub async fn new() -> Self {
        Self {
            repository: Arc::new(InMemoryRepository::new()),
            clock: TestClock::new(),
            http: MockServer::start().await,
        }
    }

    /// Returns a destination builder pointing at the mock server.
    pub fn destination(&self) -> DestinationBuilder {
        DestinationBuilder::new(format!("{}/webhook", self.http.uri()))
    }

    /// Stores a destination and returns its id.
    pub async fn create_destination(&self, builder: DestinationBuilder) -> DestinationId {
        let destination = builder.build();
        let id = destination.id;
        self.repository.add_destination(destination).await;
        id
    }

    /// Returns the stored destination.
    pub async fn stored_destination(&self, id: DestinationId) -> Result<Destination> {
        match self.repository.destination(id).await {
            Some(destination) => Ok(destination),
            None => bail!("destination {id} not found"),
        }
    }

    /// Returns the stored delivery.
    pub async fn stored_delivery(&self, id: DeliveryId) -> Result<Delivery> {
        match self.repository.delivery(id).await {
            Some(delivery) => Ok(delivery),
            None => bail!("delivery {id} not found"),
        }
    }

    /// Waits until the delivery reaches `status`.
    pub async fn wait_for_delivery_status(
        &self,
        id: DeliveryId,
        status: DeliveryStatus,
    ) -> Result<Delivery> {
        let repository = self.repository.clone();
        let description = format!("delivery {id} to reach {status}");
        wait_for(&description, DEFAULT_WAIT_TIMEOUT, || {
            let repository = repository.clone();
            async move { repository.delivery(id).await.is_some_and(|d| d.status == status) }
        })
        .await?;
        self.stored_delivery(id).await
    }

    /// Waits until the mock server saw `count` requests.
    pub async fn wait_for_requests(&self, count: usize) -> Result<Vec<wiremock::Request>> {
        let description = format!("{count} requests at the mock server");
        wait_for(&description, DEFAULT_WAIT_TIMEOUT, || async {
            self.http.received_requests().await.is_some_and(|requests| requests.len() >= count)
        })
        .await?;
        Ok(self.http.received_requests().await.unwrap_or_default())
    }
}
