//! Retry scheduler: the periodic sweep that re-drives due deliveries.
//!
//! Fresh deliveries are queued by the consumer as soon as they exist. The
//! sweep is the safety net for everything else: retries whose backoff has
//! elapsed, deliveries orphaned by a crash, and deliveries whose destination
//! has been re-activated. The repository's `next_retry_at` is the only
//! timer; nothing is held in memory between sweeps.

use std::{collections::HashMap, time::Duration};

use courier_core::DestinationId;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    engine::DeliveryEngine,
    error::{DeliveryError, Result},
};

/// Sweep cadence and sizing.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Time between sweeps.
    pub poll_interval: Duration,
    /// Maximum deliveries picked up per sweep.
    pub batch_size: usize,
    /// DELIVERING claims older than this are returned to PENDING.
    pub stale_after: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(crate::DEFAULT_POLL_INTERVAL_MS),
            batch_size: crate::DEFAULT_BATCH_SIZE,
            stale_after: Duration::from_secs(crate::DEFAULT_STALE_AFTER_SECONDS),
        }
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Stale claims returned to PENDING.
    pub released_stale: u64,
    /// Due deliveries returned by the repository.
    pub found: usize,
    /// Deliveries handed to the engine.
    pub queued: usize,
    /// Deliveries left alone because their destination is inactive.
    pub skipped_inactive: usize,
    /// Deliveries left alone because an attempt is already queued or running.
    pub skipped_in_flight: usize,
}

/// Finds due PENDING deliveries and queues them on the engine.
#[derive(Clone)]
pub struct RetryScheduler {
    engine: DeliveryEngine,
    config: SchedulerConfig,
}

impl RetryScheduler {
    /// Creates a scheduler driving `engine`.
    pub fn new(engine: DeliveryEngine, config: SchedulerConfig) -> Self {
        Self { engine, config }
    }

    /// Runs one sweep.
    ///
    /// Deliveries whose destination is inactive are not attempted and not
    /// modified, so a later sweep picks them up once it is re-activated.
    ///
    /// # Errors
    ///
    /// Returns repository errors. Errors of individual attempts are handled
    /// by the engine.
    pub async fn process_pending_deliveries(&self) -> Result<SweepReport> {
        let repository = self.engine.repository();
        let now = self.engine.clock().now_utc();
        let mut report = SweepReport::default();

        let stale_after = chrono::Duration::from_std(self.config.stale_after)
            .map_err(|e| DeliveryError::configuration(format!("invalid stale timeout: {e}")))?;
        report.released_stale = repository.release_stale_deliveries(now - stale_after).await?;
        if report.released_stale > 0 {
            warn!(released = report.released_stale, "released stale delivery claims");
        }

        let pending = repository.find_pending_deliveries(now, self.config.batch_size).await?;
        report.found = pending.len();

        let mut accepting: HashMap<DestinationId, bool> = HashMap::new();
        for delivery in pending {
            if self.engine.is_queued(delivery.id) || self.engine.is_in_flight(delivery.id) {
                report.skipped_in_flight += 1;
                continue;
            }

            let accepts = match accepting.get(&delivery.destination_id) {
                Some(&accepts) => accepts,
                None => {
                    // A missing destination is queued so the engine can fail it.
                    let accepts = repository
                        .find_destination_by_id(delivery.destination_id)
                        .await?
                        .map_or(true, |destination| destination.accepts_deliveries());
                    accepting.insert(delivery.destination_id, accepts);
                    accepts
                },
            };

            if !accepts {
                report.skipped_inactive += 1;
                continue;
            }

            if self.engine.queue_delivery(delivery.id) {
                report.queued += 1;
            }
        }

        if report.found > 0 {
            debug!(
                found = report.found,
                queued = report.queued,
                skipped_inactive = report.skipped_inactive,
                skipped_in_flight = report.skipped_in_flight,
                "sweep completed"
            );
        }

        Ok(report)
    }

    /// Sweeps every `poll_interval` until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis(),
            batch_size = self.config.batch_size,
            "retry scheduler starting"
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }

            if let Err(e) = self.process_pending_deliveries().await {
                error!(error = %e, "retry sweep failed");
            }

            tokio::select! {
                () = self.engine.clock().sleep(self.config.poll_interval) => {}
                () = cancel.cancelled() => break,
            }
        }

        info!("retry scheduler stopped");
    }

    /// Runs the scheduler on a background task.
    pub fn spawn(self) -> SchedulerHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { self.run(token).await });
        SchedulerHandle { cancel, handle }
    }
}

/// Handle to a scheduler started with [`RetryScheduler::spawn`].
#[derive(Debug)]
pub struct SchedulerHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stops the sweep loop and waits for the current sweep to finish.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if the loop does not stop within `timeout`.
    pub async fn shutdown(self, timeout: Duration) -> Result<()> {
        self.cancel.cancel();
        match tokio::time::timeout(timeout, self.handle).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(join_error)) => {
                error!(error = %join_error, "retry scheduler task panicked");
                Ok(())
            },
            Err(_elapsed) => Err(DeliveryError::ShutdownTimeout { timeout }),
        }
    }
}
