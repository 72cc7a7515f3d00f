//! Signed webhook delivery with bounded exponential-backoff retries.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────┐ queue_delivery ┌────────────────┐    ┌─────────────┐
//! │ Event consumer │ ─────────────▶ │ DeliveryEngine │ ─▶ │ HTTP client │
//! └────────────────┘                └────────────────┘    └─────────────┘
//!                                     ▲            │
//!                       due deliveries│            │ transitions, counters, logs
//!                                     │            ▼
//!                  ┌────────────────┐     ┌────────────────────┐
//!                  │ RetryScheduler │ ◀── │ DeliveryRepository │
//!                  └────────────────┘     └────────────────────┘
//! ```
//!
//! - [`signature`] builds the `{id, event, timestamp, data}` envelope and
//!   signs it with HMAC-SHA256.
//! - [`engine::DeliveryEngine`] claims a PENDING delivery, sends it, and
//!   persists exactly one state transition per attempt.
//! - [`scheduler::RetryScheduler`] re-drives deliveries whose
//!   `next_retry_at` has passed.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use courier_core::{InMemoryRepository, RealClock};
//! use courier_delivery::{DeliveryEngine, EngineConfig, RetryScheduler, SchedulerConfig};
//!
//! # async fn example() -> courier_delivery::Result<()> {
//! let engine = DeliveryEngine::new(
//!     Arc::new(InMemoryRepository::new()),
//!     EngineConfig::default(),
//!     Arc::new(RealClock::new()),
//! )?;
//! let scheduler = RetryScheduler::new(engine.clone(), SchedulerConfig::default()).spawn();
//!
//! scheduler.shutdown(std::time::Duration::from_secs(5)).await?;
//! engine.shutdown(std::time::Duration::from_secs(30)).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod engine;
pub mod error;
pub mod rate_limit;
pub mod retry;
pub mod scheduler;
pub mod signature;

pub use client::{ClientConfig, DeliveryClient, DeliveryRequest, DeliveryResponse};
pub use engine::{
    AttemptOutcome, DeliveryEngine, EngineConfig, EngineStats, SkipReason, TEST_EVENT_TYPE,
};
pub use error::{DeliveryError, Result};
pub use retry::{RetryDecision, RetryPolicy};
pub use scheduler::{RetryScheduler, SchedulerConfig, SchedulerHandle, SweepReport};

/// Default HTTP attempt timeout in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

/// Default number of response body bytes kept per attempt.
pub const DEFAULT_MAX_RESPONSE_BODY_BYTES: usize = 1024;

/// Default bound on concurrently running queued attempts.
pub const DEFAULT_MAX_CONCURRENT_DELIVERIES: usize = 50;

/// Default number of deliveries picked up per sweep.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Default time between sweeps in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5000;

/// Default age after which a DELIVERING claim is considered abandoned.
pub const DEFAULT_STALE_AFTER_SECONDS: u64 = 300;
