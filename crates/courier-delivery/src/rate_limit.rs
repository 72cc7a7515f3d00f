//! Per-destination request rate limiting.
//!
//! Each destination with a `rate_limit` gets a token bucket holding up to one
//! second of burst. Time comes from the injected [`Clock`], so tests can drive
//! refills deterministically.

use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
    time::{Duration, Instant},
};

use courier_core::{Clock, DestinationId};
use tracing::debug;

/// Token bucket refilled continuously at `refill_per_sec`.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
    per_second: u32,
}

impl TokenBucket {
    /// Creates a full bucket allowing `per_second` requests per second.
    pub fn new(per_second: u32, now: Instant) -> Self {
        let rate = f64::from(per_second.max(1));
        Self { capacity: rate, tokens: rate, refill_per_sec: rate, last_refill: now, per_second }
    }

    /// Takes one token, or returns how long until one is available.
    pub fn try_take(&mut self, now: Instant) -> Result<(), Duration> {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            Err(Duration::from_secs_f64((1.0 - self.tokens) / self.refill_per_sec))
        }
    }
}

/// Buckets keyed by destination.
#[derive(Debug, Default)]
pub struct RateLimiter {
    buckets: Mutex<HashMap<DestinationId, TokenBucket>>,
}

impl RateLimiter {
    /// Creates a limiter with no buckets.
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes a token for `destination_id` or returns the wait until one is
    /// available. A changed `per_second` replaces the bucket.
    pub fn try_acquire(
        &self,
        destination_id: DestinationId,
        per_second: u32,
        now: Instant,
    ) -> Result<(), Duration> {
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        let bucket = buckets
            .entry(destination_id)
            .or_insert_with(|| TokenBucket::new(per_second, now));
        if bucket.per_second != per_second {
            *bucket = TokenBucket::new(per_second, now);
        }
        bucket.try_take(now)
    }

    /// Waits on `clock` until a token for `destination_id` is available.
    pub async fn acquire(&self, destination_id: DestinationId, per_second: u32, clock: &dyn Clock) {
        loop {
            match self.try_acquire(destination_id, per_second, clock.now()) {
                Ok(()) => return,
                Err(wait) => {
                    debug!(
                        destination_id = %destination_id,
                        wait_ms = wait.as_millis(),
                        "rate limit reached, waiting for token"
                    );
                    clock.sleep(wait).await;
                },
            }
        }
    }
}
