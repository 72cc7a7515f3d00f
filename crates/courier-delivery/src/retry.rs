//! Exponential backoff for failed attempts.
//!
//! The delay before attempt `n + 1` is `base_delay * multiplier^(n - 1)`,
//! capped at `max_delay`, with optional symmetric jitter. Every failure
//! class (4xx, 5xx, network, timeout) consumes the attempt budget the same
//! way.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{DeliveryError, Result};

/// Backoff configuration shared by all destinations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay after the first failed attempt.
    pub base_delay: Duration,

    /// Growth factor applied per additional failed attempt.
    pub multiplier: f64,

    /// Upper bound on any single delay.
    pub max_delay: Duration,

    /// Jitter fraction (0.0 to 1.0) applied symmetrically around the delay.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(24 * 60 * 60),
            jitter_factor: 0.0,
        }
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Return to PENDING and try again at `next_retry_at`.
    Retry {
        /// When the next attempt becomes due
        next_retry_at: DateTime<Utc>,
    },
    /// Mark the delivery FAILED.
    GiveUp {
        /// Why no further attempt is made
        reason: String,
    },
}

impl RetryPolicy {
    /// Rejects multipliers below 1 and jitter outside `[0, 1]`.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` describing the offending field.
    pub fn validate(&self) -> Result<()> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(DeliveryError::configuration(format!(
                "retry multiplier must be >= 1.0, got {}",
                self.multiplier
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(DeliveryError::configuration(format!(
                "retry jitter factor must be within [0, 1], got {}",
                self.jitter_factor
            )));
        }
        if self.base_delay > self.max_delay {
            return Err(DeliveryError::configuration("retry base delay exceeds max delay"));
        }
        Ok(())
    }

    /// Returns the delay that follows `attempts` failed attempts.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exponent = i32::try_from(attempts.saturating_sub(1)).unwrap_or(i32::MAX);
        let raw = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = if raw.is_finite() {
            raw.min(self.max_delay.as_secs_f64())
        } else {
            self.max_delay.as_secs_f64()
        };

        let jittered = apply_jitter(capped, self.jitter_factor);
        Duration::from_secs_f64(jittered.min(self.max_delay.as_secs_f64()))
    }

    /// Decides whether a delivery that has now made `attempts` attempts out of
    /// `max_attempts` is retried.
    pub fn decide(
        &self,
        attempts: u32,
        max_attempts: u32,
        failed_at: DateTime<Utc>,
    ) -> RetryDecision {
        if attempts >= max_attempts {
            return RetryDecision::GiveUp {
                reason: format!("maximum attempts ({max_attempts}) reached"),
            };
        }

        let Ok(delay) = chrono::Duration::from_std(self.delay_for(attempts)) else {
            return RetryDecision::GiveUp { reason: "retry delay out of range".to_string() };
        };

        RetryDecision::Retry { next_retry_at: failed_at + delay }
    }
}

fn apply_jitter(secs: f64, jitter_factor: f64) -> f64 {
    if jitter_factor <= 0.0 || secs <= 0.0 {
        return secs;
    }

    let range = secs * jitter_factor.min(1.0);
    let offset = rand::rng().random_range(-range..=range);
    (secs + offset).max(0.0)
}
