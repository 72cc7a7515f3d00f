//! Error types for delivery operations.
//!
//! Transport failures (`Network`, `Timeout`) never escape an attempt: the
//! engine converts them into a retry or a terminal failure and records the
//! matching [`ErrorKind`]. The remaining variants are returned to callers of
//! the engine's entry points.

use std::time::Duration;

use courier_core::{CoreError, ErrorKind};
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Errors raised by the signature service, HTTP client and engine.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Connection refused, DNS failure, reset or TLS failure.
    #[error("network error: {message}")]
    Network {
        /// Description of the transport failure
        message: String,
    },

    /// No response within the attempt timeout.
    #[error("request timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout that elapsed, in milliseconds
        timeout_ms: u64,
    },

    /// The request could not be built, for example because of a bad URL or
    /// header value.
    #[error("invalid request: {message}")]
    InvalidRequest {
        /// What was wrong with the request
        message: String,
    },

    /// A delivery or destination does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of entity that was looked up
        entity: &'static str,
        /// Identifier that was looked up
        id: String,
    },

    /// The operation is not allowed in the delivery's current state.
    #[error("invalid state: {message}")]
    InvalidState {
        /// Why the operation was rejected
        message: String,
    },

    /// Component configuration is unusable.
    #[error("configuration error: {message}")]
    Configuration {
        /// Configuration problem
        message: String,
    },

    /// In-flight work did not finish before the shutdown deadline.
    #[error("shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// Deadline that elapsed
        timeout: Duration,
    },

    /// The repository failed.
    #[error(transparent)]
    Repository(#[from] CoreError),
}

impl DeliveryError {
    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    /// Creates an invalid request error.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest { message: message.into() }
    }

    /// Creates a not-found error.
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound { entity, id: id.to_string() }
    }

    /// Creates an invalid state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Classifies the error for the delivery record.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network { .. } => ErrorKind::Network,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::InvalidRequest { .. }
            | Self::NotFound { .. }
            | Self::InvalidState { .. }
            | Self::Configuration { .. }
            | Self::ShutdownTimeout { .. }
            | Self::Repository(_) => ErrorKind::Unknown,
        }
    }
}
