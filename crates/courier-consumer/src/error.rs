//! Error types for event consumption.

use std::time::Duration;

use courier_core::CoreError;
use courier_delivery::DeliveryError;
use thiserror::Error;

/// Result type alias for consumer operations.
pub type Result<T> = std::result::Result<T, ConsumerError>;

/// Errors raised while receiving and fanning out broker messages.
#[derive(Debug, Error)]
pub enum ConsumerError {
    /// The message body cannot be turned into an event.
    #[error("malformed message: {message}")]
    MalformedMessage {
        /// What was wrong with the message
        message: String,
    },

    /// The broker rejected a receive, ack or nack.
    #[error("broker error: {message}")]
    Broker {
        /// Broker failure description
        message: String,
    },

    /// In-flight messages did not finish before the shutdown deadline.
    #[error("consumer shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// Deadline that elapsed
        timeout: Duration,
    },

    /// The repository failed.
    #[error(transparent)]
    Repository(#[from] CoreError),

    /// The delivery engine failed.
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

impl ConsumerError {
    /// Creates a malformed message error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedMessage { message: message.into() }
    }

    /// Creates a broker error.
    pub fn broker(message: impl Into<String>) -> Self {
        Self::Broker { message: message.into() }
    }
}

impl From<redis::RedisError> for ConsumerError {
    fn from(err: redis::RedisError) -> Self {
        Self::broker(err.to_string())
    }
}
