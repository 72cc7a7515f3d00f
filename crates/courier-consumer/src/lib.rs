//! Broker-facing side of courier.
//!
//! The [`EventConsumer`] reads platform events from a [`MessageBroker`],
//! creates one delivery per subscribed destination and hands each to the
//! delivery engine. Messages are acknowledged only after that hand-off, so
//! the broker redelivers anything the consumer did not finish; redelivered
//! events that already produced deliveries are acknowledged without side
//! effects.
//!
//! Two brokers ship with the crate: [`InMemoryBroker`] for tests and
//! embedding, and [`RedisStreamBroker`] for Redis Streams consumer groups.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod broker;
pub mod consumer;
pub mod error;
pub mod message;
pub mod redis_stream;

pub use broker::{BrokerMessage, InMemoryBroker, MessageBroker};
pub use consumer::{ConsumerConfig, ConsumerHandle, ConsumerStats, EventConsumer, ProcessOutcome};
pub use error::{ConsumerError, Result};
pub use message::{parse_message, EventMessage};
pub use redis_stream::{RedisStreamBroker, RedisStreamConfig};

/// Default number of messages processed concurrently.
pub const DEFAULT_PREFETCH: usize = 10;

/// Default time to wait for in-flight messages on shutdown.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECONDS: u64 = 30;
