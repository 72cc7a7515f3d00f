//! Core domain types for the courier event-delivery service.
//!
//! Holds the models every other crate shares, the [`Clock`] abstraction,
//! event-type pattern matching, delivery outcome events, and the
//! [`DeliveryRepository`] seam with in-memory and PostgreSQL
//! implementations.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod events;
pub mod models;
pub mod pattern;
pub mod repository;
pub mod time;

pub use error::{CoreError, Result};
pub use events::{
    DeliveryEvent, DeliveryFailedEvent, DeliverySucceededEvent, EventHandler,
    MulticastEventHandler, NoOpEventHandler,
};
pub use models::{
    Delivery, DeliveryId, DeliveryLog, DeliveryStatus, Destination, DestinationId,
    DestinationStatus, ErrorKind, EventId, LogAction, LogId, SigningSecret,
};
pub use repository::{
    memory::InMemoryRepository, postgres::PostgresRepository, DeliveryRepository, RepoFuture,
};
pub use time::{Clock, RealClock, TestClock};
