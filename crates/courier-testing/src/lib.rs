//! Test infrastructure shared by the courier test suites.
//!
//! Provides fixture builders for destinations and inbound event messages, a
//! recording [`EventHandler`](courier_core::EventHandler), and [`TestEnv`],
//! which wires an in-memory repository, a controllable clock and an HTTP
//! mock server together.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod env;
pub mod events;
pub mod fixtures;

pub use env::{wait_for, TestEnv, DEFAULT_WAIT_TIMEOUT};
pub use events::RecordingEventHandler;
pub use fixtures::{DestinationBuilder, EventMessageBuilder};
