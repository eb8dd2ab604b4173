//! Bellwether coordinates concurrently running instances of one application that share nothing
//! but a broadcast-style publish/subscribe bus. It elects exactly one instance as leader via
//! randomized-timeout elections, keeps the assignment current through heartbeats and departure
//! notices as instances join, leave, or silently die, and uses leadership so each named logical
//! stream is produced by exactly one instance and fanned out to all of them.

mod app;
pub mod broker;
pub mod config;
pub mod coordinator;
pub mod election;
pub mod error;
#[cfg(test)]
mod fixtures;
pub mod models;
pub mod transport;
mod utils;

pub use crate::app::Instance;
pub use crate::broker::{StreamBroker, StreamSubscription};
pub use crate::config::Config;
pub use crate::election::{ElectionOutcome, ElectionResult};
pub use crate::error::ShutdownError;
pub use crate::models::{LeaderState, LeadershipStatus, Payload, PeerMessage, Topic};
pub use crate::transport::PeerChannel;
