//! Simulate a population of endpoints exchanging messages over an unreliable network.
//!
//! Two components run on their own threads and cooperate:
//!
//! * [scheduler::Scheduler] advances a virtual clock in fixed steps and fires one-shot and
//!   repeating callbacks (ordered by time, then priority).
//! * [network::Network] admits messages (dropping a configurable fraction), holds each
//!   survivor for a random delay, and hands it to a [Directory] for delivery.
//!
//! Callbacks fired by the scheduler typically call [network::Network::send], which never
//! blocks on delivery.
//!
//! # Example
//!
//! ```rust
//! use iotsim_engine::{endpoints::Endpoints, message::{Kind, Message}, network, scheduler};
//! use std::{sync::Arc, time::Duration};
//!
//! let endpoints = Arc::new(Endpoints::default());
//! let _gateway = endpoints.register("gateway").unwrap();
//! let _sensor = endpoints.register("sensor_1").unwrap();
//!
//! let network = Arc::new(network::Network::new(endpoints, network::Config::default()));
//! network.start().unwrap();
//!
//! let scheduler = scheduler::Scheduler::new(scheduler::Config::default());
//! let sender = network.clone();
//! scheduler.schedule(Duration::from_millis(20), move || {
//!     sender.send(Message::new("sensor_1", "gateway", "21.5", Kind::Data));
//! });
//! scheduler.start().unwrap();
//! # scheduler.stop();
//! # network.stop();
//! ```

use thiserror::Error;

pub mod endpoints;
pub mod message;
pub mod network;
pub mod scheduler;
mod utils;

use message::Message;

/// Errors that can occur when interacting with the simulation.
#[derive(Debug, Error)]
pub enum Error {
    #[error("endpoint already registered: {0}")]
    AlreadyRegistered(String),
    #[error("endpoint closed: {0}")]
    EndpointClosed(String),
    #[error("repeating interval must be non-zero")]
    ZeroInterval,
    #[error("unknown protocol: {0}")]
    UnknownProtocol(String),
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Resolves endpoint identifiers to something messages can be delivered to.
///
/// The delivery engine only relies on this interface, so any synchronized table of
/// endpoints can back a [network::Network].
pub trait Directory: Send + Sync + 'static {
    /// Opaque handle to a registered endpoint.
    type Handle: Send;

    /// Returns a handle to the endpoint, if it is registered.
    fn lookup(&self, id: &str) -> Option<Self::Handle>;

    /// Returns whether an endpoint is registered under `id`.
    fn exists(&self, id: &str) -> bool {
        self.lookup(id).is_some()
    }

    /// Hands `message` to the endpoint behind `handle`.
    fn deliver(&self, handle: &Self::Handle, message: Message) -> Result<(), Error>;

    /// Returns the number of registered endpoints.
    fn count(&self) -> usize;

    /// Delivers `message` to every registered endpoint except `source`, returning the
    /// number of endpoints that accepted it.
    fn broadcast_except(&self, source: &str, message: &Message) -> usize;
}

#[cfg(test)]
pub(crate) fn traced() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
