//! The `client` module covers everything scoped to one connection.
//!
//! - `pubsub_client`: the shared `Client` handle (identity, outbound
//!   channel, liveness and stop flags)
//! - `delivery`: packet identifier pool and QoS handshake bookkeeping
//! - `connection`: the handshake and read/dispatch state machine
//! - `keepalive`: the idle monitor

pub mod connection;
pub mod delivery;
pub mod keepalive;
pub mod pubsub_client;

pub use connection::Connection;
pub use pubsub_client::Client;

#[cfg(test)]
mod tests;
