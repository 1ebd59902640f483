//! # mqttd
//!
//! `mqttd` is an in-memory MQTT 3.1.1 broker built on tokio. It speaks the
//! core wire protocol over TCP: the CONNECT handshake, SUBSCRIBE and
//! UNSUBSCRIBE, PUBLISH at QoS 0, 1 and 2 with their acknowledgment
//! handshakes, and PINGREQ keepalive.
//!
//! ## Core Modules
//!
//! - `broker`: connection list, subscription registry and the forwarder task
//!   that fans published messages out to subscribers.
//! - `client`: per-connection state machine, QoS bookkeeping and keepalive.
//! - `config`: loads the broker configuration.
//! - `transport`: packet codec and the TCP listener.
//! - `utils`: error types and logging setup.
//!
//! Topics are matched by exact string equality; sessions, retained messages
//! and authentication are not supported.

pub mod broker;
pub mod client;
pub mod config;
pub mod transport;
pub mod utils;

pub use transport::listener::run;
