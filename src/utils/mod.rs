//! The `utils` module provides the error types and logging setup shared
//! across the `mqttd` broker.

pub mod error;
pub mod logging;

pub use error::{BrokerError, FramingError, ProtocolViolation, Result};
