//! The `broker` module holds the process-wide side of message routing: the
//! connection list and subscription registry (`engine`), registry entries
//! (`topic`), queued publishes (`message`) and the fan-out task
//! (`forwarder`).

pub mod engine;
pub mod forwarder;
pub mod message;
pub mod topic;

pub use engine::{Broker, SharedBroker};
