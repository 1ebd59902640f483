//! Message definitions for the broker
//!
//! `PendingMessage` is what PUBLISH handling places on the process-wide
//! queue and what the forwarder consumes, exactly once, to fan out.
//!
//! Notes on fields:
//! - `topic`: topic name used for routing, matched by exact string equality
//! - `payload`: opaque application bytes, never inspected by the broker
//! - `qos`: the delivery level the publisher asked for; each subscriber
//!   receives `min(qos, granted)`

use bytes::Bytes;

use crate::transport::packet::QoS;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
}

impl PendingMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
        }
    }
}
