//! The `error` module defines the error types used within the `mqttd` broker.
//!
//! Every fault a connection can hit maps onto one of these. Framing and
//! protocol errors are fatal to the connection that raised them and never
//! leave that connection's task.

use thiserror::Error;

use crate::transport::codec::PacketKind;

/// Errors raised while reading or writing the fixed-header varint.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FramingError {
    #[error("remaining length varint longer than 4 bytes")]
    MalformedRemainingLength,
    #[error("remaining length {0} exceeds 268435455")]
    RemainingLengthTooLarge(usize),
    #[error("packet of {size} bytes exceeds the {max} byte limit")]
    PacketTooLarge { size: usize, max: usize },
}

/// Peer behaviour the protocol does not allow.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("first packet was {0:?}, expected CONNECT")]
    UnexpectedFirstPacket(PacketKind),
    #[error("bad protocol name")]
    BadProtocolName,
    #[error("unsupported protocol level {0}")]
    UnsupportedProtocolLevel(u8),
    #[error("unsupported packet kind {0}")]
    UnsupportedPacketKind(u8),
    #[error("unexpected {0:?} packet")]
    UnexpectedPacket(PacketKind),
    #[error("invalid flags {flags:#06b} for {kind:?}")]
    InvalidFlags { kind: PacketKind, flags: u8 },
    #[error("invalid qos {0}")]
    InvalidQos(u8),
    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),
    #[error("string is not valid utf-8")]
    InvalidUtf8,
    #[error("no packet identifier available")]
    PacketIdsExhausted,
    #[error("packet identifier {0} is not in flight")]
    UnknownPacketId(u16),
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error(transparent)]
    Protocol(#[from] ProtocolViolation),
    #[error("no CONNECT within the handshake window")]
    HandshakeTimeout,
    #[error("keepalive expired")]
    KeepaliveExpired,
    #[error("transport closed")]
    TransportClosed,
    #[error("message queue closed")]
    QueueClosed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl BrokerError {
    /// Faults that end a connection without being worth an error-level log.
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            BrokerError::HandshakeTimeout
                | BrokerError::KeepaliveExpired
                | BrokerError::TransportClosed
                | BrokerError::Protocol(ProtocolViolation::UnsupportedProtocolLevel(_))
        )
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;
