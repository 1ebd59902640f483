//! Fixed-header framing
//!
//! Every MQTT packet starts with one byte carrying the packet kind in the
//! high nibble and kind-specific flags in the low nibble, followed by the
//! remaining length as a base-128 varint of one to four bytes. `MqttCodec`
//! splits a byte stream into `Frame`s on that boundary and serializes typed
//! `Packet`s back onto it, so it can sit under `tokio_util::codec::Framed`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::transport::packet::Packet;
use crate::utils::error::{BrokerError, FramingError, ProtocolViolation};

/// Largest value a four byte varint can carry.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

const MAX_VARINT_BYTES: usize = 4;

/// Upper bound on how much the decoder reserves ahead of bytes that have
/// actually arrived.
const RESERVE_CHUNK: usize = 8 * 1024;

/// The fourteen control packet kinds of MQTT 3.1.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
}

impl TryFrom<u8> for PacketKind {
    type Error = ProtocolViolation;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(PacketKind::Connect),
            2 => Ok(PacketKind::ConnAck),
            3 => Ok(PacketKind::Publish),
            4 => Ok(PacketKind::PubAck),
            5 => Ok(PacketKind::PubRec),
            6 => Ok(PacketKind::PubRel),
            7 => Ok(PacketKind::PubComp),
            8 => Ok(PacketKind::Subscribe),
            9 => Ok(PacketKind::SubAck),
            10 => Ok(PacketKind::Unsubscribe),
            11 => Ok(PacketKind::UnsubAck),
            12 => Ok(PacketKind::PingReq),
            13 => Ok(PacketKind::PingResp),
            14 => Ok(PacketKind::Disconnect),
            other => Err(ProtocolViolation::UnsupportedPacketKind(other)),
        }
    }
}

/// One undecoded packet: the fixed header split out, the body left raw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: PacketKind,
    pub flags: u8,
    pub payload: Bytes,
}

/// Decode a remaining-length varint from the front of `src`.
///
/// Returns the value and the number of bytes it occupied, or `None` when
/// `src` ends before the final (continuation-clear) byte.
pub fn decode_remaining_length(src: &[u8]) -> Result<Option<(usize, usize)>, FramingError> {
    let mut value = 0usize;
    let mut multiplier = 1usize;

    for (i, byte) in src.iter().take(MAX_VARINT_BYTES).enumerate() {
        value += (byte & 0x7f) as usize * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
        multiplier *= 128;
    }

    if src.len() >= MAX_VARINT_BYTES {
        Err(FramingError::MalformedRemainingLength)
    } else {
        Ok(None)
    }
}

/// Append `len` to `dst` as a remaining-length varint.
pub fn write_remaining_length(mut len: usize, dst: &mut BytesMut) -> Result<(), FramingError> {
    if len > MAX_REMAINING_LENGTH {
        return Err(FramingError::RemainingLengthTooLarge(len));
    }
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        dst.put_u8(byte);
        if len == 0 {
            return Ok(());
        }
    }
}

pub fn encode_remaining_length(len: usize) -> Result<Bytes, FramingError> {
    let mut buf = BytesMut::with_capacity(MAX_VARINT_BYTES);
    write_remaining_length(len, &mut buf)?;
    Ok(buf.freeze())
}

/// Write a complete packet: header byte, varint, body.
pub fn write_frame(
    kind: PacketKind,
    flags: u8,
    body: &[u8],
    dst: &mut BytesMut,
) -> Result<(), FramingError> {
    dst.reserve(1 + MAX_VARINT_BYTES + body.len());
    dst.put_u8((kind as u8) << 4 | (flags & 0x0f));
    write_remaining_length(body.len(), dst)?;
    dst.put_slice(body);
    Ok(())
}

/// Splits a byte stream into `Frame`s and writes `Packet`s.
///
/// Frames whose remaining length exceeds `max_packet_size` are rejected as
/// soon as their fixed header is readable.
#[derive(Debug, Clone, Copy)]
pub struct MqttCodec {
    max_packet_size: usize,
}

impl Default for MqttCodec {
    fn default() -> Self {
        Self::new(MAX_REMAINING_LENGTH)
    }
}

impl MqttCodec {
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            max_packet_size: max_packet_size.min(MAX_REMAINING_LENGTH),
        }
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }
}

impl Decoder for MqttCodec {
    type Item = Frame;
    type Error = BrokerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, BrokerError> {
        let Some(&first) = src.first() else {
            return Ok(None);
        };
        let kind = PacketKind::try_from(first >> 4)?;

        let Some((remaining, varint_len)) = decode_remaining_length(&src[1..])? else {
            return Ok(None);
        };

        if remaining > self.max_packet_size {
            return Err(FramingError::PacketTooLarge {
                size: remaining,
                max: self.max_packet_size,
            }
            .into());
        }

        let total = 1 + varint_len + remaining;
        if src.len() < total {
            src.reserve((total - src.len()).min(RESERVE_CHUNK));
            return Ok(None);
        }

        src.advance(1 + varint_len);
        let payload = src.split_to(remaining).freeze();
        Ok(Some(Frame {
            kind,
            flags: first & 0x0f,
            payload,
        }))
    }
}

impl Encoder<Packet> for MqttCodec {
    type Error = BrokerError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), BrokerError> {
        item.encode(dst)
    }
}
