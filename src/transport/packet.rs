//! Typed MQTT 3.1.1 packets
//!
//! `Packet` is an exhaustive enum over the fourteen control packet kinds.
//! `Packet::decode` turns a `Frame` produced by `MqttCodec` into one of
//! them, validating the per-kind payload layout; `Packet::encode` writes the
//! bit-exact wire form. Both directions are implemented for every kind so
//! the same code can drive a client in tests.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::transport::codec::{Frame, PacketKind, write_frame};
use crate::utils::error::{ProtocolViolation, Result};

/// Protocol name field of CONNECT, length prefix included.
pub const PROTOCOL_NAME: &[u8; 6] = b"\x00\x04MQTT";
/// MQTT 3.1.1.
pub const PROTOCOL_LEVEL: u8 = 4;

const MIN_CONNECT_LEN: usize = 10;
/// Flags nibble mandated for PUBREL, SUBSCRIBE and UNSUBSCRIBE.
const RESERVED_FLAGS: u8 = 0b0010;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = ProtocolViolation;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(ProtocolViolation::InvalidQos(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub message: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Connect {
    pub clean_session: bool,
    pub keep_alive: u16,
    pub client_id: String,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<Bytes>,
}

impl Connect {
    pub fn new(client_id: impl Into<String>, keep_alive: u16) -> Self {
        Self {
            clean_session: true,
            keep_alive,
            client_id: client_id.into(),
            ..Default::default()
        }
    }

    fn flags(&self) -> u8 {
        let mut flags = 0u8;
        if self.clean_session {
            flags |= 0x02;
        }
        if let Some(will) = &self.will {
            flags |= 0x04 | (will.qos as u8) << 3;
            if will.retain {
                flags |= 0x20;
            }
        }
        if self.password.is_some() {
            flags |= 0x40;
        }
        if self.username.is_some() {
            flags |= 0x80;
        }
        flags
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    pub session_present: bool,
    pub return_code: u8,
}

impl ConnAck {
    /// Connection accepted, no session present.
    pub fn accepted() -> Self {
        Self {
            session_present: false,
            return_code: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    /// Present exactly when `qos` is above `AtMostOnce`.
    pub pid: Option<u16>,
    pub payload: Bytes,
}

impl Publish {
    pub fn new(topic: impl Into<String>, qos: QoS, pid: Option<u16>, payload: Bytes) -> Self {
        Self {
            dup: false,
            qos,
            retain: false,
            topic: topic.into(),
            pid,
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub pid: u16,
    pub topics: Vec<(String, QoS)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub pid: u16,
    pub granted: Vec<QoS>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub pid: u16,
    pub topics: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(u16),
    PubRec(u16),
    PubRel(u16),
    PubComp(u16),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(u16),
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet {
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::Connect(_) => PacketKind::Connect,
            Packet::ConnAck(_) => PacketKind::ConnAck,
            Packet::Publish(_) => PacketKind::Publish,
            Packet::PubAck(_) => PacketKind::PubAck,
            Packet::PubRec(_) => PacketKind::PubRec,
            Packet::PubRel(_) => PacketKind::PubRel,
            Packet::PubComp(_) => PacketKind::PubComp,
            Packet::Subscribe(_) => PacketKind::Subscribe,
            Packet::SubAck(_) => PacketKind::SubAck,
            Packet::Unsubscribe(_) => PacketKind::Unsubscribe,
            Packet::UnsubAck(_) => PacketKind::UnsubAck,
            Packet::PingReq => PacketKind::PingReq,
            Packet::PingResp => PacketKind::PingResp,
            Packet::Disconnect => PacketKind::Disconnect,
        }
    }

    pub fn decode(frame: Frame) -> std::result::Result<Packet, ProtocolViolation> {
        let Frame {
            kind,
            flags,
            payload: mut buf,
        } = frame;

        if matches!(
            kind,
            PacketKind::PubRel | PacketKind::Subscribe | PacketKind::Unsubscribe
        ) && flags != RESERVED_FLAGS
        {
            return Err(ProtocolViolation::InvalidFlags { kind, flags });
        }

        let packet = match kind {
            PacketKind::Connect => Packet::Connect(decode_connect(buf)?),
            PacketKind::ConnAck => {
                let session_present = read_u8(&mut buf, "connack")? & 0x01 == 1;
                let return_code = read_u8(&mut buf, "connack")?;
                Packet::ConnAck(ConnAck {
                    session_present,
                    return_code,
                })
            }
            PacketKind::Publish => Packet::Publish(decode_publish(flags, buf)?),
            PacketKind::PubAck => Packet::PubAck(read_u16(&mut buf, "puback")?),
            PacketKind::PubRec => Packet::PubRec(read_u16(&mut buf, "pubrec")?),
            PacketKind::PubRel => Packet::PubRel(read_u16(&mut buf, "pubrel")?),
            PacketKind::PubComp => Packet::PubComp(read_u16(&mut buf, "pubcomp")?),
            PacketKind::Subscribe => {
                let pid = read_u16(&mut buf, "subscribe packet id")?;
                let mut topics = Vec::new();
                while buf.has_remaining() {
                    let topic = read_string(&mut buf, "subscribe topic")?;
                    let qos = QoS::try_from(read_u8(&mut buf, "subscribe qos")?)?;
                    topics.push((topic, qos));
                }
                if topics.is_empty() {
                    return Err(ProtocolViolation::MalformedPacket("subscribe without topics"));
                }
                Packet::Subscribe(Subscribe { pid, topics })
            }
            PacketKind::SubAck => {
                let pid = read_u16(&mut buf, "suback packet id")?;
                let granted = buf
                    .iter()
                    .map(|code| QoS::try_from(*code))
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Packet::SubAck(SubAck { pid, granted })
            }
            PacketKind::Unsubscribe => {
                let pid = read_u16(&mut buf, "unsubscribe packet id")?;
                let mut topics = Vec::new();
                while buf.has_remaining() {
                    topics.push(read_string(&mut buf, "unsubscribe topic")?);
                }
                if topics.is_empty() {
                    return Err(ProtocolViolation::MalformedPacket(
                        "unsubscribe without topics",
                    ));
                }
                Packet::Unsubscribe(Unsubscribe { pid, topics })
            }
            PacketKind::UnsubAck => Packet::UnsubAck(read_u16(&mut buf, "unsuback")?),
            PacketKind::PingReq => Packet::PingReq,
            PacketKind::PingResp => Packet::PingResp,
            PacketKind::Disconnect => Packet::Disconnect,
        };
        Ok(packet)
    }

    /// Append the wire form of this packet to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        let mut body = BytesMut::new();
        let mut flags = 0u8;

        match self {
            Packet::Connect(connect) => {
                body.put_slice(PROTOCOL_NAME);
                body.put_u8(PROTOCOL_LEVEL);
                body.put_u8(connect.flags());
                body.put_u16(connect.keep_alive);
                write_string(&mut body, &connect.client_id)?;
                if let Some(will) = &connect.will {
                    write_string(&mut body, &will.topic)?;
                    write_bytes(&mut body, &will.message)?;
                }
                if let Some(username) = &connect.username {
                    write_string(&mut body, username)?;
                }
                if let Some(password) = &connect.password {
                    write_bytes(&mut body, password)?;
                }
            }
            Packet::ConnAck(ack) => {
                body.put_u8(ack.session_present as u8);
                body.put_u8(ack.return_code);
            }
            Packet::Publish(publish) => {
                flags = (publish.dup as u8) << 3 | (publish.qos as u8) << 1 | publish.retain as u8;
                write_string(&mut body, &publish.topic)?;
                if publish.qos != QoS::AtMostOnce {
                    let pid = publish
                        .pid
                        .ok_or(ProtocolViolation::MalformedPacket("publish without packet id"))?;
                    body.put_u16(pid);
                }
                body.put_slice(&publish.payload);
            }
            Packet::PubAck(pid)
            | Packet::PubRec(pid)
            | Packet::PubComp(pid)
            | Packet::UnsubAck(pid) => body.put_u16(*pid),
            Packet::PubRel(pid) => {
                flags = RESERVED_FLAGS;
                body.put_u16(*pid);
            }
            Packet::Subscribe(subscribe) => {
                flags = RESERVED_FLAGS;
                body.put_u16(subscribe.pid);
                for (topic, qos) in &subscribe.topics {
                    write_string(&mut body, topic)?;
                    body.put_u8(*qos as u8);
                }
            }
            Packet::SubAck(ack) => {
                body.put_u16(ack.pid);
                for qos in &ack.granted {
                    body.put_u8(*qos as u8);
                }
            }
            Packet::Unsubscribe(unsubscribe) => {
                flags = RESERVED_FLAGS;
                body.put_u16(unsubscribe.pid);
                for topic in &unsubscribe.topics {
                    write_string(&mut body, topic)?;
                }
            }
            Packet::PingReq | Packet::PingResp | Packet::Disconnect => {}
        }

        write_frame(self.kind(), flags, &body, dst)?;
        Ok(())
    }
}

fn decode_connect(mut buf: Bytes) -> std::result::Result<Connect, ProtocolViolation> {
    if buf.len() < MIN_CONNECT_LEN {
        return Err(ProtocolViolation::MalformedPacket("connect too short"));
    }
    if buf[..PROTOCOL_NAME.len()] != PROTOCOL_NAME[..] {
        return Err(ProtocolViolation::BadProtocolName);
    }
    buf.advance(PROTOCOL_NAME.len());

    let level = buf.get_u8();
    if level != PROTOCOL_LEVEL {
        return Err(ProtocolViolation::UnsupportedProtocolLevel(level));
    }
    let flags = buf.get_u8();
    if flags & 0x01 != 0 {
        return Err(ProtocolViolation::MalformedPacket("reserved connect flag set"));
    }
    let keep_alive = buf.get_u16();
    let client_id = read_string(&mut buf, "client identifier")?;

    let will = if flags & 0x04 != 0 {
        let topic = read_string(&mut buf, "will topic")?;
        let message = read_bytes(&mut buf, "will message")?;
        Some(Will {
            topic,
            message,
            qos: QoS::try_from((flags >> 3) & 0x03)?,
            retain: flags & 0x20 != 0,
        })
    } else {
        None
    };
    let username = if flags & 0x80 != 0 {
        Some(read_string(&mut buf, "username")?)
    } else {
        None
    };
    let password = if flags & 0x40 != 0 {
        Some(read_bytes(&mut buf, "password")?)
    } else {
        None
    };

    Ok(Connect {
        clean_session: flags & 0x02 != 0,
        keep_alive,
        client_id,
        will,
        username,
        password,
    })
}

fn decode_publish(flags: u8, mut buf: Bytes) -> std::result::Result<Publish, ProtocolViolation> {
    let retain = flags & 0b0001 != 0;
    let qos = QoS::try_from((flags & 0b0110) >> 1)?;
    let dup = flags & 0b1000 != 0;
    let topic = read_string(&mut buf, "publish topic")?;

    let pid = if qos == QoS::AtMostOnce {
        None
    } else {
        match read_u16(&mut buf, "publish packet id")? {
            0 => return Err(ProtocolViolation::MalformedPacket("packet id 0")),
            pid => Some(pid),
        }
    };

    Ok(Publish {
        dup,
        qos,
        retain,
        topic,
        pid,
        payload: buf,
    })
}

fn read_u8(buf: &mut Bytes, what: &'static str) -> std::result::Result<u8, ProtocolViolation> {
    if buf.remaining() < 1 {
        return Err(ProtocolViolation::MalformedPacket(what));
    }
    Ok(buf.get_u8())
}

fn read_u16(buf: &mut Bytes, what: &'static str) -> std::result::Result<u16, ProtocolViolation> {
    if buf.remaining() < 2 {
        return Err(ProtocolViolation::MalformedPacket(what));
    }
    Ok(buf.get_u16())
}

fn read_bytes(buf: &mut Bytes, what: &'static str) -> std::result::Result<Bytes, ProtocolViolation> {
    let len = read_u16(buf, what)? as usize;
    if buf.remaining() < len {
        return Err(ProtocolViolation::MalformedPacket(what));
    }
    Ok(buf.split_to(len))
}

fn read_string(buf: &mut Bytes, what: &'static str) -> std::result::Result<String, ProtocolViolation> {
    let raw = read_bytes(buf, what)?;
    String::from_utf8(raw.to_vec()).map_err(|_| ProtocolViolation::InvalidUtf8)
}

fn write_bytes(dst: &mut BytesMut, data: &[u8]) -> Result<()> {
    let len = u16::try_from(data.len())
        .map_err(|_| ProtocolViolation::MalformedPacket("field longer than 65535 bytes"))?;
    dst.put_u16(len);
    dst.put_slice(data);
    Ok(())
}

fn write_string(dst: &mut BytesMut, s: &str) -> Result<()> {
    write_bytes(dst, s.as_bytes())
}
