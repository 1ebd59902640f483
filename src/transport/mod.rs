//! The `transport` module is responsible for the MQTT wire protocol and the
//! network listener.
//!
//! - `codec`: fixed-header framing and the remaining-length varint
//! - `packet`: typed packets and their payload layouts
//! - `listener`: the TCP accept loop

pub mod codec;
pub mod listener;
pub mod packet;

pub use codec::{Frame, MqttCodec, PacketKind};
pub use listener::{run, serve};
pub use packet::{Packet, QoS};
