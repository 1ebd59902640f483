//! Per-connection QoS bookkeeping
//!
//! `PacketIdPool` hands out 16-bit packet identifiers, always the smallest
//! one not currently in use. `DeliveryState` tracks what a connection has in
//! flight: outbound QoS 1/2 publishes awaiting acknowledgment (and the PUBREL
//! that replaces a QoS 2 entry once PUBREC arrives), plus the inbound QoS 2
//! identifiers seen but not yet released.

use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::broker::message::PendingMessage;
use crate::transport::packet::{Packet, Publish, QoS};
use crate::utils::error::ProtocolViolation;

const WORDS: usize = 65536 / 64;

/// Bitmap over identifiers 0..=65535. Bit 0 is permanently set: 0 is never
/// a valid packet identifier.
pub struct PacketIdPool {
    bits: Box<[u64]>,
    in_use: usize,
    // no free bit exists in any word below this index
    search_from: usize,
}

impl Default for PacketIdPool {
    fn default() -> Self {
        let mut bits = vec![0u64; WORDS].into_boxed_slice();
        bits[0] = 1;
        Self {
            bits,
            in_use: 0,
            search_from: 0,
        }
    }
}

impl fmt::Debug for PacketIdPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketIdPool")
            .field("in_use", &self.in_use)
            .finish()
    }
}

impl PacketIdPool {
    pub fn allocate(&mut self) -> Result<u16, ProtocolViolation> {
        for index in self.search_from..WORDS {
            let word = self.bits[index];
            if word != u64::MAX {
                let bit = word.trailing_ones() as usize;
                self.bits[index] |= 1 << bit;
                self.in_use += 1;
                self.search_from = index;
                return Ok((index * 64 + bit) as u16);
            }
        }
        Err(ProtocolViolation::PacketIdsExhausted)
    }

    /// Returns false if `pid` was not allocated.
    pub fn release(&mut self, pid: u16) -> bool {
        if pid == 0 || !self.contains(pid) {
            return false;
        }
        let index = pid as usize / 64;
        self.bits[index] &= !(1 << (pid as usize % 64));
        self.in_use -= 1;
        self.search_from = self.search_from.min(index);
        true
    }

    pub fn contains(&self, pid: u16) -> bool {
        pid != 0 && self.bits[pid as usize / 64] & (1 << (pid as usize % 64)) != 0
    }

    pub fn in_use(&self) -> usize {
        self.in_use
    }
}

#[derive(Debug, Default)]
pub struct DeliveryState {
    pids: PacketIdPool,
    unacked: HashMap<u16, Packet>,
    seen_exactly_once: HashSet<u16>,
}

impl DeliveryState {
    /// Build the PUBLISH sent to a subscriber at `qos`.
    ///
    /// For QoS 1 and 2 an identifier is allocated and the packet recorded as
    /// unacknowledged before it is handed back for writing.
    pub fn prepare_publish(
        &mut self,
        message: &PendingMessage,
        qos: QoS,
    ) -> Result<Packet, ProtocolViolation> {
        let pid = match qos {
            QoS::AtMostOnce => None,
            QoS::AtLeastOnce | QoS::ExactlyOnce => Some(self.pids.allocate()?),
        };
        let packet = Packet::Publish(Publish::new(
            message.topic.clone(),
            qos,
            pid,
            message.payload.clone(),
        ));
        if let Some(pid) = pid {
            self.unacked.insert(pid, packet.clone());
        }
        Ok(packet)
    }

    /// Record an inbound QoS 2 identifier. Returns true the first time it is
    /// seen, false for a retransmission that must not be forwarded again.
    pub fn accept_exactly_once(&mut self, pid: u16) -> bool {
        self.seen_exactly_once.insert(pid)
    }

    /// Forget an inbound QoS 2 identifier on PUBREL. Returns whether it was known.
    pub fn release_exactly_once(&mut self, pid: u16) -> bool {
        self.seen_exactly_once.remove(&pid)
    }

    pub fn on_puback(&mut self, pid: u16) -> Result<(), ProtocolViolation> {
        match self.unacked.get(&pid) {
            Some(Packet::Publish(publish)) if publish.qos == QoS::AtLeastOnce => {
                self.finish(pid);
                Ok(())
            }
            _ => Err(ProtocolViolation::UnknownPacketId(pid)),
        }
    }

    /// Swap the in-flight QoS 2 PUBLISH for the PUBREL answering it. A
    /// repeated PUBREC finds the PUBREL already in place and resends it.
    pub fn on_pubrec(&mut self, pid: u16) -> Result<Packet, ProtocolViolation> {
        let Some(entry) = self.unacked.get_mut(&pid) else {
            return Err(ProtocolViolation::UnknownPacketId(pid));
        };
        let awaiting_rec = match entry {
            Packet::Publish(publish) => publish.qos == QoS::ExactlyOnce,
            Packet::PubRel(_) => true,
            _ => false,
        };
        if !awaiting_rec {
            return Err(ProtocolViolation::UnknownPacketId(pid));
        }
        *entry = Packet::PubRel(pid);
        Ok(Packet::PubRel(pid))
    }

    pub fn on_pubcomp(&mut self, pid: u16) -> Result<(), ProtocolViolation> {
        match self.unacked.get(&pid) {
            Some(Packet::PubRel(_)) => {
                self.finish(pid);
                Ok(())
            }
            _ => Err(ProtocolViolation::UnknownPacketId(pid)),
        }
    }

    fn finish(&mut self, pid: u16) {
        self.unacked.remove(&pid);
        self.pids.release(pid);
    }

    pub fn unacked(&self, pid: u16) -> Option<&Packet> {
        self.unacked.get(&pid)
    }

    pub fn in_flight(&self) -> usize {
        self.unacked.len()
    }

    pub fn pids(&self) -> &PacketIdPool {
        &self.pids
    }
}
