use std::collections::BTreeMap;
use tracing::{debug, trace};
use crate::packet::PrudpPacket;

/// sequence distance beyond which a packet is considered to lie in the past (wrap-around)
const HALF_SEQUENCE_SPACE: u16 = 0x8000;

/// Reorders the reliable packets of one substream so they are processed strictly in sequence.
///  Sequence IDs start at 2 on the client side, since 1 is consumed by the CONNECT packet.
///
/// Only packets less than `reorder_window` ahead of the next expected one are kept, which bounds
///  the memory a client can pin by withholding a single packet.
pub struct PacketDispatchQueue {
    queue: BTreeMap<u16, PrudpPacket>,
    next_expected_sequence_id: u16,
    reorder_window: u16,
}

impl PacketDispatchQueue {
    pub fn new(reorder_window: u16) -> PacketDispatchQueue {
        PacketDispatchQueue {
            queue: BTreeMap::new(),
            next_expected_sequence_id: 2,
            reorder_window: reorder_window.min(HALF_SEQUENCE_SPACE),
        }
    }

    pub fn next_expected_sequence_id(&self) -> u16 {
        self.next_expected_sequence_id
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Stores a packet for dispatch and returns whether it was kept. Retransmissions of packets
    ///  that were already dispatched are dropped, and so are packets too far ahead; the client
    ///  retransmits those. Duplicates of queued packets replace the queued copy.
    pub fn queue(&mut self, packet: PrudpPacket) -> bool {
        let distance = packet.sequence_id.wrapping_sub(self.next_expected_sequence_id);
        if distance >= HALF_SEQUENCE_SPACE {
            trace!("dropping already dispatched packet {} (next expected is {})", packet.sequence_id, self.next_expected_sequence_id);
            return false;
        }
        if distance >= self.reorder_window {
            debug!("dropping packet {} beyond the reorder window (next expected is {})", packet.sequence_id, self.next_expected_sequence_id);
            return false;
        }
        self.queue.insert(packet.sequence_id, packet);
        true
    }

    /// Takes the packet with the next expected sequence ID out of the queue, if it arrived.
    ///  The caller reports it with [PacketDispatchQueue::dispatched] once it is processed.
    pub fn get_next_to_dispatch(&mut self) -> Option<PrudpPacket> {
        self.queue.remove(&self.next_expected_sequence_id)
    }

    pub fn dispatched(&mut self, packet: &PrudpPacket) {
        if packet.sequence_id == self.next_expected_sequence_id {
            self.next_expected_sequence_id = self.next_expected_sequence_id.wrapping_add(1);
        }
    }
}
