// Numan Thabit 2025
// descriptor.rs - calendar packet descriptor

use std::sync::atomic::{AtomicU64, Ordering};

use crate::packet::{Packet, PacketId};
use crate::rank::Rank;

/// Snapshot of the packet fields the scheduler reads, plus the assigned
/// rank.
///
/// A descriptor never owns the payload; the packet pool does. It carries the
/// [`PacketId`] handle and whatever metadata the header vector exposed at
/// construction time. Everything except the rank is read-only once the
/// descriptor enters a calendar store.
#[derive(Debug)]
pub struct PacketDescriptor {
    packet_id: PacketId,
    egress_port: u32,
    packet_size: usize,
    priority: u8,
    dscp: u8,
    color: u8,
    vlan_id: u16,
    sport: u8,
    dport: u8,
    // Packed Rank; updated by the owning node before insertion and by the
    // calendar store when a collision displaces the entry.
    rank: AtomicU64,
}

impl PacketDescriptor {
    /// Extracts scheduler-visible metadata from the packet.
    ///
    /// Fields are populated from the header vector when the corresponding
    /// header exists and default to zero otherwise, mirroring the data-plane
    /// field names the pipeline publishes.
    pub fn from_packet(packet: &Packet) -> Self {
        let headers = packet.headers();
        let egress_port = headers
            .get("standard_metadata.egress_port")
            .map(|v| v as u32)
            .unwrap_or_else(|| packet.egress_port());
        let packet_size = headers
            .get("intrinsic_metadata.packet_length")
            .map(|v| v as usize)
            .unwrap_or_else(|| packet.payload_len());
        Self {
            packet_id: packet.id(),
            egress_port,
            packet_size,
            priority: headers.get("intrinsic_metadata.priority").unwrap_or(0) as u8,
            dscp: headers.get("ipv4.diffserv").unwrap_or(0) as u8,
            color: headers.get("scalars.metadata.color").unwrap_or(0) as u8,
            vlan_id: headers.get("vlan.id").unwrap_or(0) as u16,
            sport: headers.get("l4.sport").unwrap_or(0) as u8,
            dport: headers.get("l4.dport").unwrap_or(0) as u8,
            rank: AtomicU64::new(Rank::NULL.pack()),
        }
    }

    pub fn packet_id(&self) -> PacketId {
        self.packet_id
    }

    pub fn egress_port(&self) -> u32 {
        self.egress_port
    }

    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn dscp(&self) -> u8 {
        self.dscp
    }

    pub fn color(&self) -> u8 {
        self.color
    }

    pub fn vlan_id(&self) -> u16 {
        self.vlan_id
    }

    pub fn sport(&self) -> u8 {
        self.sport
    }

    pub fn dport(&self) -> u8 {
        self.dport
    }

    /// The rank currently assigned by the owning node.
    pub fn rank(&self) -> Rank {
        Rank::unpack(self.rank.load(Ordering::Acquire))
    }

    pub(crate) fn set_rank(&self, rank: Rank) {
        self.rank.store(rank.pack(), Ordering::Release);
    }

    /// Overrides the egress port stamped at enqueue time.
    pub(crate) fn with_egress_port(mut self, port: u32) -> Self {
        self.egress_port = port;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::HeaderVector;
    use bytes::Bytes;

    fn packet_with_headers() -> Packet {
        let mut headers = HeaderVector::new();
        headers
            .set("standard_metadata.egress_port", 3)
            .set("intrinsic_metadata.packet_length", 900)
            .set("intrinsic_metadata.priority", 5)
            .set("ipv4.diffserv", 46)
            .set("scalars.metadata.color", 1)
            .set("vlan.id", 100);
        Packet::new(PacketId(42), 0, Bytes::from_static(b"payload"), headers)
    }

    #[test]
    fn populates_fields_from_header_vector() {
        let desc = PacketDescriptor::from_packet(&packet_with_headers());
        assert_eq!(desc.packet_id(), PacketId(42));
        assert_eq!(desc.egress_port(), 3);
        assert_eq!(desc.packet_size(), 900);
        assert_eq!(desc.priority(), 5);
        assert_eq!(desc.dscp(), 46);
        assert_eq!(desc.color(), 1);
        assert_eq!(desc.vlan_id(), 100);
        assert_eq!(desc.sport(), 0);
    }

    #[test]
    fn missing_fields_default_to_packet_values() {
        let packet = Packet::new(
            PacketId(7),
            2,
            Bytes::from_static(b"abcdef"),
            HeaderVector::new(),
        );
        let desc = PacketDescriptor::from_packet(&packet);
        assert_eq!(desc.egress_port(), 2);
        assert_eq!(desc.packet_size(), 6);
        assert_eq!(desc.priority(), 0);
    }

    #[test]
    fn rank_starts_null_and_is_assignable() {
        let packet = Packet::new(
            PacketId(1),
            0,
            Bytes::from_static(b"x"),
            HeaderVector::new(),
        );
        let desc = PacketDescriptor::from_packet(&packet);
        assert!(desc.rank().is_null());
        desc.set_rank(Rank::new(2, 9));
        assert_eq!(desc.rank(), Rank::new(2, 9));
    }
}
