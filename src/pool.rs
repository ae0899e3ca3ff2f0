// Numan Thabit 2025
// pool.rs - bounded per-port payload store

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use ahash::AHashMap;
use tracing::warn;

use crate::packet::{Packet, PacketId};

/// Bounded multi-queue holding payloads between enqueue and emission.
///
/// Ports are sharded over `nb_workers` locks; a port is always served by
/// shard `port % nb_workers`, so the dequeue worker and the enqueue path
/// only ever contend on the shard they share. Descriptors refer to
/// payloads by [`PacketId`] handle; emission removes the payload by handle.
#[derive(Debug)]
pub struct PacketPool {
    shards: Vec<Mutex<Shard>>,
    capacity_per_port: usize,
    occupancy: AtomicUsize,
}

#[derive(Debug, Default)]
struct Shard {
    ports: AHashMap<u32, VecDeque<Packet>>,
}

impl PacketPool {
    pub fn new(nb_workers: usize, capacity_per_port: usize) -> Self {
        let nb_workers = nb_workers.max(1);
        let mut shards = Vec::with_capacity(nb_workers);
        for _ in 0..nb_workers {
            shards.push(Mutex::new(Shard::default()));
        }
        Self {
            shards,
            capacity_per_port: capacity_per_port.max(1),
            occupancy: AtomicUsize::new(0),
        }
    }

    pub fn nb_workers(&self) -> usize {
        self.shards.len()
    }

    fn shard_for(&self, port: u32) -> &Mutex<Shard> {
        &self.shards[port as usize % self.shards.len()]
    }

    /// Stores a payload for `port`. Returns `false` when the per-port
    /// capacity is exhausted; the caller decides what to do with the packet.
    pub fn push_front(&self, port: u32, packet: Packet) -> bool {
        let mut shard = match self.shard_for(port).lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let queue = shard.ports.entry(port).or_default();
        if queue.len() >= self.capacity_per_port {
            warn!(port, "packet pool full, rejecting payload");
            return false;
        }
        queue.push_front(packet);
        self.occupancy.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// Removes and returns the payload with handle `id` queued at `port`.
    pub fn take(&self, port: u32, id: PacketId) -> Option<Packet> {
        let mut shard = match self.shard_for(port).lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let queue = shard.ports.get_mut(&port)?;
        let index = queue.iter().position(|packet| packet.id() == id)?;
        let packet = queue.remove(index);
        if packet.is_some() {
            self.occupancy.fetch_sub(1, Ordering::AcqRel);
        }
        packet
    }

    /// Number of payloads currently resident across all ports.
    pub fn occupancy(&self) -> usize {
        self.occupancy.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.occupancy() == 0
    }

    /// Depth of a single port's queue.
    pub fn depth(&self, port: u32) -> usize {
        let shard = match self.shard_for(port).lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        shard.ports.get(&port).map(VecDeque::len).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::HeaderVector;
    use bytes::Bytes;

    fn packet(id: u32, port: u32) -> Packet {
        Packet::new(
            PacketId(id),
            port,
            Bytes::from_static(b"data"),
            HeaderVector::new(),
        )
    }

    #[test]
    fn take_matches_by_handle() {
        let pool = PacketPool::new(2, 8);
        assert!(pool.push_front(0, packet(1, 0)));
        assert!(pool.push_front(0, packet(2, 0)));
        assert!(pool.push_front(1, packet(3, 1)));

        let taken = pool.take(0, PacketId(2)).unwrap();
        assert_eq!(taken.id(), PacketId(2));
        assert_eq!(pool.occupancy(), 2);
        assert!(pool.take(0, PacketId(2)).is_none());
    }

    #[test]
    fn capacity_is_per_port() {
        let pool = PacketPool::new(1, 2);
        assert!(pool.push_front(0, packet(1, 0)));
        assert!(pool.push_front(0, packet(2, 0)));
        assert!(!pool.push_front(0, packet(3, 0)));
        // A different port still has room.
        assert!(pool.push_front(1, packet(4, 1)));
        assert_eq!(pool.depth(0), 2);
        assert_eq!(pool.depth(1), 1);
    }

    #[test]
    fn occupancy_tracks_residents() {
        let pool = PacketPool::new(4, 8);
        assert!(pool.is_empty());
        pool.push_front(5, packet(1, 5));
        pool.push_front(6, packet(2, 6));
        assert_eq!(pool.occupancy(), 2);
        pool.take(5, PacketId(1));
        pool.take(6, PacketId(2));
        assert!(pool.is_empty());
    }

    #[test]
    fn ports_share_shards_by_modulo() {
        let pool = PacketPool::new(2, 8);
        // Ports 0 and 2 land on shard 0, port 1 on shard 1; takes across
        // shards never interfere.
        pool.push_front(0, packet(1, 0));
        pool.push_front(2, packet(2, 2));
        pool.push_front(1, packet(3, 1));
        assert_eq!(pool.take(2, PacketId(2)).unwrap().id(), PacketId(2));
        assert_eq!(pool.take(0, PacketId(1)).unwrap().id(), PacketId(1));
        assert_eq!(pool.take(1, PacketId(3)).unwrap().id(), PacketId(3));
    }
}
