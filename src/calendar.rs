// Numan Thabit 2025
// calendar.rs - rank-ordered calendar store

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::descriptor::PacketDescriptor;
use crate::rank::Rank;

/// Ordered map from rank to in-flight packet descriptor, local to a node.
///
/// Keys are unique. The first entry is always the globally lowest-ranked
/// descriptor, and the lowest entry for a given day is reachable through a
/// range query.
#[derive(Debug, Default)]
pub struct CalendarStore {
    entries: BTreeMap<Rank, Arc<PacketDescriptor>>,
}

impl CalendarStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a descriptor at `rank`, resolving collisions deterministically.
    ///
    /// Descriptors that computed the same rank must emit in ascending
    /// packet-id order: on a collision the smaller packet id keeps the slot
    /// and the larger one moves to the next unused `time` slot on the same
    /// day, cascading until a free slot is found. Every descriptor that
    /// moves has its rank cell updated. Returns the slot the incoming
    /// descriptor finally landed on.
    pub fn insert(&mut self, desc: Arc<PacketDescriptor>, rank: Rank) -> Rank {
        let mut slot = rank;
        let mut incoming = desc;
        let mut landed = None;
        loop {
            match self.entries.remove(&slot) {
                None => {
                    incoming.set_rank(slot);
                    self.entries.insert(slot, incoming);
                    break landed.unwrap_or(slot);
                }
                Some(resident) => {
                    if incoming.packet_id() < resident.packet_id() {
                        // Incoming wins the slot; the resident cascades up.
                        incoming.set_rank(slot);
                        self.entries.insert(slot, incoming);
                        landed.get_or_insert(slot);
                        incoming = resident;
                    } else {
                        self.entries.insert(slot, resident);
                    }
                    slot = Rank::new(slot.day, slot.time.saturating_add(1));
                }
            }
        }
    }

    pub fn get(&self, rank: Rank) -> Option<&Arc<PacketDescriptor>> {
        self.entries.get(&rank)
    }

    pub fn remove(&mut self, rank: Rank) -> Option<Arc<PacketDescriptor>> {
        self.entries.remove(&rank)
    }

    /// The globally lowest-ranked descriptor.
    pub fn lowest(&self) -> Option<&Arc<PacketDescriptor>> {
        self.entries.values().next()
    }

    /// The lowest-ranked descriptor with the given day, if any.
    pub fn lowest_for_day(&self, day: u32) -> Option<&Arc<PacketDescriptor>> {
        self.entries
            .range(Rank::new(day, 0)..)
            .next()
            .filter(|(rank, _)| rank.day == day)
            .map(|(_, desc)| desc)
    }

    pub fn has_packets_for_day(&self, day: u32) -> bool {
        self.lowest_for_day(day).is_some()
    }

    /// First non-empty day in `(day, day + limit)`, exclusive on both ends;
    /// falls back to `day` when the scan finds nothing.
    pub fn find_next_non_empty_day(&self, day: u32, limit: u32) -> u32 {
        let end = day.saturating_add(limit);
        for d in day.saturating_add(1)..end {
            if self.has_packets_for_day(d) {
                return d;
            }
        }
        day
    }

    /// First non-empty day in `[day, day + limit)`; falls back to `day`.
    pub fn find_non_empty_day(&self, day: u32, limit: u32) -> u32 {
        let end = day.saturating_add(limit);
        for d in day..end {
            if self.has_packets_for_day(d) {
                return d;
            }
        }
        day
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates entries in ascending rank order.
    pub fn iter(&self) -> impl Iterator<Item = (&Rank, &Arc<PacketDescriptor>)> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{HeaderVector, Packet, PacketId};
    use bytes::Bytes;
    use proptest::prelude::*;

    fn desc(id: u32) -> Arc<PacketDescriptor> {
        let packet = Packet::new(
            PacketId(id),
            0,
            Bytes::from_static(b"p"),
            HeaderVector::new(),
        );
        Arc::new(PacketDescriptor::from_packet(&packet))
    }

    #[test]
    fn first_entry_has_minimum_rank() {
        let mut store = CalendarStore::new();
        store.insert(desc(1), Rank::new(4, 2));
        store.insert(desc(2), Rank::new(1, 9));
        store.insert(desc(3), Rank::new(4, 1));
        assert_eq!(store.lowest().unwrap().rank(), Rank::new(1, 9));
    }

    #[test]
    fn collision_orders_by_packet_id() {
        let mut store = CalendarStore::new();
        // Arrival order 3, 1, 2 all at rank (1, 1); emission order must be
        // ascending packet id.
        store.insert(desc(3), Rank::new(1, 1));
        store.insert(desc(1), Rank::new(1, 1));
        store.insert(desc(2), Rank::new(1, 1));

        let ids: Vec<u32> = store.iter().map(|(_, d)| d.packet_id().0).collect();
        assert_eq!(ids, vec![1, 2, 3]);

        // Each descriptor's rank cell follows its final slot.
        assert_eq!(store.get(Rank::new(1, 1)).unwrap().packet_id(), PacketId(1));
        assert_eq!(store.get(Rank::new(1, 2)).unwrap().packet_id(), PacketId(2));
        assert_eq!(store.get(Rank::new(1, 3)).unwrap().packet_id(), PacketId(3));
        assert_eq!(store.get(Rank::new(1, 3)).unwrap().rank(), Rank::new(1, 3));
    }

    #[test]
    fn collision_keeps_earlier_id_in_place() {
        let mut store = CalendarStore::new();
        store.insert(desc(1), Rank::new(2, 5));
        let landed = store.insert(desc(9), Rank::new(2, 5));
        assert_eq!(landed, Rank::new(2, 6));
        assert_eq!(store.get(Rank::new(2, 5)).unwrap().packet_id(), PacketId(1));
    }

    #[test]
    fn lowest_for_day_misses_cleanly() {
        let mut store = CalendarStore::new();
        store.insert(desc(1), Rank::new(2, 3));
        assert!(store.lowest_for_day(4).is_none());
        assert_eq!(
            store.lowest_for_day(2).unwrap().packet_id(),
            PacketId(1)
        );
    }

    #[test]
    fn find_next_non_empty_day_scans_forward() {
        let mut store = CalendarStore::new();
        store.insert(desc(1), Rank::new(2, 3));
        store.insert(desc(2), Rank::new(2, 5));
        store.insert(desc(3), Rank::new(5, 1));
        assert_eq!(store.find_next_non_empty_day(2, 10), 5);
    }

    #[test]
    fn find_non_empty_day_is_inclusive_and_falls_back() {
        let mut store = CalendarStore::new();
        store.insert(desc(1), Rank::new(3, 1));
        assert_eq!(store.find_non_empty_day(3, 5), 3);
        assert_eq!(store.find_non_empty_day(4, 5), 4);
        let empty = CalendarStore::new();
        assert_eq!(empty.find_non_empty_day(7, 3), 7);
    }

    proptest! {
        #[test]
        fn insertion_never_breaks_ordering(ranks in prop::collection::vec((1u32..8, 1u32..8), 1..40)) {
            let mut store = CalendarStore::new();
            for (i, (day, time)) in ranks.iter().enumerate() {
                store.insert(desc(i as u32), Rank::new(*day, *time));
            }
            prop_assert_eq!(store.len(), ranks.len());
            let keys: Vec<Rank> = store.iter().map(|(r, _)| *r).collect();
            let mut sorted = keys.clone();
            sorted.sort();
            sorted.dedup();
            prop_assert_eq!(&keys, &sorted);
            // Stored rank cells always agree with the key.
            for (rank, desc) in store.iter() {
                prop_assert_eq!(*rank, desc.rank());
            }
        }
    }
}
