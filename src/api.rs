// Public surface shared with the enclosing switch.
// Numan Thabit 2025

use std::sync::Arc;

use crate::descriptor::PacketDescriptor;
use crate::packet::Packet;

/// Kind of work item moving between nodes and the traffic manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// A descriptor entering a node's calendar store.
    Enqueue,
    /// An eligible descriptor leaving a root node towards the egress path.
    Dequeue,
}

/// Work item carrying a descriptor through the hierarchy.
///
/// Tasks are moved, never shared; the descriptor itself is reference
/// counted because it may sit in a calendar store while a task referencing
/// it is in flight.
#[derive(Debug)]
pub struct Task {
    pub kind: TaskKind,
    pub descriptor: Arc<PacketDescriptor>,
    /// Node the task originated at (Dequeue) or is destined for (Enqueue).
    pub node_id: u32,
    pub transmitted: bool,
}

impl Task {
    pub fn enqueue(descriptor: Arc<PacketDescriptor>, node_id: u32) -> Self {
        Self {
            kind: TaskKind::Enqueue,
            descriptor,
            node_id,
            transmitted: false,
        }
    }

    pub fn dequeue(descriptor: Arc<PacketDescriptor>, node_id: u32) -> Self {
        Self {
            kind: TaskKind::Dequeue,
            descriptor,
            node_id,
            transmitted: false,
        }
    }
}

/// Per-egress-port output buffer owned by the enclosing switch.
///
/// The traffic manager pushes each emitted payload to the buffer indexed by
/// the packet's egress port; ordering within a port follows the order the
/// dequeue worker processed the matching tasks.
pub trait EgressSink: Send + Sync + 'static {
    fn push_front(&self, queue_id: u32, packet: Packet);
}
