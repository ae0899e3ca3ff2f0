// Numan Thabit 2025
// packet.rs - pool-owned payload and header-vector view

use std::fmt;

use ahash::AHashMap;
use bytes::Bytes;

/// Identifier assigned to a packet by the enclosing switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PacketId(pub u32);

impl From<u32> for PacketId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl fmt::Display for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Flat view over the parsed header fields of a packet.
///
/// The full header-vector representation belongs to the switch pipeline; the
/// scheduler only ever asks whether a named field exists and what its
/// numeric value is.
#[derive(Debug, Clone, Default)]
pub struct HeaderVector {
    fields: AHashMap<String, u64>,
}

impl HeaderVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a named field, replacing any previous value.
    pub fn set(&mut self, name: impl Into<String>, value: u64) -> &mut Self {
        self.fields.insert(name.into(), value);
        self
    }

    /// Returns the field value when the header exists.
    pub fn get(&self, name: &str) -> Option<u64> {
        self.fields.get(name).copied()
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }
}

/// A packet handed to the traffic manager.
///
/// The payload is owned by the packet pool for the whole traversal;
/// descriptors refer back to it through the [`PacketId`] handle only.
#[derive(Debug, Clone)]
pub struct Packet {
    id: PacketId,
    egress_port: u32,
    payload: Bytes,
    headers: HeaderVector,
}

impl Packet {
    pub fn new(id: PacketId, egress_port: u32, payload: Bytes, headers: HeaderVector) -> Self {
        Self {
            id,
            egress_port,
            payload,
            headers,
        }
    }

    pub fn id(&self) -> PacketId {
        self.id
    }

    pub fn egress_port(&self) -> u32 {
        self.egress_port
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    pub fn headers(&self) -> &HeaderVector {
        &self.headers
    }
}
