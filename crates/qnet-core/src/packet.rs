//! The classical packet envelope.

use crate::id::{NodeId, PacketSeq};
use serde::{Deserialize, Serialize};

/// A classical packet in transit.
///
/// Packets are values: forwarding and encryption produce new packets via
/// [`Packet::with_hop`] and [`Packet::with_payload`] rather than mutating in
/// place. `hops` starts as `[source]` and grows by one entry per
/// transmission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    pub source: NodeId,
    pub destination: NodeId,
    pub seq: PacketSeq,
    pub payload: Vec<u8>,
    pub hops: Vec<NodeId>,
}

impl Packet {
    pub fn new(source: NodeId, destination: NodeId, seq: PacketSeq, payload: Vec<u8>) -> Self {
        Self {
            source,
            destination,
            seq,
            payload,
            hops: vec![source],
        }
    }

    /// The node currently holding the packet.
    pub fn current(&self) -> NodeId {
        self.hops.last().copied().unwrap_or(self.source)
    }

    /// The node the packet arrived from, if it has moved at least once.
    pub fn previous(&self) -> Option<NodeId> {
        self.hops.len().checked_sub(2).map(|i| self.hops[i])
    }

    /// A copy of this packet with `next` appended to the hop list.
    pub fn with_hop(&self, next: NodeId) -> Self {
        let mut hops = self.hops.clone();
        hops.push(next);
        Self {
            hops,
            ..self.clone()
        }
    }

    /// A copy of this packet carrying a different payload.
    pub fn with_payload(&self, payload: Vec<u8>) -> Self {
        Self {
            payload,
            ..self.clone()
        }
    }

    /// Ordering key used by the scheduler: (source, seq).
    pub fn order_key(&self) -> (NodeId, PacketSeq) {
        (self.source, self.seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    fn ids() -> (NodeId, NodeId, NodeId) {
        let mut sm = SlotMap::<NodeId, ()>::with_key();
        (sm.insert(()), sm.insert(()), sm.insert(()))
    }

    #[test]
    fn new_packet_starts_at_source() {
        let (s, d, _) = ids();
        let p = Packet::new(s, d, PacketSeq(0), b"hi".to_vec());
        assert_eq!(p.hops, vec![s]);
        assert_eq!(p.current(), s);
        assert_eq!(p.previous(), None);
    }

    #[test]
    fn with_hop_leaves_original_untouched() {
        let (s, d, r) = ids();
        let p = Packet::new(s, d, PacketSeq(0), b"hi".to_vec());
        let moved = p.with_hop(r);
        assert_eq!(p.hops, vec![s]);
        assert_eq!(moved.hops, vec![s, r]);
        assert_eq!(moved.previous(), Some(s));
        assert_eq!(moved.current(), r);
    }

    #[test]
    fn with_payload_replaces_bytes_only() {
        let (s, d, _) = ids();
        let p = Packet::new(s, d, PacketSeq(3), b"hi".to_vec());
        let q = p.with_payload(vec![1, 2]);
        assert_eq!(q.payload, vec![1, 2]);
        assert_eq!(q.seq, PacketSeq(3));
        assert_eq!(p.payload, b"hi");
    }
}
