use serde::{Deserialize, Serialize};
use slotmap::new_key_type;

new_key_type! {
    /// Identifies a node (host, router, adapter, ...) in the topology.
    pub struct NodeId;

    /// Identifies an undirected link in the topology.
    pub struct LinkId;
}

/// Per-origin packet sequence number. Unique among packets originated by
/// the same host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PacketSeq(pub u64);

/// An unordered pair of adapters joined by a secure segment.
///
/// Constructed in normalized order so `AdapterPair::new(a, b)` and
/// `AdapterPair::new(b, a)` compare equal and sort identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AdapterPair {
    low: NodeId,
    high: NodeId,
}

impl AdapterPair {
    pub fn new(a: NodeId, b: NodeId) -> Self {
        if a <= b {
            Self { low: a, high: b }
        } else {
            Self { low: b, high: a }
        }
    }

    pub fn low(&self) -> NodeId {
        self.low
    }

    pub fn high(&self) -> NodeId {
        self.high
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.low == node || self.high == node
    }

    /// The other member of the pair, if `node` belongs to it.
    pub fn peer_of(&self, node: NodeId) -> Option<NodeId> {
        if node == self.low {
            Some(self.high)
        } else if node == self.high {
            Some(self.low)
        } else {
            None
        }
    }
}
