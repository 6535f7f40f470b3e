use crate::fixed::{Fixed64, Ticks, is_probability};
use crate::id::*;
use serde::{Deserialize, Serialize};
use slotmap::{SecondaryMap, SlotMap};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors that can occur during topology operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TopologyError {
    #[error("node not found: {0:?}")]
    NodeNotFound(NodeId),
    #[error("link not found: {0:?}")]
    LinkNotFound(LinkId),
    #[error("a node named {0:?} already exists")]
    DuplicateName(String),
    #[error("link endpoints must be distinct nodes")]
    SelfLoop,
    #[error("{domain:?} link cannot join {a:?} and {b:?}")]
    DomainMismatch {
        domain: LinkDomain,
        a: NodeKind,
        b: NodeKind,
    },
    #[error("error probability {0} is outside [0, 1]")]
    InvalidErrorProbability(Fixed64),
    #[error("classical links carry no error probability (got {0})")]
    ClassicalNoise(Fixed64),
    #[error("link latency must be at least one tick")]
    InvalidLatency,
}

// ---------------------------------------------------------------------------
// Node and link kinds
// ---------------------------------------------------------------------------

/// The role a node plays. Behavior is derived from the capability methods
/// below rather than from the kind directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    ClassicalHost,
    ClassicalRouter,
    InternetExchange,
    QuantumHost,
    QuantumRepeater,
    QuantumAdapter,
}

impl NodeKind {
    /// Can originate and receive application data.
    pub fn is_endpoint(self) -> bool {
        matches!(self, NodeKind::ClassicalHost)
    }

    /// Can forward classical packets between two other nodes.
    pub fn forwards_classical(self) -> bool {
        matches!(
            self,
            NodeKind::ClassicalRouter | NodeKind::InternetExchange | NodeKind::QuantumAdapter
        )
    }

    /// Owns QKD sessions and encrypts/decrypts across a secure segment.
    pub fn is_bridge(self) -> bool {
        matches!(self, NodeKind::QuantumAdapter)
    }

    /// Can relay qubits along a quantum path.
    pub fn relays_qubits(self) -> bool {
        matches!(self, NodeKind::QuantumHost | NodeKind::QuantumRepeater)
    }

    /// Whether a link of `domain` may terminate at this kind of node.
    pub fn accepts(self, domain: LinkDomain) -> bool {
        match domain {
            LinkDomain::Classical => !self.relays_qubits(),
            LinkDomain::Quantum => self.relays_qubits() || self.is_bridge(),
        }
    }
}

/// Which sub-network a link belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkDomain {
    Classical,
    Quantum,
}

// ---------------------------------------------------------------------------
// Core data structures
// ---------------------------------------------------------------------------

/// Per-node data stored in the topology.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeData {
    /// Unique display name.
    pub name: String,
    pub kind: NodeKind,
    /// Free-form address (IP-like for classical nodes).
    pub address: String,
}

/// Parameters supplied when creating a link.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinkSpec {
    pub domain: LinkDomain,
    /// Per-qubit bit-flip probability. Must be zero on classical links.
    pub error_probability: Fixed64,
    /// Ticks a packet spends on the link. At least 1.
    pub latency: Ticks,
}

impl LinkSpec {
    pub fn classical() -> Self {
        Self {
            domain: LinkDomain::Classical,
            error_probability: Fixed64::ZERO,
            latency: 1,
        }
    }

    pub fn quantum(error_probability: Fixed64) -> Self {
        Self {
            domain: LinkDomain::Quantum,
            error_probability,
            latency: 1,
        }
    }

    pub fn with_latency(mut self, latency: Ticks) -> Self {
        self.latency = latency;
        self
    }
}

/// Per-link data stored in the topology. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkData {
    pub a: NodeId,
    pub b: NodeId,
    pub domain: LinkDomain,
    pub error_probability: Fixed64,
    pub latency: Ticks,
}

impl LinkData {
    /// The endpoint opposite `node`, if `node` is an endpoint.
    pub fn other(&self, node: NodeId) -> Option<NodeId> {
        if node == self.a {
            Some(self.b)
        } else if node == self.b {
            Some(self.a)
        } else {
            None
        }
    }

    pub fn connects(&self, x: NodeId, y: NodeId) -> bool {
        (self.a == x && self.b == y) || (self.a == y && self.b == x)
    }
}

// ---------------------------------------------------------------------------
// Topology
// ---------------------------------------------------------------------------

/// The network graph: nodes, undirected links and per-node adjacency.
///
/// Every mutation bumps [`Topology::revision`], which routing caches use
/// to detect staleness.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Topology {
    nodes: SlotMap<NodeId, NodeData>,
    links: SlotMap<LinkId, LinkData>,
    adjacency: SecondaryMap<NodeId, Vec<LinkId>>,
    names: BTreeMap<String, NodeId>,
    revision: u64,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    // -----------------------------------------------------------------------
    // Mutation
    // -----------------------------------------------------------------------

    /// Add a node. Names must be unique.
    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        kind: NodeKind,
        address: impl Into<String>,
    ) -> Result<NodeId, TopologyError> {
        let name = name.into();
        if self.names.contains_key(&name) {
            return Err(TopologyError::DuplicateName(name));
        }
        let id = self.nodes.insert(NodeData {
            name: name.clone(),
            kind,
            address: address.into(),
        });
        self.adjacency.insert(id, Vec::new());
        self.names.insert(name, id);
        self.revision += 1;
        Ok(id)
    }

    /// Remove a node and every link touching it. Returns the removed links
    /// in ascending id order.
    pub fn remove_node(&mut self, node: NodeId) -> Result<Vec<(LinkId, LinkData)>, TopologyError> {
        if !self.nodes.contains_key(node) {
            return Err(TopologyError::NodeNotFound(node));
        }
        let mut touching = self.adjacency.get(node).cloned().unwrap_or_default();
        touching.sort();
        let mut removed = Vec::with_capacity(touching.len());
        for link in touching {
            removed.push((link, self.remove_link(link)?));
        }
        if let Some(data) = self.nodes.remove(node) {
            self.names.remove(&data.name);
        }
        self.adjacency.remove(node);
        self.revision += 1;
        Ok(removed)
    }

    /// Add an undirected link after validating both endpoints against the
    /// link's domain.
    ///
    /// Classical links join classical nodes or adapters; quantum links join
    /// quantum nodes or adapters but never two adapters directly.
    pub fn add_link(&mut self, x: NodeId, y: NodeId, spec: LinkSpec) -> Result<LinkId, TopologyError> {
        let kx = self.node(x).ok_or(TopologyError::NodeNotFound(x))?.kind;
        let ky = self.node(y).ok_or(TopologyError::NodeNotFound(y))?.kind;
        if x == y {
            return Err(TopologyError::SelfLoop);
        }
        let mismatch = TopologyError::DomainMismatch {
            domain: spec.domain,
            a: kx,
            b: ky,
        };
        if !kx.accepts(spec.domain) || !ky.accepts(spec.domain) {
            return Err(mismatch);
        }
        if spec.domain == LinkDomain::Quantum && kx.is_bridge() && ky.is_bridge() {
            return Err(mismatch);
        }
        if !is_probability(spec.error_probability) {
            return Err(TopologyError::InvalidErrorProbability(spec.error_probability));
        }
        if spec.domain == LinkDomain::Classical && spec.error_probability != Fixed64::ZERO {
            return Err(TopologyError::ClassicalNoise(spec.error_probability));
        }
        if spec.latency == 0 {
            return Err(TopologyError::InvalidLatency);
        }

        let id = self.links.insert(LinkData {
            a: x,
            b: y,
            domain: spec.domain,
            error_probability: spec.error_probability,
            latency: spec.latency,
        });
        for end in [x, y] {
            if let Some(adj) = self.adjacency.get_mut(end) {
                adj.push(id);
            }
        }
        self.revision += 1;
        Ok(id)
    }

    /// Remove a link, returning its data.
    pub fn remove_link(&mut self, link: LinkId) -> Result<LinkData, TopologyError> {
        let data = self
            .links
            .remove(link)
            .ok_or(TopologyError::LinkNotFound(link))?;
        for end in [data.a, data.b] {
            if let Some(adj) = self.adjacency.get_mut(end) {
                adj.retain(|&l| l != link);
            }
        }
        self.revision += 1;
        Ok(data)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn node(&self, node: NodeId) -> Option<&NodeData> {
        self.nodes.get(node)
    }

    pub fn link(&self, link: LinkId) -> Option<&LinkData> {
        self.links.get(link)
    }

    pub fn kind(&self, node: NodeId) -> Option<NodeKind> {
        self.nodes.get(node).map(|n| n.kind)
    }

    pub fn name(&self, node: NodeId) -> Option<&str> {
        self.nodes.get(node).map(|n| n.name.as_str())
    }

    /// Look up a node by its unique name.
    pub fn find_node(&self, name: &str) -> Option<NodeId> {
        self.names.get(name).copied()
    }

    pub fn contains_node(&self, node: NodeId) -> bool {
        self.nodes.contains_key(node)
    }

    pub fn contains_link(&self, link: LinkId) -> bool {
        self.links.contains_key(link)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Monotonic counter bumped on every mutation.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Node ids in ascending order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.nodes.keys().collect();
        ids.sort();
        ids
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &NodeData)> {
        self.nodes.iter()
    }

    pub fn links(&self) -> impl Iterator<Item = (LinkId, &LinkData)> {
        self.links.iter()
    }

    /// Links touching `node`, in insertion order.
    pub fn links_of(&self, node: NodeId) -> &[LinkId] {
        self.adjacency.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Neighbours of `node` reachable over links of `domain`, sorted by
    /// (neighbour id, link id).
    pub fn neighbors(&self, node: NodeId, domain: LinkDomain) -> Vec<(NodeId, LinkId)> {
        let mut out: Vec<(NodeId, LinkId)> = self
            .links_of(node)
            .iter()
            .filter_map(|&l| {
                let data = self.links.get(l)?;
                if data.domain != domain {
                    return None;
                }
                Some((data.other(node)?, l))
            })
            .collect();
        out.sort();
        out
    }

    /// The lowest-id link of `domain` joining `x` and `y`.
    pub fn link_between(&self, x: NodeId, y: NodeId, domain: LinkDomain) -> Option<LinkId> {
        self.links_of(x)
            .iter()
            .copied()
            .filter(|&l| {
                self.links
                    .get(l)
                    .is_some_and(|d| d.domain == domain && d.connects(x, y))
            })
            .min()
    }

    /// Whether `x` and `y` are adapters joined by a classical link.
    pub fn is_secure_segment(&self, x: NodeId, y: NodeId) -> bool {
        let both_bridges = matches!(
            (self.kind(x), self.kind(y)),
            (Some(kx), Some(ky)) if kx.is_bridge() && ky.is_bridge()
        );
        both_bridges && self.link_between(x, y, LinkDomain::Classical).is_some()
    }

    /// Every adapter pair joined by a secure segment, in ascending order.
    pub fn adapter_pairs(&self) -> Vec<AdapterPair> {
        let mut pairs: Vec<AdapterPair> = self
            .links
            .values()
            .filter(|d| d.domain == LinkDomain::Classical && self.is_secure_segment(d.a, d.b))
            .map(|d| AdapterPair::new(d.a, d.b))
            .collect();
        pairs.sort();
        pairs.dedup();
        pairs
    }
}

// ===========================================================================
// Tests
// ===========================================================================
