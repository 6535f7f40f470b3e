//! Route computation over the classical and quantum sub-networks.
//!
//! Classical routes are per-destination shortest-path trees. Cost is
//! lexicographic `(secure segments crossed, hops)`, so a purely classical
//! route always wins over one that needs a QKD-secured hop. Hosts terminate
//! routes but never carry transit traffic. Ties resolve to the lowest
//! neighbour id, which makes every route deterministic.

use crate::id::{LinkId, NodeId};
use crate::topology::{LinkDomain, Topology};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, VecDeque};
use std::ops::Add;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoutingError {
    #[error("node not found: {0:?}")]
    NodeNotFound(NodeId),
    #[error("no route from {from:?} to {to:?}")]
    NoRouteFound { from: NodeId, to: NodeId },
    #[error("{at:?} has no next hop towards {destination:?}")]
    UnreachableDestination { at: NodeId, destination: NodeId },
}

// ---------------------------------------------------------------------------
// Route cost
// ---------------------------------------------------------------------------

/// Lexicographic route cost.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RouteCost {
    pub secure_segments: u32,
    pub hops: u32,
}

impl RouteCost {
    fn step(secure: bool) -> Self {
        Self {
            secure_segments: secure as u32,
            hops: 1,
        }
    }
}

impl Add for RouteCost {
    type Output = RouteCost;

    fn add(self, rhs: RouteCost) -> RouteCost {
        RouteCost {
            secure_segments: self.secure_segments + rhs.secure_segments,
            hops: self.hops + rhs.hops,
        }
    }
}

// ---------------------------------------------------------------------------
// Route tree
// ---------------------------------------------------------------------------

/// Shortest-path tree rooted at a single destination. Gives every node that
/// can reach the destination its cost and next hop.
#[derive(Debug, Clone)]
pub struct RouteTree {
    destination: NodeId,
    cost: BTreeMap<NodeId, RouteCost>,
    next_hop: BTreeMap<NodeId, NodeId>,
}

/// Whether packets for `destination` may pass through `node`.
fn carries_transit(topology: &Topology, node: NodeId, destination: NodeId) -> bool {
    node == destination || topology.kind(node).is_some_and(|k| k.forwards_classical())
}

fn crosses_secure_segment(topology: &Topology, x: NodeId, y: NodeId) -> bool {
    matches!(
        (topology.kind(x), topology.kind(y)),
        (Some(kx), Some(ky)) if kx.is_bridge() && ky.is_bridge()
    )
}

impl RouteTree {
    /// Build the tree for `destination` with Dijkstra over classical links.
    pub fn build(topology: &Topology, destination: NodeId) -> Result<Self, RoutingError> {
        if !topology.contains_node(destination) {
            return Err(RoutingError::NodeNotFound(destination));
        }

        let mut cost: BTreeMap<NodeId, RouteCost> = BTreeMap::new();
        let mut settled: BTreeSet<NodeId> = BTreeSet::new();
        let mut heap = BinaryHeap::new();
        cost.insert(destination, RouteCost::default());
        heap.push(Reverse((RouteCost::default(), destination)));

        while let Some(Reverse((c, v))) = heap.pop() {
            if !settled.insert(v) {
                continue;
            }
            if !carries_transit(topology, v, destination) {
                continue;
            }
            for (u, _) in topology.neighbors(v, LinkDomain::Classical) {
                let candidate = c + RouteCost::step(crosses_secure_segment(topology, u, v));
                if cost.get(&u).is_none_or(|&old| candidate < old) {
                    cost.insert(u, candidate);
                    heap.push(Reverse((candidate, u)));
                }
            }
        }

        let mut next_hop = BTreeMap::new();
        for (&u, &cu) in &cost {
            if u == destination {
                continue;
            }
            let chosen = topology
                .neighbors(u, LinkDomain::Classical)
                .into_iter()
                .map(|(v, _)| v)
                .find(|&v| {
                    carries_transit(topology, v, destination)
                        && cost.get(&v).is_some_and(|&cv| {
                            cv + RouteCost::step(crosses_secure_segment(topology, u, v)) == cu
                        })
                });
            if let Some(v) = chosen {
                next_hop.insert(u, v);
            }
        }

        Ok(Self {
            destination,
            cost,
            next_hop,
        })
    }

    pub fn destination(&self) -> NodeId {
        self.destination
    }

    pub fn next_hop(&self, at: NodeId) -> Option<NodeId> {
        self.next_hop.get(&at).copied()
    }

    pub fn cost(&self, at: NodeId) -> Option<RouteCost> {
        self.cost.get(&at).copied()
    }

    /// Follow next hops from `from` to the destination.
    pub fn path_from(&self, from: NodeId) -> Result<Vec<NodeId>, RoutingError> {
        let no_route = RoutingError::NoRouteFound {
            from,
            to: self.destination,
        };
        let mut path = vec![from];
        let mut at = from;
        while at != self.destination {
            at = self.next_hop(at).ok_or_else(|| no_route.clone())?;
            path.push(at);
            if path.len() > self.cost.len() {
                return Err(no_route);
            }
        }
        Ok(path)
    }
}

/// Uncached route computation.
pub fn compute_path(topology: &Topology, from: NodeId, to: NodeId) -> Result<Vec<NodeId>, RoutingError> {
    if !topology.contains_node(from) {
        return Err(RoutingError::NodeNotFound(from));
    }
    RouteTree::build(topology, to)?.path_from(from)
}

// ---------------------------------------------------------------------------
// Routing table (cached trees)
// ---------------------------------------------------------------------------

/// Per-destination route trees, rebuilt lazily whenever the topology
/// revision moves.
#[derive(Debug, Default)]
pub struct RoutingTable {
    revision: Option<u64>,
    trees: BTreeMap<NodeId, RouteTree>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every cached tree.
    pub fn invalidate(&mut self) {
        self.trees.clear();
        self.revision = None;
    }

    /// Number of destinations with a cached tree.
    pub fn cached_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn tree(&mut self, topology: &Topology, destination: NodeId) -> Result<&RouteTree, RoutingError> {
        if self.revision != Some(topology.revision()) {
            self.trees.clear();
            self.revision = Some(topology.revision());
        }
        if !self.trees.contains_key(&destination) {
            let tree = RouteTree::build(topology, destination)?;
            self.trees.insert(destination, tree);
        }
        self.trees
            .get(&destination)
            .ok_or(RoutingError::NodeNotFound(destination))
    }

    /// The neighbour `at` should forward to for `destination`.
    pub fn next_hop(&mut self, topology: &Topology, at: NodeId, destination: NodeId) -> Result<NodeId, RoutingError> {
        self.tree(topology, destination)?
            .next_hop(at)
            .ok_or(RoutingError::UnreachableDestination { at, destination })
    }

    pub fn compute_path(&mut self, topology: &Topology, from: NodeId, to: NodeId) -> Result<Vec<NodeId>, RoutingError> {
        if !topology.contains_node(from) {
            return Err(RoutingError::NodeNotFound(from));
        }
        self.tree(topology, to)?.path_from(from)
    }
}

// ---------------------------------------------------------------------------
// Quantum paths
// ---------------------------------------------------------------------------

/// The qubit path between two adapters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuantumPath {
    pub nodes: Vec<NodeId>,
    pub links: Vec<LinkId>,
}

/// Fewest-hop path over quantum links from adapter `from` to adapter `to`,
/// transiting only quantum hosts and repeaters.
pub fn quantum_path(topology: &Topology, from: NodeId, to: NodeId) -> Result<QuantumPath, RoutingError> {
    for n in [from, to] {
        if !topology.contains_node(n) {
            return Err(RoutingError::NodeNotFound(n));
        }
    }

    let mut parent: BTreeMap<NodeId, (NodeId, LinkId)> = BTreeMap::new();
    let mut seen: BTreeSet<NodeId> = BTreeSet::from([from]);
    let mut queue = VecDeque::from([from]);

    while let Some(v) = queue.pop_front() {
        if v == to {
            break;
        }
        let transit = v == from || topology.kind(v).is_some_and(|k| k.relays_qubits());
        if !transit {
            continue;
        }
        for (u, link) in topology.neighbors(v, LinkDomain::Quantum) {
            if seen.insert(u) {
                parent.insert(u, (v, link));
                queue.push_back(u);
            }
        }
    }

    if from == to || !parent.contains_key(&to) {
        return Err(RoutingError::NoRouteFound { from, to });
    }

    let mut nodes = vec![to];
    let mut links = Vec::new();
    let mut at = to;
    while let Some(&(prev, link)) = parent.get(&at) {
        links.push(link);
        nodes.push(prev);
        at = prev;
    }
    nodes.reverse();
    links.reverse();
    Ok(QuantumPath { nodes, links })
}

// ===========================================================================
// Tests
// ===========================================================================
