//! Shared test helpers for unit tests, integration tests and benchmarks.
//!
//! Gated behind `#[cfg(any(test, feature = "test-utils"))]`.

use crate::engine::{Engine, EngineConfig};
use crate::fixed::Fixed64;
use crate::id::{LinkId, NodeId};
use crate::topology::{LinkSpec, NodeKind, Topology};

pub fn fixed(v: f64) -> Fixed64 {
    Fixed64::from_num(v)
}

// ===========================================================================
// Reference hybrid network
// ===========================================================================

/// Handles into the reference network:
///
/// ```text
/// H1 -- R1 -- A1 ====== A2 -- R2 -- H2      (classical, A1==A2 secure)
///             A1 ~ QH1 ~ QH2 ~ A2            (quantum)
/// ```
#[derive(Debug, Clone, Copy)]
pub struct HybridNet {
    pub h1: NodeId,
    pub r1: NodeId,
    pub a1: NodeId,
    pub qh1: NodeId,
    pub qh2: NodeId,
    pub a2: NodeId,
    pub r2: NodeId,
    pub h2: NodeId,
    pub h1_r1: LinkId,
    pub r1_a1: LinkId,
    pub a1_a2: LinkId,
    pub a2_r2: LinkId,
    pub r2_h2: LinkId,
    pub a1_qh1: LinkId,
    pub qh1_qh2: LinkId,
    pub qh2_a2: LinkId,
}

/// Build the reference network directly into a [`Topology`]. `noise` is the
/// error probability of the QH1~QH2 link; the other quantum links are
/// noiseless.
pub fn hybrid_topology(noise: Fixed64) -> (Topology, HybridNet) {
    let mut t = Topology::new();
    let mut node = |name: &str, kind, address: &str| {
        t.add_node(name, kind, address).expect("valid node")
    };
    let h1 = node("H1", NodeKind::ClassicalHost, "10.0.0.1");
    let r1 = node("R1", NodeKind::ClassicalRouter, "10.0.0.254");
    let a1 = node("A1", NodeKind::QuantumAdapter, "10.0.1.1");
    let qh1 = node("QH1", NodeKind::QuantumHost, "q1");
    let qh2 = node("QH2", NodeKind::QuantumHost, "q2");
    let a2 = node("A2", NodeKind::QuantumAdapter, "10.0.1.2");
    let r2 = node("R2", NodeKind::ClassicalRouter, "10.0.2.254");
    let h2 = node("H2", NodeKind::ClassicalHost, "10.0.2.1");

    let mut link = |a, b, spec| t.add_link(a, b, spec).expect("valid link");
    let h1_r1 = link(h1, r1, LinkSpec::classical());
    let r1_a1 = link(r1, a1, LinkSpec::classical());
    let a1_a2 = link(a1, a2, LinkSpec::classical());
    let a2_r2 = link(a2, r2, LinkSpec::classical());
    let r2_h2 = link(r2, h2, LinkSpec::classical());
    let a1_qh1 = link(a1, qh1, LinkSpec::quantum(Fixed64::ZERO));
    let qh1_qh2 = link(qh1, qh2, LinkSpec::quantum(noise));
    let qh2_a2 = link(qh2, a2, LinkSpec::quantum(Fixed64::ZERO));

    (
        t,
        HybridNet {
            h1,
            r1,
            a1,
            qh1,
            qh2,
            a2,
            r2,
            h2,
            h1_r1,
            r1_a1,
            a1_a2,
            a2_r2,
            r2_h2,
            a1_qh1,
            qh1_qh2,
            qh2_a2,
        },
    )
}

/// An engine over the noiseless reference network, stopped, with no
/// buffered events.
pub fn hybrid_engine(config: EngineConfig) -> (Engine, HybridNet) {
    hybrid_engine_with_noise(config, Fixed64::ZERO)
}

pub fn hybrid_engine_with_noise(config: EngineConfig, noise: Fixed64) -> (Engine, HybridNet) {
    let (topology, net) = hybrid_topology(noise);
    let engine = Engine::with_topology(topology, config).expect("valid engine config");
    (engine, net)
}

/// A chain of `len` routers between two hosts. Returns (engine, first host,
/// last host).
pub fn router_chain(len: usize) -> (Engine, NodeId, NodeId) {
    let mut engine = Engine::new(EngineConfig::default()).expect("default config");
    let first = engine
        .add_node("H0", NodeKind::ClassicalHost, "")
        .expect("valid node");
    let mut prev = first;
    for i in 0..len {
        let r = engine
            .add_node(format!("R{i}"), NodeKind::ClassicalRouter, "")
            .expect("valid node");
        engine
            .add_link(prev, r, LinkSpec::classical())
            .expect("valid link");
        prev = r;
    }
    let last = engine
        .add_node("H1", NodeKind::ClassicalHost, "")
        .expect("valid node");
    engine
        .add_link(prev, last, LinkSpec::classical())
        .expect("valid link");
    engine.drain_events();
    (engine, first, last)
}
