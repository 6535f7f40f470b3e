//! Integration test: hybrid network driven through scene data.
//!
//! Builds the reference hybrid network from an inline scene, runs it to
//! completion and checks what each layer saw: classical hops, the BB84
//! exchange between the adapters, and the encrypted segment between them.

use std::path::Path;

use qnet_core::event::{DropReason, EventKind, EventPayload, SimEvent, TraceSummary};
use qnet_core::engine::EngineConfig;
use qnet_core::test_utils::hybrid_engine;
use qnet_scene::{SceneData, SceneFormat, build_scene_data};

const HYBRID: &str = r#"(
    title: "inline hybrid",
    nodes: [
        (id: "H1", kind: classical_host),
        (id: "R1", kind: classical_router),
        (id: "A1", kind: quantum_adapter),
        (id: "QH1", kind: quantum_host),
        (id: "QH2", kind: quantum_host),
        (id: "A2", kind: quantum_adapter),
        (id: "R2", kind: classical_router),
        (id: "H2", kind: classical_host),
    ],
    links: [
        (a: "H1", b: "R1", domain: classical),
        (a: "R1", b: "A1", domain: classical),
        (a: "A1", b: "A2", domain: classical),
        (a: "A2", b: "R2", domain: classical),
        (a: "R2", b: "H2", domain: classical),
        (a: "A1", b: "QH1", domain: quantum),
        (a: "QH1", b: "QH2", domain: quantum),
        (a: "QH2", b: "A2", domain: quantum),
    ],
    simulation: (seed: 42, tick_limit: 100),
    messages: [
        (tick: 0, from: "H1", to: "H2", data: "hello"),
        (tick: 30, from: "H2", to: "H1", data: "reply"),
    ],
)"#;

fn run_inline() -> (Vec<SimEvent>, u64) {
    let data = SceneData::parse(HYBRID, SceneFormat::Ron, Path::new("inline.ron")).unwrap();
    let mut scene = build_scene_data(data).unwrap();
    let events = scene.run_to_completion().unwrap();
    assert!(scene.is_finished());
    (events, scene.engine.trace_hash())
}

fn names_for(events: &[SimEvent], kind: EventKind) -> Vec<String> {
    events
        .iter()
        .filter(|e| e.kind() == kind)
        .filter_map(|e| e.node_name.clone())
        .collect()
}

#[test]
fn both_directions_share_one_key() {
    let (events, _) = run_inline();
    let summary = TraceSummary::from_events(&events);
    assert_eq!(summary.delivered, 2);
    assert_eq!(summary.dropped, 0);
    assert_eq!(summary.keys_established, 1);
    assert_eq!(names_for(&events, EventKind::QkdInitiated), vec!["A1"]);
}

#[test]
fn only_secure_segment_carries_ciphertext() {
    let (events, _) = run_inline();
    let mut ciphertext_hops = 0;
    for event in &events {
        if let EventPayload::PacketTransmitted { packet, .. } = &event.payload {
            let from = event.node_name.as_deref().unwrap_or_default();
            let plaintext = packet.payload == b"hello" || packet.payload == b"reply";
            if !plaintext {
                assert!(from == "A1" || from == "A2", "ciphertext left the secure segment at {from}");
                ciphertext_hops += 1;
            }
        }
    }
    // One crossing in each direction.
    assert_eq!(ciphertext_hops, 2);
}

#[test]
fn every_hop_reports_reception() {
    let (events, _) = run_inline();
    let received = names_for(&events, EventKind::PacketReceived);
    assert_eq!(
        received,
        vec!["R1", "A1", "A2", "R2", "H2", "R2", "A2", "A1", "R1", "H1"]
    );
    assert_eq!(names_for(&events, EventKind::DataReceived), vec!["H2", "H1"]);
}

#[test]
fn inline_scene_is_deterministic() {
    assert_eq!(run_inline().1, run_inline().1);
}

// ---------------------------------------------------------------------------
// Topology changes while traffic is in flight
// ---------------------------------------------------------------------------

#[test]
fn losing_secure_segment_mid_flight_drops_without_halting() {
    let (mut engine, net) = hybrid_engine(EngineConfig::default());
    engine.start();
    engine.send_message(net.h1, net.h2, b"hi".to_vec()).unwrap();
    for _ in 0..5 {
        engine.step();
    }
    engine.remove_link(net.a1_a2).unwrap();
    engine.run_until_idle(100);
    assert!(engine.is_running());
    assert!(engine.is_idle());

    let events = engine.drain_events();
    assert!(!events.iter().any(|e| e.kind() == EventKind::DataReceived));
    let reasons: Vec<DropReason> = events
        .iter()
        .filter_map(|e| match e.payload {
            EventPayload::PacketDropped { reason, .. } => Some(reason),
            _ => None,
        })
        .collect();
    assert_eq!(reasons, vec![DropReason::UnreachableDestination]);

    let tick = engine.tick();
    engine.step();
    assert_eq!(engine.tick(), tick + 1);
}

#[test]
fn removed_quantum_host_fails_pending_key() {
    let (mut engine, net) = hybrid_engine(EngineConfig::default());
    engine.start();
    engine.send_message(net.h1, net.h2, b"hi".to_vec()).unwrap();
    for _ in 0..4 {
        engine.step();
    }
    engine.remove_node(net.qh1).unwrap();
    engine.run_until_idle(100);

    let events = engine.drain_events();
    assert!(events.iter().any(|e| e.kind() == EventKind::KeyEstablishmentFailed));
    assert!(events.iter().any(|e| matches!(
        e.payload,
        EventPayload::PacketDropped {
            reason: DropReason::KeyEstablishmentFailed,
            ..
        }
    )));
    assert_eq!(engine.parked_count(), 0);
}
