//! Criterion benchmarks for the qnet engine.
//!
//! Three groups:
//! - `bb84`: one full protocol run at several batch sizes
//! - `routing`: route tree construction over long router chains
//! - `end_to_end`: a message across the reference hybrid network

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use qnet_core::channel::QuantumChannel;
use qnet_core::engine::EngineConfig;
use qnet_core::fixed::Fixed64;
use qnet_core::qkd::{QkdConfig, QkdPhase, QkdSession};
use qnet_core::rng::SimRng;
use qnet_core::test_utils::*;

fn bench_bb84(c: &mut Criterion) {
    let mut group = c.benchmark_group("bb84");
    let (topology, net) = hybrid_topology(Fixed64::ZERO);
    let channel = QuantumChannel::from_links(&topology, &[net.a1_qh1, net.qh1_qh2, net.qh2_a2])
        .expect("quantum links");

    for qubits in [64usize, 256, 1024] {
        let config = QkdConfig {
            qubit_count: qubits,
            max_qubit_count: qubits,
            ..QkdConfig::default()
        };
        group.bench_with_input(BenchmarkId::from_parameter(qubits), &qubits, |b, _| {
            let mut rng = SimRng::new(7);
            b.iter(|| {
                let mut session = QkdSession::new(net.a1, net.a2, &config);
                while !matches!(session.phase(), QkdPhase::Confirmed | QkdPhase::Aborted) {
                    session.advance(&channel, &config, &mut rng);
                }
                session
            });
        });
    }
    group.finish();
}

fn bench_routing(c: &mut Criterion) {
    let mut group = c.benchmark_group("routing");
    for len in [10usize, 100, 1000] {
        let (engine, first, last) = router_chain(len);
        group.bench_with_input(BenchmarkId::from_parameter(len), &len, |b, _| {
            b.iter(|| qnet_core::routing::compute_path(engine.topology(), first, last));
        });
    }
    group.finish();
}

fn bench_end_to_end(c: &mut Criterion) {
    c.bench_function("end_to_end_hi", |b| {
        b.iter(|| {
            let (mut engine, net) = hybrid_engine(EngineConfig::default());
            engine.start();
            engine
                .send_message(net.h1, net.h2, "hi")
                .expect("hosts accept data");
            engine.run_until_idle(200);
            engine.trace_hash()
        });
    });
}

criterion_group!(benches, bench_bb84, bench_routing, bench_end_to_end);
criterion_main!(benches);
