//! qnet core -- a deterministic simulation engine for hybrid classical and
//! quantum networks.
//!
//! Classical hosts and routers exchange packets hop by hop. Where a route
//! crosses a secure segment (a classical link joining two quantum adapters)
//! the adapters establish a shared key with BB84 over the quantum
//! sub-network and encrypt the payload for that hop.
//!
//! # Five-Phase Tick Pipeline
//!
//! Each call to [`engine::Engine::step`] advances the simulation by one tick:
//!
//! 1. **Commands** -- Queued sends and key requests take effect.
//! 2. **Link delivery** -- Packets whose latency has elapsed reach the next node.
//! 3. **Nodes** -- Pending packets are forwarded, encrypted, decrypted or delivered.
//! 4. **QKD** -- Every live BB84 session advances one protocol step.
//! 5. **Bookkeeping** -- The tick counter increments.
//!
//! All observable behavior is reported through [`event::EventStream`]; the
//! FNV-1a digest of that stream ([`engine::Engine::trace_hash`]) is identical
//! for identical topologies, seeds and command sequences.
//!
//! # Key Types
//!
//! - [`engine::Engine`] -- Owns all state and runs the pipeline.
//! - [`topology::Topology`] -- Nodes, links and domain validation.
//! - [`routing::RoutingTable`] -- Cached per-destination route trees.
//! - [`qkd::QkdSession`] -- The BB84 state machine for one adapter pair.
//! - [`cipher`] -- XOR keystream over the established key.
//! - [`serialize`] and [`replay`] -- bitcode snapshots and command replay.

pub mod channel;
pub mod cipher;
pub mod command_queue;
pub mod engine;
pub mod event;
pub mod fixed;
pub mod id;
pub mod packet;
pub mod qkd;
pub mod replay;
pub mod rng;
pub mod routing;
pub mod serialize;
pub mod sim;
pub mod topology;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
