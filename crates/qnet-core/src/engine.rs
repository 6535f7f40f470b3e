//! The simulation engine: owns the topology and orchestrates the five-phase
//! tick.
//!
//! # Architecture
//!
//! The `Engine` owns:
//! - A [`Topology`] (nodes, links) and a [`RoutingTable`] cache over it
//! - Per-link in-flight queues (the only way packets move between nodes)
//! - A [`SessionTable`] of BB84 sessions keyed by adapter pair
//! - Packets parked on an adapter pair while its key is being established
//! - A [`SimState`] (tick counter, accumulator, running flag)
//! - A single [`SimRng`] for every random draw
//! - An [`EventStream`] drained by the caller
//!
//! # Five-Phase Tick
//!
//! Each `step()` runs:
//! 1. **Commands** -- drain the command queue (originations, key requests)
//! 2. **Link delivery** -- packets whose arrival tick has come reach their next node
//! 3. **Nodes** -- every pending packet is handled, ordered by (node, source, seq)
//! 4. **QKD** -- every live session advances one protocol step, in pair order
//! 5. **Bookkeeping** -- the tick counter increments

use crate::channel::QuantumChannel;
use crate::cipher;
use crate::command_queue::{Command, CommandQueue};
use crate::event::{DropReason, EventPayload, EventStream, Origin, SimEvent};
use crate::fixed::{Ticks, fixed64_to_f64};
use crate::id::{AdapterPair, LinkId, NodeId, PacketSeq};
use crate::packet::Packet;
use crate::qkd::{AbortReason, QkdConfig, QkdError, QkdPhase, QkdSession, SessionOutput, SessionTable};
use crate::rng::SimRng;
use crate::routing::{RoutingError, RoutingTable, quantum_path};
use crate::sim::{AdvanceResult, SimState, SimulationStrategy, StateHash};
use crate::topology::{LinkDomain, LinkSpec, NodeKind, Topology, TopologyError};
use serde::{Deserialize, Serialize};
use slotmap::SecondaryMap;
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Errors and configuration
// ---------------------------------------------------------------------------

/// Errors reported synchronously by engine operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("operation not allowed while the simulation is running")]
    SimulationBusy,
    #[error("{node:?} cannot {role}")]
    InvalidEndpoint { node: NodeId, role: &'static str },
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error(transparent)]
    Routing(#[from] RoutingError),
    #[error(transparent)]
    Qkd(#[from] QkdError),
}

/// Engine-wide settings fixed at construction (QKD parameters can be
/// replaced later through [`Engine::set_qkd_config`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub seed: u64,
    pub qkd: QkdConfig,
    /// Bound on buffered, undrained events.
    pub event_capacity: usize,
    pub strategy: SimulationStrategy,
    /// Executed commands retained for inspection. 0 = none.
    pub command_history: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            seed: 0x5EED,
            qkd: QkdConfig::default(),
            event_capacity: 4096,
            strategy: SimulationStrategy::Tick,
            command_history: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Packet bookkeeping
// ---------------------------------------------------------------------------

/// A packet travelling on a link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct InFlight {
    pub(crate) to: NodeId,
    pub(crate) arrives_at: Ticks,
    pub(crate) packet: Packet,
}

/// How a packet came to be waiting at a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum Arrival {
    /// Just created by a send command.
    Originated,
    /// Delivered by a link this tick.
    Received,
    /// Released after waiting on an adapter pair.
    Resumed,
}

/// A packet a node must handle in the next node phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Work {
    pub(crate) node: NodeId,
    pub(crate) packet: Packet,
    pub(crate) arrival: Arrival,
}

/// A packet held at an adapter until its pair has a key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Parked {
    pub(crate) at: NodeId,
    pub(crate) packet: Packet,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The hybrid network simulation engine.
#[derive(Debug)]
pub struct Engine {
    pub(crate) config: EngineConfig,
    pub(crate) topology: Topology,
    pub(crate) routes: RoutingTable,
    pub(crate) sessions: SessionTable,
    pub(crate) sim_state: SimState,
    pub(crate) rng: SimRng,
    pub(crate) commands: CommandQueue,
    pub(crate) in_flight: SecondaryMap<LinkId, VecDeque<InFlight>>,
    /// Work for the next node phase that did not arrive over a link.
    pub(crate) ready: Vec<Work>,
    pub(crate) parked: BTreeMap<AdapterPair, Vec<Parked>>,
    /// Next packet sequence number per originating host.
    pub(crate) packet_seqs: SecondaryMap<NodeId, u64>,
    pub(crate) events: EventStream,
}

impl Engine {
    /// Create an engine with an empty topology.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        Self::with_topology(Topology::new(), config)
    }

    /// Create an engine over an existing topology.
    pub fn with_topology(topology: Topology, config: EngineConfig) -> Result<Self, EngineError> {
        config.qkd.validate()?;
        let mut in_flight = SecondaryMap::new();
        for (link, _) in topology.links() {
            in_flight.insert(link, VecDeque::new());
        }
        Ok(Self {
            rng: SimRng::new(config.seed),
            events: EventStream::new(config.event_capacity),
            commands: CommandQueue::with_max_history(config.command_history),
            config,
            topology,
            routes: RoutingTable::new(),
            sessions: SessionTable::new(),
            sim_state: SimState::new(),
            in_flight,
            ready: Vec::new(),
            parked: BTreeMap::new(),
            packet_seqs: SecondaryMap::new(),
        })
    }

    // -----------------------------------------------------------------------
    // Topology mutation
    // -----------------------------------------------------------------------

    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        kind: NodeKind,
        address: impl Into<String>,
    ) -> Result<NodeId, EngineError> {
        let name = name.into();
        let id = self.topology.add_node(name.clone(), kind, address)?;
        debug!(node = %name, ?kind, "node added");
        self.emit(Some(id), EventPayload::NodeAdded { name, kind });
        Ok(id)
    }

    pub fn add_link(&mut self, a: NodeId, b: NodeId, spec: LinkSpec) -> Result<LinkId, EngineError> {
        let link = self.topology.add_link(a, b, spec)?;
        self.in_flight.insert(link, VecDeque::new());
        self.routes.invalidate();
        self.emit(
            None,
            EventPayload::LinkAdded {
                link,
                a,
                b,
                domain: spec.domain,
            },
        );
        Ok(link)
    }

    /// Remove a link. Packets on it are dropped, sessions relying on it are
    /// discarded and their waiting packets re-routed next tick.
    pub fn remove_link(&mut self, link: LinkId) -> Result<(), EngineError> {
        self.topology.remove_link(link)?;
        self.routes.invalidate();
        self.after_link_removed(link);
        Ok(())
    }

    /// Remove a node together with every link touching it.
    pub fn remove_node(&mut self, node: NodeId) -> Result<(), EngineError> {
        let name = self
            .topology
            .name(node)
            .map(str::to_owned)
            .ok_or(TopologyError::NodeNotFound(node))?;
        self.emit(Some(node), EventPayload::NodeRemoved { name });

        let removed = self.topology.remove_node(node)?;
        self.routes.invalidate();
        for (link, _) in removed {
            self.after_link_removed(link);
        }
        for pair in self.sessions.pairs() {
            if pair.contains(node) {
                self.invalidate_session(pair);
            }
        }
        self.packet_seqs.remove(node);
        Ok(())
    }

    fn after_link_removed(&mut self, link: LinkId) {
        self.emit(None, EventPayload::LinkRemoved { link });
        if let Some(queue) = self.in_flight.remove(link) {
            for flight in queue {
                let at = flight.packet.previous().unwrap_or(flight.packet.source);
                self.drop_packet(at, flight.packet, DropReason::UnreachableDestination);
            }
        }
        for pair in self.sessions.dependent_on(link) {
            self.invalidate_session(pair);
        }
    }

    fn invalidate_session(&mut self, pair: AdapterPair) {
        if self.sessions.remove(pair).is_some() {
            debug!(?pair, "session invalidated by topology change");
        }
        for waiting in self.parked.remove(&pair).unwrap_or_default() {
            self.ready.push(Work {
                node: waiting.at,
                packet: waiting.packet,
                arrival: Arrival::Resumed,
            });
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Let the clock run. Returns `false` if it was already running.
    pub fn start(&mut self) -> bool {
        if self.sim_state.running {
            return false;
        }
        self.sim_state.running = true;
        info!(tick = self.sim_state.tick, "simulation started");
        self.emit(None, EventPayload::SimulationStarted);
        true
    }

    /// Halt the clock after the current tick. Returns `false` if it was
    /// already stopped.
    pub fn stop(&mut self) -> bool {
        if !self.sim_state.running {
            return false;
        }
        self.sim_state.running = false;
        info!(tick = self.sim_state.tick, "simulation stopped");
        self.emit(None, EventPayload::SimulationStopped);
        true
    }

    pub fn is_running(&self) -> bool {
        self.sim_state.running
    }

    /// Clear in-flight and waiting packets, queued commands and every QKD
    /// session. The topology, clock and event sequence are kept.
    pub fn reset(&mut self) -> Result<(), EngineError> {
        if self.sim_state.running {
            return Err(EngineError::SimulationBusy);
        }
        for (_, queue) in self.in_flight.iter_mut() {
            queue.clear();
        }
        self.ready.clear();
        self.parked.clear();
        self.sessions.clear();
        self.commands.clear();
        self.sim_state.accumulator = 0;
        info!("simulation reset");
        self.emit(None, EventPayload::SimulationReset);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    /// Queue `payload` for delivery from `source` to `destination`. The
    /// packet is originated at the next tick boundary.
    pub fn send_message(
        &mut self,
        source: NodeId,
        destination: NodeId,
        payload: impl Into<Vec<u8>>,
    ) -> Result<PacketSeq, EngineError> {
        self.require(source, NodeKind::is_endpoint, "originate data")?;
        self.require(destination, NodeKind::is_endpoint, "receive data")?;

        let next = self.packet_seqs.get(source).copied().unwrap_or(0);
        self.packet_seqs.insert(source, next + 1);
        let seq = PacketSeq(next);
        self.commands.push(Command::SendMessage {
            source,
            destination,
            seq,
            payload: payload.into(),
        });
        Ok(seq)
    }

    /// Establish a key between two paired adapters ahead of traffic.
    pub fn request_key(&mut self, initiator: NodeId, responder: NodeId) -> Result<(), EngineError> {
        self.config.qkd.validate()?;
        self.require(initiator, NodeKind::is_bridge, "run QKD")?;
        self.require(responder, NodeKind::is_bridge, "run QKD")?;
        if !self.topology.is_secure_segment(initiator, responder) {
            return Err(QkdError::NotAnAdapterPair(initiator, responder).into());
        }
        quantum_path(&self.topology, initiator, responder)
            .map_err(|_| QkdError::NoQuantumPath(initiator, responder))?;
        self.commands.push(Command::RequestKey {
            initiator,
            responder,
        });
        Ok(())
    }

    /// Replace the QKD parameters used by sessions started from now on.
    pub fn set_qkd_config(&mut self, qkd: QkdConfig) -> Result<(), EngineError> {
        qkd.validate()?;
        self.config.qkd = qkd;
        Ok(())
    }

    fn require(&self, node: NodeId, capable: fn(NodeKind) -> bool, role: &'static str) -> Result<NodeKind, EngineError> {
        let kind = self
            .topology
            .kind(node)
            .ok_or(TopologyError::NodeNotFound(node))?;
        if !capable(kind) {
            return Err(EngineError::InvalidEndpoint { node, role });
        }
        Ok(kind)
    }

    // -----------------------------------------------------------------------
    // Clock
    // -----------------------------------------------------------------------

    /// Advance by `dt`. In tick mode this runs exactly one tick; in delta
    /// mode it runs as many whole ticks as the accumulated time allows.
    pub fn advance(&mut self, dt: Ticks) -> AdvanceResult {
        if !self.sim_state.running {
            return AdvanceResult::default();
        }
        let mut result = AdvanceResult::default();
        match self.config.strategy {
            SimulationStrategy::Tick => self.step_internal(&mut result),
            SimulationStrategy::Delta { fixed_timestep } => {
                self.sim_state.accumulator += dt;
                let step_size = fixed_timestep.max(1);
                while self.sim_state.accumulator >= step_size {
                    self.sim_state.accumulator -= step_size;
                    self.step_internal(&mut result);
                }
            }
        }
        result
    }

    /// Run exactly one tick, regardless of strategy. No-op while stopped.
    pub fn step(&mut self) -> AdvanceResult {
        let mut result = AdvanceResult::default();
        if self.sim_state.running {
            self.step_internal(&mut result);
        }
        result
    }

    /// Step until nothing is left to do or `max_ticks` ticks have run.
    pub fn run_until_idle(&mut self, max_ticks: u64) -> AdvanceResult {
        let mut result = AdvanceResult::default();
        while self.sim_state.running && result.steps_run < max_ticks && !self.is_idle() {
            self.step_internal(&mut result);
        }
        result
    }

    /// No commands, packets or unfinished protocol runs remain.
    pub fn is_idle(&self) -> bool {
        self.commands.is_empty()
            && self.ready.is_empty()
            && self.parked.is_empty()
            && self.in_flight.values().all(VecDeque::is_empty)
            && !self.sessions.any_in_progress()
    }

    fn step_internal(&mut self, result: &mut AdvanceResult) {
        let before = self.events.cursor().next_seq;

        // Phase 1: commands.
        self.phase_commands();

        // Phase 2: link delivery.
        let mut work = std::mem::take(&mut self.ready);
        self.phase_link_delivery(&mut work);

        // Phase 3: node processing.
        self.phase_nodes(work);

        // Phase 4: QKD sessions.
        self.phase_qkd();

        // Phase 5: bookkeeping.
        self.sim_state.tick += 1;
        result.steps_run += 1;
        result.events_emitted += self.events.cursor().next_seq - before;
    }

    // -----------------------------------------------------------------------
    // Phase 1: commands
    // -----------------------------------------------------------------------

    fn phase_commands(&mut self) {
        for command in self.commands.drain(self.sim_state.tick) {
            match command {
                Command::SendMessage {
                    source,
                    destination,
                    seq,
                    payload,
                } => {
                    if !self.topology.contains_node(source) {
                        warn!(?source, "dropping send from removed node");
                        continue;
                    }
                    self.emit(
                        Some(source),
                        EventPayload::DataSent {
                            destination,
                            data: payload.clone(),
                        },
                    );
                    self.ready.push(Work {
                        node: source,
                        packet: Packet::new(source, destination, seq, payload),
                        arrival: Arrival::Originated,
                    });
                }
                Command::RequestKey {
                    initiator,
                    responder,
                } => {
                    self.start_session(initiator, responder);
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Phase 2: link delivery
    // -----------------------------------------------------------------------

    fn phase_link_delivery(&mut self, work: &mut Vec<Work>) {
        let tick = self.sim_state.tick;
        for (_, queue) in self.in_flight.iter_mut() {
            while queue.front().is_some_and(|f| f.arrives_at <= tick) {
                if let Some(flight) = queue.pop_front() {
                    work.push(Work {
                        node: flight.to,
                        packet: flight.packet,
                        arrival: Arrival::Received,
                    });
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Phase 3: node processing
    // -----------------------------------------------------------------------

    fn phase_nodes(&mut self, mut work: Vec<Work>) {
        work.sort_by_key(|w| (w.node, w.packet.source, w.packet.seq));
        for item in work {
            self.process_at_node(item);
        }
    }

    fn process_at_node(&mut self, item: Work) {
        let Work {
            node,
            packet,
            arrival,
        } = item;
        let Some(kind) = self.topology.kind(node) else {
            self.drop_packet(node, packet, DropReason::UnreachableDestination);
            return;
        };

        if arrival == Arrival::Received {
            debug!(node = ?node, seq = packet.seq.0, "packet received");
            self.emit(
                Some(node),
                EventPayload::PacketReceived {
                    packet: packet.clone(),
                },
            );
        }

        let packet = if arrival == Arrival::Received && kind.is_bridge() {
            match self.decrypt_inbound(node, packet) {
                Some(p) => p,
                None => return,
            }
        } else {
            packet
        };

        if node == packet.destination {
            info!(node = ?node, seq = packet.seq.0, hops = packet.hops.len(), "data delivered");
            self.emit(
                Some(node),
                EventPayload::DataReceived {
                    source: packet.source,
                    data: packet.payload,
                },
            );
            return;
        }

        let next = match self.routes.next_hop(&self.topology, node, packet.destination) {
            Ok(next) => next,
            Err(_) => {
                let reason = if arrival == Arrival::Originated {
                    DropReason::NoRouteFound
                } else {
                    DropReason::UnreachableDestination
                };
                self.drop_packet(node, packet, reason);
                return;
            }
        };

        let packet = if kind.is_bridge() && self.topology.is_secure_segment(node, next) {
            match self.encrypt_outbound(node, next, packet) {
                Some(p) => p,
                None => return,
            }
        } else {
            packet
        };

        self.transmit(node, next, packet);
    }

    /// Decrypt a packet that crossed a secure segment into `node`.
    fn decrypt_inbound(&mut self, node: NodeId, packet: Packet) -> Option<Packet> {
        let Some(prev) = packet.previous() else {
            return Some(packet);
        };
        if !self.topology.kind(prev).is_some_and(NodeKind::is_bridge) {
            return Some(packet);
        }
        let pair = AdapterPair::new(prev, node);
        let key = self
            .sessions
            .get(pair)
            .and_then(QkdSession::shared_key)
            .map(|k| k.to_bytes());
        match key.map(|k| cipher::decrypt(&packet.payload, &k)) {
            Some(Ok(plain)) => {
                debug!(?pair, seq = packet.seq.0, "payload decrypted");
                Some(packet.with_payload(plain))
            }
            _ => {
                self.drop_packet(node, packet, DropReason::KeyUnavailable);
                None
            }
        }
    }

    /// Encrypt for the secure segment `node -> next`, or park the packet
    /// until the pair has a usable key.
    fn encrypt_outbound(&mut self, node: NodeId, next: NodeId, packet: Packet) -> Option<Packet> {
        let pair = AdapterPair::new(node, next);
        let key = self
            .sessions
            .get(pair)
            .and_then(QkdSession::shared_key)
            .map(|k| k.to_bytes());

        let unusable_key = match &key {
            Some(k) => match cipher::encrypt(&packet.payload, k) {
                Ok(ciphertext) => {
                    debug!(?pair, seq = packet.seq.0, "payload encrypted");
                    return Some(packet.with_payload(ciphertext));
                }
                Err(e) => {
                    warn!(?pair, error = %e, "confirmed key unusable");
                    true
                }
            },
            None => false,
        };

        debug!(?pair, seq = packet.seq.0, "packet waiting for key");
        self.parked.entry(pair).or_default().push(Parked { at: node, packet });

        if unusable_key {
            let detected = self
                .sessions
                .get_mut(pair)
                .map(|s| s.abort(AbortReason::EmptyKeyMaterial));
            if let Some(SessionOutput::Aborted { reason, detected_at }) = detected {
                self.handle_abort(pair, reason, detected_at);
            }
        } else if !self.sessions.contains(pair) {
            self.start_session(node, next);
        }
        None
    }

    fn transmit(&mut self, node: NodeId, next: NodeId, packet: Packet) {
        let Some(link) = self.topology.link_between(node, next, LinkDomain::Classical) else {
            self.drop_packet(node, packet, DropReason::UnreachableDestination);
            return;
        };
        let latency = self.topology.link(link).map_or(1, |l| l.latency);
        let packet = packet.with_hop(next);
        debug!(from = ?node, to = ?next, seq = packet.seq.0, "packet transmitted");
        self.emit(
            Some(node),
            EventPayload::PacketTransmitted {
                to: next,
                packet: packet.clone(),
            },
        );
        let flight = InFlight {
            to: next,
            arrives_at: self.sim_state.tick + latency,
            packet,
        };
        match self.in_flight.get_mut(link) {
            Some(queue) => queue.push_back(flight),
            None => {
                self.in_flight.insert(link, VecDeque::from([flight]));
            }
        }
    }

    fn drop_packet(&mut self, at: NodeId, packet: Packet, reason: DropReason) {
        warn!(node = ?at, seq = packet.seq.0, ?reason, "packet dropped");
        self.emit(Some(at), EventPayload::PacketDropped { packet, reason });
    }

    // -----------------------------------------------------------------------
    // Phase 4: QKD
    // -----------------------------------------------------------------------

    /// Create a session for the pair unless one already exists. Fails the
    /// pair immediately when there is no channel to run BB84 over.
    fn start_session(&mut self, initiator: NodeId, responder: NodeId) {
        let pair = AdapterPair::new(initiator, responder);
        if self.sessions.contains(pair) {
            return;
        }
        let secure_link = self
            .topology
            .link_between(initiator, responder, LinkDomain::Classical);
        match (secure_link, quantum_path(&self.topology, initiator, responder)) {
            (Some(secure_link), Ok(path)) => {
                debug!(?pair, quantum_hops = path.links.len(), "session created");
                self.sessions.insert(
                    QkdSession::new(initiator, responder, &self.config.qkd)
                        .with_links(secure_link, path.links),
                );
            }
            _ => self.fail_pair(pair, initiator, AbortReason::ChannelUnavailable, 0),
        }
    }

    fn phase_qkd(&mut self) {
        for pair in self.sessions.pairs() {
            let Some(session) = self.sessions.get(pair) else {
                continue;
            };
            if session.phase() == QkdPhase::Confirmed {
                continue;
            }
            let channel = QuantumChannel::from_links(&self.topology, session.quantum_links());
            let outputs = match (channel, self.sessions.get_mut(pair)) {
                (Ok(channel), Some(session)) => session.advance(&channel, &self.config.qkd, &mut self.rng),
                (Err(_), Some(session)) => vec![session.abort(AbortReason::ChannelUnavailable)],
                (_, None) => continue,
            };
            for output in outputs {
                self.apply_session_output(pair, output);
            }
        }
    }

    fn apply_session_output(&mut self, pair: AdapterPair, output: SessionOutput) {
        let Some((initiator, responder)) = self
            .sessions
            .get(pair)
            .map(|s| (s.initiator(), s.responder()))
        else {
            return;
        };
        match output {
            SessionOutput::Initiated {
                qubit_count,
                attempt,
            } => {
                info!(?pair, qubit_count, attempt, "qkd initiated");
                self.emit(
                    Some(initiator),
                    EventPayload::QkdInitiated {
                        with_adapter: responder,
                        qubit_count,
                        attempt,
                    },
                );
            }
            SessionOutput::Measured { qubit_count } => {
                debug!(?pair, qubit_count, "qubits measured");
            }
            SessionOutput::Message { receiver, message } => {
                self.emit(Some(receiver), EventPayload::ClassicalDataReceived { message });
            }
            SessionOutput::Confirmed {
                key_length_bits,
                error_rate,
            } => {
                let error_rate = fixed64_to_f64(error_rate);
                info!(?pair, key_length_bits, error_rate, "key established");
                self.emit(
                    Some(initiator),
                    EventPayload::KeyEstablished {
                        adapter_pair: pair,
                        key_length_bits,
                        error_rate,
                    },
                );
                for waiting in self.parked.remove(&pair).unwrap_or_default() {
                    self.ready.push(Work {
                        node: waiting.at,
                        packet: waiting.packet,
                        arrival: Arrival::Resumed,
                    });
                }
            }
            SessionOutput::Aborted {
                reason,
                detected_at,
            } => self.handle_abort(pair, reason, detected_at),
        }
    }

    /// Report an aborted run and either schedule a retry or fail the pair.
    fn handle_abort(&mut self, pair: AdapterPair, reason: AbortReason, detected_at: NodeId) {
        let Some(session) = self.sessions.get_mut(pair) else {
            return;
        };
        let attempt = session.attempt();
        let initiator = session.initiator();
        let retried = session.retry(&self.config.qkd);

        info!(?pair, attempt, %reason, "qkd aborted");
        self.emit(
            Some(detected_at),
            EventPayload::QkdAborted {
                adapter_pair: pair,
                reason,
                attempt,
            },
        );
        if let Err(e) = retried {
            warn!(?pair, error = %e, "giving up on key establishment");
            self.fail_pair(pair, initiator, reason, attempt);
        }
    }

    /// Discard the pair's session and drop every packet waiting on it.
    fn fail_pair(&mut self, pair: AdapterPair, initiator: NodeId, reason: AbortReason, attempts: u32) {
        self.sessions.remove(pair);
        self.emit(
            Some(initiator),
            EventPayload::KeyEstablishmentFailed {
                adapter_pair: pair,
                reason,
                attempts,
            },
        );
        for waiting in self.parked.remove(&pair).unwrap_or_default() {
            self.drop_packet(waiting.at, waiting.packet, DropReason::KeyEstablishmentFailed);
        }
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    fn emit(&mut self, node: Option<NodeId>, payload: EventPayload) {
        let origin = node.and_then(|id| {
            self.topology.name(id).map(|name| Origin {
                node: id,
                name: name.to_owned(),
            })
        });
        self.events.emit(self.sim_state.tick, origin, payload);
    }

    /// Take every buffered event, oldest first.
    pub fn drain_events(&mut self) -> Vec<SimEvent> {
        self.events.drain()
    }

    pub fn events(&self) -> &EventStream {
        &self.events
    }

    /// Mutable access for suppression and clearing.
    pub fn events_mut(&mut self) -> &mut EventStream {
        &mut self.events
    }

    /// FNV-1a digest of every event emitted so far.
    pub fn trace_hash(&self) -> u64 {
        self.events.trace_hash()
    }

    /// Digest of the event trace combined with clock and RNG position.
    pub fn state_hash(&self) -> u64 {
        let mut h = StateHash::new();
        h.write_u64(self.events.trace_hash());
        h.write_u64(self.sim_state.tick);
        h.write_u64(self.rng.state());
        h.write_u64(self.in_flight_count() as u64);
        h.write_u64(self.parked_count() as u64);
        h.finish()
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn tick(&self) -> Ticks {
        self.sim_state.tick
    }

    pub fn sim_state(&self) -> &SimState {
        &self.sim_state
    }

    pub fn find_node(&self, name: &str) -> Option<NodeId> {
        self.topology.find_node(name)
    }

    /// Route `from -> to` using the cached routing tables.
    pub fn compute_path(&mut self, from: NodeId, to: NodeId) -> Result<Vec<NodeId>, EngineError> {
        Ok(self.routes.compute_path(&self.topology, from, to)?)
    }

    pub fn session(&self, pair: AdapterPair) -> Option<&QkdSession> {
        self.sessions.get(pair)
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    /// Packets currently travelling on links.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.values().map(VecDeque::len).sum()
    }

    /// Packets waiting on any adapter pair for a key.
    pub fn parked_count(&self) -> usize {
        self.parked.values().map(Vec::len).sum()
    }

    pub fn parked_on(&self, pair: AdapterPair) -> usize {
        self.parked.get(&pair).map_or(0, Vec::len)
    }

    pub fn pending_commands(&self) -> usize {
        self.commands.pending_count()
    }

    pub fn command_history(&self) -> &[(Ticks, Command)] {
        self.commands.history()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
