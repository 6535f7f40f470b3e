//! Ordered outbound event stream.
//!
//! Every observable thing the engine does is appended to a single
//! [`EventStream`] as a [`SimEvent`]: a monotonically increasing sequence
//! number, the tick, the originating node and a typed payload. The caller
//! drains the stream; there are no callbacks.
//!
//! # Suppression
//!
//! Kinds can be suppressed via [`EventStream::suppress`]. Suppressed events
//! are never buffered and take no sequence number, but they still feed the
//! trace hash so determinism checks are independent of what is observed.

use crate::fixed::Ticks;
use crate::id::{AdapterPair, LinkId, NodeId};
use crate::packet::Packet;
use crate::qkd::{AbortReason, ProtocolMessage};
use crate::sim::StateHash;
use crate::topology::{LinkDomain, NodeKind};
use serde::{Deserialize, Serialize};
use slotmap::Key;
use std::collections::{BTreeMap, VecDeque};

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// Why a packet left the network without being delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    NoRouteFound,
    UnreachableDestination,
    KeyEstablishmentFailed,
    KeyUnavailable,
}

/// Typed event body. Serialized with a snake_case `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    // -- Application data --
    DataSent {
        destination: NodeId,
        data: Vec<u8>,
    },
    DataReceived {
        source: NodeId,
        data: Vec<u8>,
    },

    // -- Packets --
    PacketTransmitted {
        to: NodeId,
        packet: Packet,
    },
    PacketReceived {
        packet: Packet,
    },
    PacketDropped {
        packet: Packet,
        reason: DropReason,
    },

    // -- QKD --
    QkdInitiated {
        with_adapter: NodeId,
        qubit_count: usize,
        attempt: u32,
    },
    ClassicalDataReceived {
        message: ProtocolMessage,
    },
    KeyEstablished {
        adapter_pair: AdapterPair,
        key_length_bits: usize,
        error_rate: f64,
    },
    QkdAborted {
        adapter_pair: AdapterPair,
        reason: AbortReason,
        attempt: u32,
    },
    KeyEstablishmentFailed {
        adapter_pair: AdapterPair,
        reason: AbortReason,
        attempts: u32,
    },

    // -- Lifecycle --
    SimulationStarted,
    SimulationStopped,
    SimulationReset,

    // -- Topology --
    NodeAdded {
        name: String,
        kind: NodeKind,
    },
    NodeRemoved {
        name: String,
    },
    LinkAdded {
        link: LinkId,
        a: NodeId,
        b: NodeId,
        domain: LinkDomain,
    },
    LinkRemoved {
        link: LinkId,
    },
}

/// Discriminant tag for event payloads, used for suppression and counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventKind {
    DataSent,
    DataReceived,
    PacketTransmitted,
    PacketReceived,
    PacketDropped,
    QkdInitiated,
    ClassicalDataReceived,
    KeyEstablished,
    QkdAborted,
    KeyEstablishmentFailed,
    SimulationStarted,
    SimulationStopped,
    SimulationReset,
    NodeAdded,
    NodeRemoved,
    LinkAdded,
    LinkRemoved,
}

/// Total number of event kinds.
const EVENT_KIND_COUNT: usize = 17;

impl EventKind {
    pub const ALL: [EventKind; EVENT_KIND_COUNT] = [
        EventKind::DataSent,
        EventKind::DataReceived,
        EventKind::PacketTransmitted,
        EventKind::PacketReceived,
        EventKind::PacketDropped,
        EventKind::QkdInitiated,
        EventKind::ClassicalDataReceived,
        EventKind::KeyEstablished,
        EventKind::QkdAborted,
        EventKind::KeyEstablishmentFailed,
        EventKind::SimulationStarted,
        EventKind::SimulationStopped,
        EventKind::SimulationReset,
        EventKind::NodeAdded,
        EventKind::NodeRemoved,
        EventKind::LinkAdded,
        EventKind::LinkRemoved,
    ];

    fn index(self) -> usize {
        self as usize
    }

    /// The wire name, matching the payload's `type` tag.
    pub fn name(self) -> &'static str {
        match self {
            EventKind::DataSent => "data_sent",
            EventKind::DataReceived => "data_received",
            EventKind::PacketTransmitted => "packet_transmitted",
            EventKind::PacketReceived => "packet_received",
            EventKind::PacketDropped => "packet_dropped",
            EventKind::QkdInitiated => "qkd_initiated",
            EventKind::ClassicalDataReceived => "classical_data_received",
            EventKind::KeyEstablished => "key_established",
            EventKind::QkdAborted => "qkd_aborted",
            EventKind::KeyEstablishmentFailed => "key_establishment_failed",
            EventKind::SimulationStarted => "simulation_started",
            EventKind::SimulationStopped => "simulation_stopped",
            EventKind::SimulationReset => "simulation_reset",
            EventKind::NodeAdded => "node_added",
            EventKind::NodeRemoved => "node_removed",
            EventKind::LinkAdded => "link_added",
            EventKind::LinkRemoved => "link_removed",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::DataSent { .. } => EventKind::DataSent,
            EventPayload::DataReceived { .. } => EventKind::DataReceived,
            EventPayload::PacketTransmitted { .. } => EventKind::PacketTransmitted,
            EventPayload::PacketReceived { .. } => EventKind::PacketReceived,
            EventPayload::PacketDropped { .. } => EventKind::PacketDropped,
            EventPayload::QkdInitiated { .. } => EventKind::QkdInitiated,
            EventPayload::ClassicalDataReceived { .. } => EventKind::ClassicalDataReceived,
            EventPayload::KeyEstablished { .. } => EventKind::KeyEstablished,
            EventPayload::QkdAborted { .. } => EventKind::QkdAborted,
            EventPayload::KeyEstablishmentFailed { .. } => EventKind::KeyEstablishmentFailed,
            EventPayload::SimulationStarted => EventKind::SimulationStarted,
            EventPayload::SimulationStopped => EventKind::SimulationStopped,
            EventPayload::SimulationReset => EventKind::SimulationReset,
            EventPayload::NodeAdded { .. } => EventKind::NodeAdded,
            EventPayload::NodeRemoved { .. } => EventKind::NodeRemoved,
            EventPayload::LinkAdded { .. } => EventKind::LinkAdded,
            EventPayload::LinkRemoved { .. } => EventKind::LinkRemoved,
        }
    }
}

/// A recorded event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimEvent {
    pub seq: u64,
    pub tick: Ticks,
    /// Originating node. `None` for lifecycle events.
    pub node: Option<NodeId>,
    pub node_name: Option<String>,
    /// Flattened so the `type` tag sits beside `seq` and `tick`.
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl SimEvent {
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// Single-line JSON rendering for streaming to observers.
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// The originating node of an event, as known at emission time.
#[derive(Debug, Clone, PartialEq)]
pub struct Origin {
    pub node: NodeId,
    pub name: String,
}

// ---------------------------------------------------------------------------
// EventStream
// ---------------------------------------------------------------------------

/// Position of an [`EventStream`] that must survive snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamCursor {
    pub next_seq: u64,
    pub trace_hash: u64,
}

/// Bounded FIFO of events. When full, the oldest event is dropped and
/// counted.
#[derive(Debug)]
pub struct EventStream {
    queue: VecDeque<SimEvent>,
    capacity: usize,
    next_seq: u64,
    dropped: u64,
    emitted: [u64; EVENT_KIND_COUNT],
    suppressed: [bool; EVENT_KIND_COUNT],
    trace: StateHash,
}

impl EventStream {
    /// A capacity of 0 is clamped to 1.
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            capacity: capacity.max(1),
            next_seq: 0,
            dropped: 0,
            emitted: [0; EVENT_KIND_COUNT],
            suppressed: [false; EVENT_KIND_COUNT],
            trace: StateHash::new(),
        }
    }

    /// Rebuild an empty stream positioned at `cursor`.
    pub fn resume(capacity: usize, cursor: StreamCursor) -> Self {
        let mut stream = Self::new(capacity);
        stream.next_seq = cursor.next_seq;
        stream.trace = StateHash(cursor.trace_hash);
        stream
    }

    pub fn cursor(&self) -> StreamCursor {
        StreamCursor {
            next_seq: self.next_seq,
            trace_hash: self.trace.0,
        }
    }

    /// Record an event. Returns its sequence number, or `None` when the
    /// kind is suppressed.
    pub fn emit(&mut self, tick: Ticks, origin: Option<Origin>, payload: EventPayload) -> Option<u64> {
        let kind = payload.kind();
        self.fold_into_trace(tick, origin.as_ref(), &payload);
        if self.suppressed[kind.index()] {
            return None;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.emitted[kind.index()] += 1;
        if self.queue.len() == self.capacity {
            self.queue.pop_front();
            self.dropped += 1;
        }
        let (node, node_name) = match origin {
            Some(o) => (Some(o.node), Some(o.name)),
            None => (None, None),
        };
        self.queue.push_back(SimEvent {
            seq,
            tick,
            node,
            node_name,
            payload,
        });
        Some(seq)
    }

    fn fold_into_trace(&mut self, tick: Ticks, origin: Option<&Origin>, payload: &EventPayload) {
        self.trace.write_u64(tick);
        self.trace.write_u32(payload.kind().index() as u32);
        self.trace
            .write_u64(origin.map_or(0, |o| o.node.data().as_ffi()));
        if let Ok(bytes) = serde_json::to_vec(payload) {
            self.trace.write(&bytes);
        }
    }

    /// Remove and return every buffered event, oldest first.
    pub fn drain(&mut self) -> Vec<SimEvent> {
        self.queue.drain(..).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SimEvent> {
        self.queue.iter()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Events evicted because the buffer was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }

    /// Non-suppressed events of `kind` emitted since creation.
    pub fn total_emitted(&self, kind: EventKind) -> u64 {
        self.emitted[kind.index()]
    }

    pub fn suppress(&mut self, kind: EventKind) {
        self.suppressed[kind.index()] = true;
        self.queue.retain(|e| e.kind() != kind);
    }

    pub fn unsuppress(&mut self, kind: EventKind) {
        self.suppressed[kind.index()] = false;
    }

    pub fn is_suppressed(&self, kind: EventKind) -> bool {
        self.suppressed[kind.index()]
    }

    /// FNV-1a digest of every event emitted so far, suppressed or not.
    pub fn trace_hash(&self) -> u64 {
        self.trace.finish()
    }

    /// Drop buffered events. Sequence numbers and the trace continue.
    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

// ---------------------------------------------------------------------------
// Trace summary
// ---------------------------------------------------------------------------

/// Event counts per kind and per originating node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceSummary {
    pub by_kind: BTreeMap<&'static str, u64>,
    pub by_node: BTreeMap<String, u64>,
    pub delivered: u64,
    pub dropped: u64,
    pub keys_established: u64,
}

impl TraceSummary {
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a SimEvent>) -> Self {
        let mut summary = Self::default();
        for event in events {
            *summary.by_kind.entry(event.kind().name()).or_default() += 1;
            if let Some(name) = &event.node_name {
                *summary.by_node.entry(name.clone()).or_default() += 1;
            }
            match event.kind() {
                EventKind::DataReceived => summary.delivered += 1,
                EventKind::PacketDropped => summary.dropped += 1,
                EventKind::KeyEstablished => summary.keys_established += 1,
                _ => {}
            }
        }
        summary
    }
}

// ===========================================================================
// Tests
// ===========================================================================
