//! Binary snapshots of the engine.
//!
//! Snapshots are `bitcode` blobs with a versioned header. They carry the
//! topology, clock, RNG position, in-flight and waiting packets, queued
//! commands and every QKD session, so a restored engine continues exactly
//! where the original left off. Buffered events are not included; only the
//! stream position (sequence and trace hash) survives.

use crate::command_queue::{Command, CommandQueue};
use crate::engine::{Engine, EngineConfig, InFlight, Parked, Work};
use crate::event::{EventStream, StreamCursor};
use crate::id::{AdapterPair, LinkId, NodeId};
use crate::qkd::SessionTable;
use crate::rng::SimRng;
use crate::routing::RoutingTable;
use crate::sim::SimState;
use crate::topology::Topology;
use serde::{Deserialize, Serialize};
use slotmap::SecondaryMap;
use std::collections::{BTreeMap, VecDeque};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Magic number identifying a qnet engine snapshot.
pub const SNAPSHOT_MAGIC: u32 = 0x0B84_0001;

/// Current format version. Increment when breaking the wire format.
pub const FORMAT_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SerializeError {
    #[error("bitcode encoding failed: {0}")]
    Encode(String),
}

#[derive(Debug, thiserror::Error)]
pub enum DeserializeError {
    #[error("invalid magic number: expected 0x{:08X}, got 0x{:08X}", SNAPSHOT_MAGIC, .0)]
    InvalidMagic(u32),
    #[error("unsupported format version: expected {}, got {}", FORMAT_VERSION, .0)]
    UnsupportedVersion(u32),
    #[error("snapshot from future version {0} (this build supports up to {FORMAT_VERSION})")]
    FutureVersion(u32),
    #[error("bitcode decoding failed: {0}")]
    Decode(String),
}

// ---------------------------------------------------------------------------
// Snapshot header
// ---------------------------------------------------------------------------

/// Header prepended to every snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotHeader {
    pub magic: u32,
    pub version: u32,
    /// Tick at which the snapshot was taken.
    pub tick: u64,
}

impl SnapshotHeader {
    pub fn new(tick: u64) -> Self {
        Self {
            magic: SNAPSHOT_MAGIC,
            version: FORMAT_VERSION,
            tick,
        }
    }

    pub fn validate(&self) -> Result<(), DeserializeError> {
        if self.magic != SNAPSHOT_MAGIC {
            return Err(DeserializeError::InvalidMagic(self.magic));
        }
        if self.version > FORMAT_VERSION {
            return Err(DeserializeError::FutureVersion(self.version));
        }
        if self.version < FORMAT_VERSION {
            return Err(DeserializeError::UnsupportedVersion(self.version));
        }
        Ok(())
    }
}

/// Decode only as far as the header. bitcode has no partial decoding, so
/// the whole snapshot is parsed.
pub fn read_snapshot_header(data: &[u8]) -> Result<SnapshotHeader, DeserializeError> {
    let snapshot: EngineSnapshot =
        bitcode::deserialize(data).map_err(|e| DeserializeError::Decode(e.to_string()))?;
    Ok(snapshot.header)
}

// ---------------------------------------------------------------------------
// Serializable engine state
// ---------------------------------------------------------------------------

/// Everything but the routing cache (rebuilt lazily) and buffered events.
#[derive(Debug, Serialize, Deserialize)]
struct EngineSnapshot {
    header: SnapshotHeader,
    config: EngineConfig,
    topology: Topology,
    sessions: SessionTable,
    sim_state: SimState,
    rng: SimRng,
    pending_commands: Vec<Command>,
    in_flight: SecondaryMap<LinkId, VecDeque<InFlight>>,
    ready: Vec<Work>,
    parked: BTreeMap<AdapterPair, Vec<Parked>>,
    packet_seqs: SecondaryMap<NodeId, u64>,
    stream: StreamCursor,
}

impl Engine {
    /// Serialize the engine to a bitcode blob.
    pub fn serialize(&self) -> Result<Vec<u8>, SerializeError> {
        let snapshot = EngineSnapshot {
            header: SnapshotHeader::new(self.sim_state.tick),
            config: self.config.clone(),
            topology: self.topology.clone(),
            sessions: self.sessions.clone(),
            sim_state: self.sim_state.clone(),
            rng: self.rng.clone(),
            pending_commands: self.commands.pending().to_vec(),
            in_flight: self.in_flight.clone(),
            ready: self.ready.clone(),
            parked: self.parked.clone(),
            packet_seqs: self.packet_seqs.clone(),
            stream: self.events.cursor(),
        };
        bitcode::serialize(&snapshot).map_err(|e| SerializeError::Encode(e.to_string()))
    }

    /// Restore an engine from [`Engine::serialize`] output. The event
    /// buffer starts empty; sequence numbers and the trace hash continue.
    pub fn deserialize(data: &[u8]) -> Result<Self, DeserializeError> {
        let snapshot: EngineSnapshot =
            bitcode::deserialize(data).map_err(|e| DeserializeError::Decode(e.to_string()))?;
        snapshot.header.validate()?;

        let mut commands = CommandQueue::with_max_history(snapshot.config.command_history);
        for command in snapshot.pending_commands {
            commands.push(command);
        }
        Ok(Engine {
            events: EventStream::resume(snapshot.config.event_capacity, snapshot.stream),
            commands,
            config: snapshot.config,
            topology: snapshot.topology,
            routes: RoutingTable::new(),
            sessions: snapshot.sessions,
            sim_state: snapshot.sim_state,
            rng: snapshot.rng,
            in_flight: snapshot.in_flight,
            ready: snapshot.ready,
            parked: snapshot.parked,
            packet_seqs: snapshot.packet_seqs,
        })
    }

    /// Serialize and push onto `buffer`.
    pub fn take_snapshot(&self, buffer: &mut SnapshotRingBuffer) -> Result<(), SerializeError> {
        let data = self.serialize()?;
        buffer.push(SnapshotEntry {
            tick: self.sim_state.tick,
            data,
        });
        Ok(())
    }

    /// Restore the snapshot at `index` (0 = oldest). `None` if out of range.
    pub fn restore_snapshot(
        buffer: &SnapshotRingBuffer,
        index: usize,
    ) -> Result<Option<Engine>, DeserializeError> {
        let Some(entry) = buffer.get(index) else {
            return Ok(None);
        };
        Engine::deserialize(&entry.data).map(Some)
    }
}

// ---------------------------------------------------------------------------
// SnapshotRingBuffer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SnapshotEntry {
    pub tick: u64,
    pub data: Vec<u8>,
}

/// Fixed-capacity ring of snapshots; the oldest is evicted when full.
#[derive(Debug)]
pub struct SnapshotRingBuffer {
    entries: VecDeque<SnapshotEntry>,
    capacity: usize,
    total_taken: u64,
}

impl SnapshotRingBuffer {
    /// A capacity of 0 is clamped to 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            total_taken: 0,
        }
    }

    pub fn push(&mut self, entry: SnapshotEntry) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
        self.total_taken += 1;
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshots ever pushed, including evicted ones.
    pub fn total_taken(&self) -> u64 {
        self.total_taken
    }

    pub fn get(&self, index: usize) -> Option<&SnapshotEntry> {
        self.entries.get(index)
    }

    pub fn latest(&self) -> Option<&SnapshotEntry> {
        self.entries.back()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use crate::test_utils::*;

    fn mid_protocol_engine() -> (Engine, HybridNet) {
        let (mut engine, net) = hybrid_engine(EngineConfig::default());
        engine.start();
        engine.send_message(net.h1, net.h2, "hi").unwrap();
        for _ in 0..5 {
            engine.step();
        }
        (engine, net)
    }

    #[test]
    fn round_trip_preserves_state_hash() {
        let (engine, _) = mid_protocol_engine();
        let data = engine.serialize().unwrap();
        let restored = Engine::deserialize(&data).unwrap();
        assert_eq!(restored.state_hash(), engine.state_hash());
        assert_eq!(restored.tick(), engine.tick());
        assert_eq!(restored.parked_count(), engine.parked_count());
        assert_eq!(restored.sessions().len(), 1);
    }

    #[test]
    fn restored_engine_continues_identically() {
        let (mut original, _) = mid_protocol_engine();
        let mut restored = Engine::deserialize(&original.serialize().unwrap()).unwrap();

        original.run_until_idle(100);
        restored.run_until_idle(100);
        assert_eq!(original.trace_hash(), restored.trace_hash());

        let delivered = restored
            .drain_events()
            .into_iter()
            .filter(|e| e.kind() == EventKind::DataReceived)
            .count();
        assert_eq!(delivered, 1);
    }

    #[test]
    fn pending_commands_survive() {
        let (mut engine, net) = hybrid_engine(EngineConfig::default());
        engine.send_message(net.h1, net.h2, "later").unwrap();
        let restored = Engine::deserialize(&engine.serialize().unwrap()).unwrap();
        assert_eq!(restored.pending_commands(), 1);
    }

    #[test]
    fn garbage_is_a_decode_error() {
        match Engine::deserialize(&[0u8; 10]) {
            Err(DeserializeError::Decode(_)) => {}
            Err(other) => panic!("expected Decode error, got: {other}"),
            Ok(_) => panic!("expected error, got Ok"),
        }
    }

    #[test]
    fn header_validation() {
        assert!(SnapshotHeader::new(0).validate().is_ok());

        let bad_magic = SnapshotHeader {
            magic: 0xDEAD_BEEF,
            ..SnapshotHeader::new(0)
        };
        assert!(matches!(
            bad_magic.validate(),
            Err(DeserializeError::InvalidMagic(0xDEAD_BEEF))
        ));

        let future = SnapshotHeader {
            version: FORMAT_VERSION + 1,
            ..SnapshotHeader::new(0)
        };
        assert!(matches!(
            future.validate(),
            Err(DeserializeError::FutureVersion(_))
        ));

        let old = SnapshotHeader {
            version: 0,
            ..SnapshotHeader::new(0)
        };
        assert!(matches!(
            old.validate(),
            Err(DeserializeError::UnsupportedVersion(0))
        ));
    }

    #[test]
    fn header_records_tick() {
        let (engine, _) = mid_protocol_engine();
        let header = read_snapshot_header(&engine.serialize().unwrap()).unwrap();
        assert_eq!(header.tick, 5);
    }

    #[test]
    fn ring_buffer_evicts_oldest() {
        let mut buffer = SnapshotRingBuffer::new(2);
        for tick in 0..3 {
            buffer.push(SnapshotEntry {
                tick,
                data: Vec::new(),
            });
        }
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.total_taken(), 3);
        assert_eq!(buffer.get(0).unwrap().tick, 1);
        assert_eq!(buffer.latest().unwrap().tick, 2);
        assert!(buffer.get(2).is_none());
    }

    #[test]
    fn ring_buffer_zero_capacity_clamped() {
        assert_eq!(SnapshotRingBuffer::new(0).capacity(), 1);
    }

    #[test]
    fn take_and_restore_snapshot() {
        let (mut engine, _) = mid_protocol_engine();
        let mut buffer = SnapshotRingBuffer::new(4);
        engine.take_snapshot(&mut buffer).unwrap();
        let hash_at_snapshot = engine.state_hash();
        engine.step();

        let restored = Engine::restore_snapshot(&buffer, 0).unwrap().unwrap();
        assert_eq!(restored.state_hash(), hash_at_snapshot);
        assert!(Engine::restore_snapshot(&buffer, 1).unwrap().is_none());
    }
}
