//! Replay recording and playback.
//!
//! A [`ReplayLog`] holds an initial engine snapshot and the client commands
//! applied after it. Playing the log back against the snapshot must produce
//! the same state hashes at every recorded checkpoint.

use crate::engine::{Engine, EngineError};
use crate::id::{LinkId, NodeId};
use crate::qkd::QkdConfig;
use crate::serialize::{DeserializeError, SerializeError};
use crate::topology::{LinkSpec, NodeKind};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ReplayCommand
// ---------------------------------------------------------------------------

/// A client operation that can be recorded and replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReplayCommand {
    Step,
    Advance {
        dt: u64,
    },
    Start,
    Stop,
    Reset,
    SendMessage {
        source: NodeId,
        destination: NodeId,
        payload: Vec<u8>,
    },
    RequestKey {
        initiator: NodeId,
        responder: NodeId,
    },
    SetQkdConfig {
        config: QkdConfig,
    },
    AddNode {
        name: String,
        kind: NodeKind,
        address: String,
    },
    RemoveNode {
        node: NodeId,
    },
    AddLink {
        a: NodeId,
        b: NodeId,
        spec: LinkSpec,
    },
    RemoveLink {
        link: LinkId,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("cannot restore initial snapshot: {0}")]
    Snapshot(#[from] DeserializeError),
}

/// Where replay verification first diverged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayMismatch {
    pub command_index: usize,
    pub expected_hash: u64,
    pub actual_hash: u64,
}

// ---------------------------------------------------------------------------
// ReplayLog
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayLog {
    /// Engine snapshot taken when recording began.
    pub initial_snapshot: Vec<u8>,
    pub commands: Vec<ReplayCommand>,
    /// (command index, state hash after that command).
    pub hash_checkpoints: Vec<(usize, u64)>,
}

impl ReplayLog {
    /// Start recording from the engine's current state.
    pub fn new(engine: &Engine) -> Result<Self, SerializeError> {
        Ok(Self {
            initial_snapshot: engine.serialize()?,
            commands: Vec::new(),
            hash_checkpoints: Vec::new(),
        })
    }

    pub fn record(&mut self, cmd: ReplayCommand) {
        self.commands.push(cmd);
    }

    pub fn record_with_hash(&mut self, cmd: ReplayCommand, hash: u64) {
        let index = self.commands.len();
        self.commands.push(cmd);
        self.hash_checkpoints.push((index, hash));
    }

    /// Apply `cmd` to `engine` and record it with the resulting state hash.
    /// The command is recorded even when the engine rejects it, since replay
    /// must observe the same rejection.
    pub fn apply(&mut self, engine: &mut Engine, cmd: ReplayCommand) -> Result<(), EngineError> {
        let outcome = apply_command(engine, &cmd);
        self.record_with_hash(cmd, engine.state_hash());
        outcome
    }

    pub fn command_count(&self) -> usize {
        self.commands.len()
    }

    pub fn serialize(&self) -> Result<Vec<u8>, SerializeError> {
        bitcode::serialize(self).map_err(|e| SerializeError::Encode(e.to_string()))
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, DeserializeError> {
        bitcode::deserialize(data).map_err(|e| DeserializeError::Decode(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// ReplayResult
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ReplayResult {
    pub commands_executed: usize,
    /// Commands the engine rejected during playback, by index.
    pub rejected: Vec<(usize, EngineError)>,
    pub is_verified: bool,
    pub first_mismatch: Option<ReplayMismatch>,
    /// Trace hash of the replayed engine after the last command.
    pub trace_hash: u64,
}

// ---------------------------------------------------------------------------
// Replay execution
// ---------------------------------------------------------------------------

/// Apply a single command to an engine.
pub fn apply_command(engine: &mut Engine, cmd: &ReplayCommand) -> Result<(), EngineError> {
    match cmd {
        ReplayCommand::Step => {
            engine.step();
        }
        ReplayCommand::Advance { dt } => {
            engine.advance(*dt);
        }
        ReplayCommand::Start => {
            engine.start();
        }
        ReplayCommand::Stop => {
            engine.stop();
        }
        ReplayCommand::Reset => engine.reset()?,
        ReplayCommand::SendMessage {
            source,
            destination,
            payload,
        } => {
            engine.send_message(*source, *destination, payload.clone())?;
        }
        ReplayCommand::RequestKey {
            initiator,
            responder,
        } => engine.request_key(*initiator, *responder)?,
        ReplayCommand::SetQkdConfig { config } => engine.set_qkd_config(config.clone())?,
        ReplayCommand::AddNode {
            name,
            kind,
            address,
        } => {
            engine.add_node(name.clone(), *kind, address.clone())?;
        }
        ReplayCommand::RemoveNode { node } => engine.remove_node(*node)?,
        ReplayCommand::AddLink { a, b, spec } => {
            engine.add_link(*a, *b, *spec)?;
        }
        ReplayCommand::RemoveLink { link } => engine.remove_link(*link)?,
    }
    Ok(())
}

/// Replay a log, comparing state hashes at every checkpoint.
pub fn replay_and_verify(log: &ReplayLog) -> Result<ReplayResult, ReplayError> {
    let mut engine = Engine::deserialize(&log.initial_snapshot)?;

    let mut first_mismatch = None;
    let mut rejected = Vec::new();
    let mut checkpoints = log.hash_checkpoints.iter().peekable();

    for (i, cmd) in log.commands.iter().enumerate() {
        if let Err(e) = apply_command(&mut engine, cmd) {
            rejected.push((i, e));
        }
        while let Some(&(_, expected_hash)) = checkpoints.next_if(|(index, _)| *index == i) {
            let actual_hash = engine.state_hash();
            if actual_hash != expected_hash && first_mismatch.is_none() {
                first_mismatch = Some(ReplayMismatch {
                    command_index: i,
                    expected_hash,
                    actual_hash,
                });
            }
        }
    }

    Ok(ReplayResult {
        commands_executed: log.commands.len(),
        rejected,
        is_verified: first_mismatch.is_none(),
        first_mismatch,
        trace_hash: engine.trace_hash(),
    })
}

/// Replay a log without verification, returning the final engine.
pub fn replay(log: &ReplayLog) -> Result<Engine, ReplayError> {
    let mut engine = Engine::deserialize(&log.initial_snapshot)?;
    for cmd in &log.commands {
        // Rejections are part of the recorded behavior.
        let _ = apply_command(&mut engine, cmd);
    }
    Ok(engine)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use crate::test_utils::*;

    fn recorded_session() -> (Engine, ReplayLog) {
        let (mut engine, net) = hybrid_engine(EngineConfig::default());
        let mut log = ReplayLog::new(&engine).unwrap();
        log.apply(&mut engine, ReplayCommand::Start).unwrap();
        log.apply(
            &mut engine,
            ReplayCommand::SendMessage {
                source: net.h1,
                destination: net.h2,
                payload: b"hi".to_vec(),
            },
        )
        .unwrap();
        for _ in 0..12 {
            log.apply(&mut engine, ReplayCommand::Step).unwrap();
        }
        (engine, log)
    }

    #[test]
    fn replay_verify_passes() {
        let (engine, log) = recorded_session();
        let result = replay_and_verify(&log).unwrap();
        assert!(result.is_verified);
        assert_eq!(result.commands_executed, 14);
        assert!(result.rejected.is_empty());
        assert_eq!(result.trace_hash, engine.trace_hash());
    }

    #[test]
    fn replay_verify_detects_mismatch() {
        let (engine, _) = hybrid_engine(EngineConfig::default());
        let mut log = ReplayLog::new(&engine).unwrap();
        log.record(ReplayCommand::Start);
        log.hash_checkpoints.push((0, 0xDEAD_BEEF));

        let result = replay_and_verify(&log).unwrap();
        assert!(!result.is_verified);
        let mismatch = result.first_mismatch.unwrap();
        assert_eq!(mismatch.command_index, 0);
        assert_eq!(mismatch.expected_hash, 0xDEAD_BEEF);
    }

    #[test]
    fn rejected_commands_replay_as_rejected() {
        let (mut engine, net) = hybrid_engine(EngineConfig::default());
        let mut log = ReplayLog::new(&engine).unwrap();
        let bad = ReplayCommand::SendMessage {
            source: net.r1,
            destination: net.h2,
            payload: Vec::new(),
        };
        assert!(log.apply(&mut engine, bad).is_err());

        let result = replay_and_verify(&log).unwrap();
        assert!(result.is_verified);
        assert_eq!(result.rejected.len(), 1);
        assert!(matches!(
            result.rejected[0],
            (0, EngineError::InvalidEndpoint { .. })
        ));
    }

    #[test]
    fn topology_edits_replay_with_same_ids() {
        let (mut engine, net) = hybrid_engine(EngineConfig::default());
        let mut log = ReplayLog::new(&engine).unwrap();
        log.apply(
            &mut engine,
            ReplayCommand::AddNode {
                name: "H3".into(),
                kind: NodeKind::ClassicalHost,
                address: "10.0.2.1".into(),
            },
        )
        .unwrap();
        let h3 = engine.find_node("H3").unwrap();
        log.apply(
            &mut engine,
            ReplayCommand::AddLink {
                a: net.r2,
                b: h3,
                spec: LinkSpec::classical(),
            },
        )
        .unwrap();
        log.apply(&mut engine, ReplayCommand::RemoveLink { link: net.h1_r1 })
            .unwrap();

        let replayed = replay(&log).unwrap();
        assert_eq!(replayed.find_node("H3"), Some(h3));
        assert_eq!(replayed.topology().link_count(), engine.topology().link_count());
        assert!(replay_and_verify(&log).unwrap().is_verified);
    }

    #[test]
    fn replay_round_trip_serialize() {
        let (_, log) = recorded_session();
        let restored = ReplayLog::deserialize(&log.serialize().unwrap()).unwrap();
        assert_eq!(restored.command_count(), log.command_count());
        assert_eq!(restored.hash_checkpoints, log.hash_checkpoints);
        assert!(replay_and_verify(&restored).unwrap().is_verified);
    }

    #[test]
    fn corrupt_snapshot_is_an_error() {
        let log = ReplayLog {
            initial_snapshot: vec![1, 2, 3],
            commands: vec![ReplayCommand::Step],
            hash_checkpoints: Vec::new(),
        };
        assert!(matches!(replay(&log), Err(ReplayError::Snapshot(_))));
    }
}
