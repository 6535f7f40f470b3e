//! BB84 key distribution between an adapter pair.
//!
//! A [`QkdSession`] is a message-driven state machine advanced by the engine
//! one protocol step per tick:
//!
//! ```text
//! Init -> QubitTransmission -> BasisReconciliation -> ErrorEstimation -> Confirmed
//!                                      |                     |
//!                                      +------> Aborted <----+
//! ```
//!
//! Aborted sessions may be retried with an escalated batch size until the
//! configured attempt budget is spent. The shared key is only observable
//! once the session is Confirmed.

use crate::channel::{Basis, Measurement, QuantumChannel, Qubit, QubitEvent};
use crate::cipher::pack_bits;
use crate::fixed::{Fixed64, ceil_fraction, f64_to_fixed64, fixed64_to_f64, is_probability, ratio};
use crate::id::{AdapterPair, LinkId, NodeId};
use crate::rng::SimRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Protocol parameters shared by every session of an engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QkdConfig {
    /// Qubits sent on the first attempt.
    pub qubit_count: usize,
    /// Fraction of sifted bits disclosed for error estimation, in (0, 1).
    pub sample_fraction: Fixed64,
    /// Highest tolerated error rate, in [0, 1].
    pub error_threshold: Fixed64,
    /// Total runs allowed per key request, including the first.
    pub max_attempts: u32,
    /// Batch size multiplier applied after each abort.
    pub batch_escalation: u32,
    /// Upper bound on the escalated batch size.
    pub max_qubit_count: usize,
}

/// Largest batch a session may send. Counts above this do not fit the
/// integer part of [`Fixed64`].
pub const MAX_QUBIT_COUNT: usize = i32::MAX as usize;

impl Default for QkdConfig {
    fn default() -> Self {
        Self {
            qubit_count: 64,
            sample_fraction: f64_to_fixed64(0.25),
            error_threshold: f64_to_fixed64(0.11),
            max_attempts: 3,
            batch_escalation: 2,
            max_qubit_count: 1024,
        }
    }
}

impl QkdConfig {
    pub fn validate(&self) -> Result<(), QkdError> {
        let invalid = |msg: String| -> Result<(), QkdError> {
            Err(QkdError::InvalidQkdConfig(msg))
        };
        if self.qubit_count < 1 {
            return invalid("qubit_count must be at least 1".into());
        }
        if self.sample_fraction <= Fixed64::ZERO || self.sample_fraction >= Fixed64::ONE {
            return invalid(format!(
                "sample_fraction {} must lie strictly between 0 and 1",
                self.sample_fraction
            ));
        }
        if !is_probability(self.error_threshold) {
            return invalid(format!("error_threshold {} must lie in [0, 1]", self.error_threshold));
        }
        if self.max_attempts < 1 {
            return invalid("max_attempts must be at least 1".into());
        }
        if self.batch_escalation < 1 {
            return invalid("batch_escalation must be at least 1".into());
        }
        if self.max_qubit_count > MAX_QUBIT_COUNT {
            return invalid(format!(
                "max_qubit_count {} exceeds {MAX_QUBIT_COUNT}",
                self.max_qubit_count
            ));
        }
        if self.max_qubit_count < self.qubit_count {
            return invalid(format!(
                "max_qubit_count {} is below qubit_count {}",
                self.max_qubit_count, self.qubit_count
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Errors and abort reasons
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum QkdError {
    #[error("invalid QKD configuration: {0}")]
    InvalidQkdConfig(String),
    #[error("{0:?} and {1:?} are not an adapter pair")]
    NotAnAdapterPair(NodeId, NodeId),
    #[error("no quantum path between {0:?} and {1:?}")]
    NoQuantumPath(NodeId, NodeId),
    #[error("key establishment failed for {pair:?} after {attempts} attempt(s): {reason}")]
    KeyEstablishmentFailed {
        pair: AdapterPair,
        attempts: u32,
        reason: AbortReason,
    },
}

/// Why a protocol run ended in [`QkdPhase::Aborted`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    NoMatchingBases,
    ErrorRateExceeded,
    EmptyKeyMaterial,
    ChannelUnavailable,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AbortReason::NoMatchingBases => "no matching bases",
            AbortReason::ErrorRateExceeded => "error rate above threshold",
            AbortReason::EmptyKeyMaterial => "empty key material",
            AbortReason::ChannelUnavailable => "quantum channel unavailable",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Phases and messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QkdPhase {
    Init,
    QubitTransmission,
    BasisReconciliation,
    ErrorEstimation,
    Confirmed,
    Aborted,
}

impl QkdPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, QkdPhase::Confirmed | QkdPhase::Aborted)
    }
}

/// The next classical message a session will put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum PendingMessage {
    SharedBases,
    Reconcile,
    Estimate,
    Complete,
}

/// A disclosed sifted bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleBit {
    pub index: usize,
    pub bit: bool,
}

/// Classical protocol traffic exchanged between the two adapters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProtocolMessage {
    /// Responder's measurement bases.
    SharedBasesIndices { sender: NodeId, bases: Vec<Basis> },
    /// Transcript positions where both bases matched.
    ReconcileBases { sender: NodeId, indices: Vec<usize> },
    /// Initiator's disclosed sample.
    EstimateErrorRate { sender: NodeId, sample: Vec<SampleBit> },
    /// Responder accepts the key.
    Complete {
        sender: NodeId,
        error_rate: f64,
        key_length_bits: usize,
    },
}

impl ProtocolMessage {
    pub fn sender(&self) -> NodeId {
        match self {
            ProtocolMessage::SharedBasesIndices { sender, .. }
            | ProtocolMessage::ReconcileBases { sender, .. }
            | ProtocolMessage::EstimateErrorRate { sender, .. }
            | ProtocolMessage::Complete { sender, .. } => *sender,
        }
    }
}

/// What a single [`QkdSession::advance`] step produced.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutput {
    Initiated { qubit_count: usize, attempt: u32 },
    Measured { qubit_count: usize },
    Message { receiver: NodeId, message: ProtocolMessage },
    Confirmed { key_length_bits: usize, error_rate: Fixed64 },
    Aborted { reason: AbortReason, detected_at: NodeId },
}

// ---------------------------------------------------------------------------
// Shared key
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedKey {
    bits: Vec<bool>,
}

impl SharedKey {
    pub fn from_bits(bits: Vec<bool>) -> Self {
        Self { bits }
    }

    pub fn bits(&self) -> &[bool] {
        &self.bits
    }

    pub fn len_bits(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Key bits packed MSB-first.
    pub fn to_bytes(&self) -> Vec<u8> {
        pack_bits(&self.bits)
    }
}

// ---------------------------------------------------------------------------
// Protocol primitives
// ---------------------------------------------------------------------------

/// Positions where sender and receiver chose the same basis.
pub fn sift(sender_bases: &[Basis], receiver_bases: &[Basis]) -> Vec<usize> {
    sender_bases
        .iter()
        .zip(receiver_bases)
        .enumerate()
        .filter(|(_, (s, r))| s == r)
        .map(|(i, _)| i)
        .collect()
}

/// Fraction of `sample` positions where `sent` and `received` disagree.
pub fn estimate_error_rate(sent: &[bool], received: &[bool], sample: &[usize]) -> Fixed64 {
    let mismatches = sample
        .iter()
        .filter(|&&i| sent.get(i) != received.get(i))
        .count();
    ratio(mismatches, sample.len())
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One key-establishment effort between an adapter pair, including retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QkdSession {
    pair: AdapterPair,
    initiator: NodeId,
    responder: NodeId,
    phase: QkdPhase,
    /// 1-based run counter.
    attempt: u32,
    batch_size: usize,
    /// Classical link joining the pair.
    secure_link: Option<LinkId>,
    /// Quantum links the qubits travel, in path order.
    quantum_links: Vec<LinkId>,
    transcript: Vec<QubitEvent>,
    sifted: Vec<usize>,
    sample: Vec<usize>,
    error_rate: Option<Fixed64>,
    key: Option<SharedKey>,
    pending: Option<PendingMessage>,
    last_abort: Option<AbortReason>,
}

impl QkdSession {
    /// A fresh session in [`QkdPhase::Init`]. `config` is assumed validated.
    pub fn new(initiator: NodeId, responder: NodeId, config: &QkdConfig) -> Self {
        Self {
            pair: AdapterPair::new(initiator, responder),
            initiator,
            responder,
            phase: QkdPhase::Init,
            attempt: 1,
            batch_size: config.qubit_count,
            secure_link: None,
            quantum_links: Vec::new(),
            transcript: Vec::new(),
            sifted: Vec::new(),
            sample: Vec::new(),
            error_rate: None,
            key: None,
            pending: None,
            last_abort: None,
        }
    }

    pub fn pair(&self) -> AdapterPair {
        self.pair
    }

    pub fn initiator(&self) -> NodeId {
        self.initiator
    }

    pub fn responder(&self) -> NodeId {
        self.responder
    }

    pub fn phase(&self) -> QkdPhase {
        self.phase
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn transcript(&self) -> &[QubitEvent] {
        &self.transcript
    }

    pub fn sifted_indices(&self) -> &[usize] {
        &self.sifted
    }

    pub fn sample_indices(&self) -> &[usize] {
        &self.sample
    }

    pub fn error_rate(&self) -> Option<Fixed64> {
        self.error_rate
    }

    pub fn last_abort(&self) -> Option<AbortReason> {
        self.last_abort
    }

    /// Record the links this session relies on.
    pub fn with_links(mut self, secure_link: LinkId, quantum_links: Vec<LinkId>) -> Self {
        self.secure_link = Some(secure_link);
        self.quantum_links = quantum_links;
        self
    }

    pub fn secure_link(&self) -> Option<LinkId> {
        self.secure_link
    }

    pub fn quantum_links(&self) -> &[LinkId] {
        &self.quantum_links
    }

    pub fn uses_link(&self, link: LinkId) -> bool {
        self.secure_link == Some(link) || self.quantum_links.contains(&link)
    }

    /// The established key. `None` unless the session is Confirmed.
    pub fn shared_key(&self) -> Option<&SharedKey> {
        match self.phase {
            QkdPhase::Confirmed => self.key.as_ref(),
            _ => None,
        }
    }

    pub fn sender_bases(&self) -> Vec<Basis> {
        self.transcript.iter().map(|e| e.sender_basis).collect()
    }

    pub fn receiver_bases(&self) -> Vec<Basis> {
        self.transcript
            .iter()
            .filter_map(|e| e.measurement.map(|m| m.basis))
            .collect()
    }

    fn sent_bits(&self) -> Vec<bool> {
        self.transcript.iter().map(|e| e.sent_bit).collect()
    }

    fn measured_bits(&self) -> Vec<bool> {
        self.transcript
            .iter()
            .map(|e| e.measurement.is_some_and(|m| m.bit))
            .collect()
    }

    /// Run one protocol step.
    pub fn advance(&mut self, channel: &QuantumChannel, config: &QkdConfig, rng: &mut SimRng) -> Vec<SessionOutput> {
        match self.phase {
            QkdPhase::Init => {
                self.transmit(channel, rng);
                self.phase = QkdPhase::QubitTransmission;
                vec![SessionOutput::Initiated {
                    qubit_count: self.batch_size,
                    attempt: self.attempt,
                }]
            }
            QkdPhase::QubitTransmission => {
                self.measure(rng);
                self.phase = QkdPhase::BasisReconciliation;
                self.pending = Some(PendingMessage::SharedBases);
                vec![SessionOutput::Measured {
                    qubit_count: self.transcript.len(),
                }]
            }
            QkdPhase::BasisReconciliation => match self.pending {
                Some(PendingMessage::SharedBases) => {
                    self.pending = Some(PendingMessage::Reconcile);
                    vec![SessionOutput::Message {
                        receiver: self.initiator,
                        message: ProtocolMessage::SharedBasesIndices {
                            sender: self.responder,
                            bases: self.receiver_bases(),
                        },
                    }]
                }
                Some(PendingMessage::Reconcile) => self.reconcile(config, rng),
                _ => Vec::new(),
            },
            QkdPhase::ErrorEstimation => match self.pending {
                Some(PendingMessage::Estimate) => self.estimate(config),
                Some(PendingMessage::Complete) => self.complete(),
                _ => Vec::new(),
            },
            QkdPhase::Confirmed | QkdPhase::Aborted => Vec::new(),
        }
    }

    fn transmit(&mut self, channel: &QuantumChannel, rng: &mut SimRng) {
        self.transcript = (0..self.batch_size)
            .map(|_| {
                let sent = Qubit {
                    bit: rng.next_bit(),
                    basis: Basis::random(rng),
                };
                let arrived = channel.transmit(sent, rng);
                QubitEvent {
                    sender_basis: sent.basis,
                    sent_bit: sent.bit,
                    arrived_bit: arrived.bit,
                    measurement: None,
                }
            })
            .collect();
        debug!(pair = ?self.pair, qubits = self.batch_size, attempt = self.attempt, "qubits transmitted");
    }

    fn measure(&mut self, rng: &mut SimRng) {
        for event in &mut self.transcript {
            let basis = Basis::random(rng);
            let bit = event.arrived().measure(basis, rng);
            event.measurement = Some(Measurement { basis, bit });
        }
    }

    fn reconcile(&mut self, config: &QkdConfig, rng: &mut SimRng) -> Vec<SessionOutput> {
        self.sifted = sift(&self.sender_bases(), &self.receiver_bases());
        let mut out = vec![SessionOutput::Message {
            receiver: self.responder,
            message: ProtocolMessage::ReconcileBases {
                sender: self.initiator,
                indices: self.sifted.clone(),
            },
        }];
        if self.sifted.is_empty() {
            out.push(self.abort(AbortReason::NoMatchingBases));
            return out;
        }
        let k = ceil_fraction(config.sample_fraction, self.sifted.len());
        self.sample = rng
            .sample_indices(self.sifted.len(), k)
            .into_iter()
            .map(|p| self.sifted[p])
            .collect();
        debug!(pair = ?self.pair, sifted = self.sifted.len(), sample = self.sample.len(), "bases reconciled");
        self.phase = QkdPhase::ErrorEstimation;
        self.pending = Some(PendingMessage::Estimate);
        out
    }

    fn estimate(&mut self, config: &QkdConfig) -> Vec<SessionOutput> {
        let sent = self.sent_bits();
        let rate = estimate_error_rate(&sent, &self.measured_bits(), &self.sample);
        self.error_rate = Some(rate);
        let sample = self
            .sample
            .iter()
            .map(|&index| SampleBit {
                index,
                bit: sent[index],
            })
            .collect();
        let mut out = vec![SessionOutput::Message {
            receiver: self.responder,
            message: ProtocolMessage::EstimateErrorRate {
                sender: self.initiator,
                sample,
            },
        }];
        if rate > config.error_threshold {
            out.push(self.abort(AbortReason::ErrorRateExceeded));
        } else {
            self.pending = Some(PendingMessage::Complete);
        }
        out
    }

    fn complete(&mut self) -> Vec<SessionOutput> {
        let bits: Vec<bool> = self
            .sifted
            .iter()
            .filter(|&&i| !self.sample.contains(&i))
            .map(|&i| self.transcript[i].sent_bit)
            .collect();
        let key_length_bits = bits.len();
        let error_rate = self.error_rate.unwrap_or(Fixed64::ZERO);
        self.key = Some(SharedKey::from_bits(bits));
        self.phase = QkdPhase::Confirmed;
        self.pending = None;
        vec![
            SessionOutput::Message {
                receiver: self.initiator,
                message: ProtocolMessage::Complete {
                    sender: self.responder,
                    error_rate: fixed64_to_f64(error_rate),
                    key_length_bits,
                },
            },
            SessionOutput::Confirmed {
                key_length_bits,
                error_rate,
            },
        ]
    }

    /// End the current run. The responder is where every abort is detected
    /// except an unusable confirmed key, which the initiator discovers.
    pub fn abort(&mut self, reason: AbortReason) -> SessionOutput {
        let detected_at = match reason {
            AbortReason::EmptyKeyMaterial => self.initiator,
            _ => self.responder,
        };
        self.phase = QkdPhase::Aborted;
        self.pending = None;
        self.key = None;
        self.last_abort = Some(reason);
        SessionOutput::Aborted { reason, detected_at }
    }

    /// Start another run with an escalated batch, or fail once the attempt
    /// budget is spent.
    pub fn retry(&mut self, config: &QkdConfig) -> Result<(), QkdError> {
        if self.attempt >= config.max_attempts {
            return Err(QkdError::KeyEstablishmentFailed {
                pair: self.pair,
                attempts: self.attempt,
                reason: self.last_abort.unwrap_or(AbortReason::NoMatchingBases),
            });
        }
        self.attempt += 1;
        self.batch_size = self
            .batch_size
            .saturating_mul(config.batch_escalation as usize)
            .min(config.max_qubit_count);
        self.phase = QkdPhase::Init;
        self.transcript.clear();
        self.sifted.clear();
        self.sample.clear();
        self.error_rate = None;
        self.key = None;
        self.pending = None;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Session table
// ---------------------------------------------------------------------------

/// All live sessions, keyed by adapter pair. At most one per pair.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionTable {
    sessions: BTreeMap<AdapterPair, QkdSession>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, pair: AdapterPair) -> Option<&QkdSession> {
        self.sessions.get(&pair)
    }

    pub fn get_mut(&mut self, pair: AdapterPair) -> Option<&mut QkdSession> {
        self.sessions.get_mut(&pair)
    }

    pub fn insert(&mut self, session: QkdSession) {
        self.sessions.insert(session.pair(), session);
    }

    pub fn remove(&mut self, pair: AdapterPair) -> Option<QkdSession> {
        self.sessions.remove(&pair)
    }

    pub fn contains(&self, pair: AdapterPair) -> bool {
        self.sessions.contains_key(&pair)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn clear(&mut self) {
        self.sessions.clear();
    }

    /// Pairs in ascending order.
    pub fn pairs(&self) -> Vec<AdapterPair> {
        self.sessions.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AdapterPair, &QkdSession)> {
        self.sessions.iter()
    }

    /// Pairs whose session depends on `link`.
    pub fn dependent_on(&self, link: LinkId) -> Vec<AdapterPair> {
        self.sessions
            .iter()
            .filter(|(_, s)| s.uses_link(link))
            .map(|(p, _)| *p)
            .collect()
    }

    /// Whether any session is still mid-protocol.
    pub fn any_in_progress(&self) -> bool {
        self.sessions.values().any(|s| !s.phase().is_terminal())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    fn pair_ids() -> (NodeId, NodeId) {
        let mut sm = SlotMap::<NodeId, ()>::with_key();
        (sm.insert(()), sm.insert(()))
    }

    fn run_to_end(session: &mut QkdSession, channel: &QuantumChannel, config: &QkdConfig, rng: &mut SimRng) -> Vec<SessionOutput> {
        let mut all = Vec::new();
        for _ in 0..16 {
            if session.phase().is_terminal() {
                break;
            }
            all.extend(session.advance(channel, config, rng));
        }
        all
    }

    // -----------------------------------------------------------------------
    // Config validation
    // -----------------------------------------------------------------------

    #[test]
    fn default_config_is_valid() {
        assert!(QkdConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_qubits_rejected() {
        let config = QkdConfig {
            qubit_count: 0,
            ..QkdConfig::default()
        };
        assert!(matches!(config.validate(), Err(QkdError::InvalidQkdConfig(_))));
    }

    #[test]
    fn oversized_batch_rejected() {
        let config = QkdConfig {
            qubit_count: 64,
            max_qubit_count: MAX_QUBIT_COUNT + 1,
            ..QkdConfig::default()
        };
        assert!(matches!(config.validate(), Err(QkdError::InvalidQkdConfig(_))));

        let config = QkdConfig {
            qubit_count: MAX_QUBIT_COUNT,
            max_qubit_count: MAX_QUBIT_COUNT,
            ..QkdConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn sample_fraction_must_be_open_interval() {
        for bad in [0.0, 1.0, 1.5] {
            let config = QkdConfig {
                sample_fraction: f64_to_fixed64(bad),
                ..QkdConfig::default()
            };
            assert!(config.validate().is_err(), "fraction {bad} accepted");
        }
    }

    // -----------------------------------------------------------------------
    // Primitives
    // -----------------------------------------------------------------------

    #[test]
    fn sift_keeps_matching_positions() {
        use Basis::*;
        let s = [Rectilinear, Diagonal, Diagonal, Rectilinear];
        let r = [Rectilinear, Rectilinear, Diagonal, Diagonal];
        assert_eq!(sift(&s, &r), vec![0, 2]);
    }

    #[test]
    fn error_rate_over_sample() {
        let sent = [true, true, false, false];
        let recv = [true, false, false, true];
        assert_eq!(estimate_error_rate(&sent, &recv, &[0, 1]), f64_to_fixed64(0.5));
        assert_eq!(estimate_error_rate(&sent, &recv, &[0, 2]), Fixed64::ZERO);
        assert_eq!(estimate_error_rate(&sent, &recv, &[]), Fixed64::ZERO);
    }

    // -----------------------------------------------------------------------
    // Protocol runs
    // -----------------------------------------------------------------------

    #[test]
    fn noiseless_run_confirms_key() {
        let (a, b) = pair_ids();
        let config = QkdConfig::default();
        let channel = QuantumChannel::new(vec![Fixed64::ZERO; 3]);
        let mut rng = SimRng::new(42);
        let mut session = QkdSession::new(a, b, &config);
        assert!(session.shared_key().is_none());

        let outputs = run_to_end(&mut session, &channel, &config, &mut rng);
        assert_eq!(session.phase(), QkdPhase::Confirmed);
        assert_eq!(session.error_rate(), Some(Fixed64::ZERO));

        let key = session.shared_key().unwrap();
        assert_eq!(
            key.len_bits(),
            session.sifted_indices().len() - session.sample_indices().len()
        );
        assert!(matches!(outputs.last(), Some(SessionOutput::Confirmed { .. })));
    }

    #[test]
    fn message_order_follows_protocol() {
        let (a, b) = pair_ids();
        let config = QkdConfig::default();
        let channel = QuantumChannel::new(vec![Fixed64::ZERO]);
        let mut rng = SimRng::new(7);
        let mut session = QkdSession::new(a, b, &config);
        let outputs = run_to_end(&mut session, &channel, &config, &mut rng);
        let kinds: Vec<&str> = outputs
            .iter()
            .filter_map(|o| match o {
                SessionOutput::Message { message, .. } => Some(match message {
                    ProtocolMessage::SharedBasesIndices { .. } => "shared",
                    ProtocolMessage::ReconcileBases { .. } => "reconcile",
                    ProtocolMessage::EstimateErrorRate { .. } => "estimate",
                    ProtocolMessage::Complete { .. } => "complete",
                }),
                _ => None,
            })
            .collect();
        assert_eq!(kinds, vec!["shared", "reconcile", "estimate", "complete"]);
    }

    #[test]
    fn sifted_indices_match_bases() {
        let (a, b) = pair_ids();
        let config = QkdConfig::default();
        let channel = QuantumChannel::new(vec![Fixed64::ZERO]);
        let mut rng = SimRng::new(99);
        let mut session = QkdSession::new(a, b, &config);
        run_to_end(&mut session, &channel, &config, &mut rng);
        let expected: Vec<usize> = session
            .transcript()
            .iter()
            .enumerate()
            .filter(|(_, e)| e.measurement.map(|m| m.basis) == Some(e.sender_basis))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(session.sifted_indices(), expected.as_slice());
    }

    #[test]
    fn full_noise_aborts_on_error_rate() {
        let (a, b) = pair_ids();
        let config = QkdConfig::default();
        let channel = QuantumChannel::new(vec![Fixed64::ONE]);
        let mut rng = SimRng::new(3);
        let mut session = QkdSession::new(a, b, &config);
        let outputs = run_to_end(&mut session, &channel, &config, &mut rng);
        assert_eq!(session.phase(), QkdPhase::Aborted);
        assert_eq!(session.error_rate(), Some(Fixed64::ONE));
        assert!(session.shared_key().is_none());
        assert!(matches!(
            outputs.last(),
            Some(SessionOutput::Aborted {
                reason: AbortReason::ErrorRateExceeded,
                detected_at
            }) if *detected_at == b
        ));
    }

    #[test]
    fn retry_escalates_then_fails() {
        let (a, b) = pair_ids();
        let config = QkdConfig {
            qubit_count: 16,
            max_qubit_count: 40,
            ..QkdConfig::default()
        };
        let mut session = QkdSession::new(a, b, &config);
        session.abort(AbortReason::ErrorRateExceeded);
        session.retry(&config).unwrap();
        assert_eq!(session.attempt(), 2);
        assert_eq!(session.batch_size(), 32);
        assert_eq!(session.phase(), QkdPhase::Init);

        session.abort(AbortReason::ErrorRateExceeded);
        session.retry(&config).unwrap();
        assert_eq!(session.batch_size(), 40);

        session.abort(AbortReason::ErrorRateExceeded);
        let err = session.retry(&config).unwrap_err();
        assert_eq!(
            err,
            QkdError::KeyEstablishmentFailed {
                pair: AdapterPair::new(a, b),
                attempts: 3,
                reason: AbortReason::ErrorRateExceeded,
            }
        );
    }

    #[test]
    fn table_tracks_link_dependencies() {
        let (a, b) = pair_ids();
        let mut links = SlotMap::<LinkId, ()>::with_key();
        let l1 = links.insert(());
        let l2 = links.insert(());
        let mut table = SessionTable::new();
        table.insert(QkdSession::new(a, b, &QkdConfig::default()).with_links(l1, Vec::new()));
        assert_eq!(table.dependent_on(l1), vec![AdapterPair::new(a, b)]);
        assert!(table.dependent_on(l2).is_empty());
        assert!(table.any_in_progress());
    }

    #[test]
    fn protocol_message_json_is_tagged() {
        let (a, _) = pair_ids();
        let msg = ProtocolMessage::ReconcileBases {
            sender: a,
            indices: vec![1, 4],
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "reconcile_bases");
        assert_eq!(json["indices"], serde_json::json!([1, 4]));
    }
}
