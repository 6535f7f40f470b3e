//! Qubits and the noisy quantum channel.
//!
//! Qubits are abstract two-state values tagged with an encoding basis.
//! Each traversed link independently flips the bit with that link's error
//! probability; the basis is never altered and relays never measure.

use crate::fixed::Fixed64;
use crate::id::LinkId;
use crate::rng::SimRng;
use crate::topology::{LinkDomain, Topology};
use serde::{Deserialize, Serialize};

/// Polarization basis used to encode or measure a qubit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Basis {
    Rectilinear,
    Diagonal,
}

impl Basis {
    pub fn random(rng: &mut SimRng) -> Self {
        if rng.next_bit() {
            Basis::Diagonal
        } else {
            Basis::Rectilinear
        }
    }
}

/// A single qubit in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Qubit {
    pub basis: Basis,
    pub bit: bool,
}

impl Qubit {
    /// Measure in `basis`. A matching basis yields the carried bit; a
    /// mismatched basis yields a uniformly random bit.
    pub fn measure(self, basis: Basis, rng: &mut SimRng) -> bool {
        if basis == self.basis {
            self.bit
        } else {
            rng.next_bit()
        }
    }
}

/// One transcript entry: what was sent, what arrived, and how it was read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QubitEvent {
    pub sender_basis: Basis,
    pub sent_bit: bool,
    /// Bit value after channel noise, before measurement.
    pub arrived_bit: bool,
    pub measurement: Option<Measurement>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Measurement {
    pub basis: Basis,
    pub bit: bool,
}

impl QubitEvent {
    pub fn arrived(&self) -> Qubit {
        Qubit {
            basis: self.sender_basis,
            bit: self.arrived_bit,
        }
    }
}

/// Errors building a channel from the topology.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ChannelError {
    #[error("quantum link {0:?} no longer exists")]
    MissingLink(LinkId),
    #[error("link {0:?} is not a quantum link")]
    NotQuantum(LinkId),
}

/// The sequence of per-link flip probabilities a qubit experiences on its
/// way between two adapters.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantumChannel {
    hops: Vec<Fixed64>,
}

impl QuantumChannel {
    pub fn new(hops: Vec<Fixed64>) -> Self {
        Self { hops }
    }

    /// Build the channel for a quantum path given as link ids.
    pub fn from_links(topology: &Topology, links: &[LinkId]) -> Result<Self, ChannelError> {
        let hops = links
            .iter()
            .map(|&l| {
                let data = topology.link(l).ok_or(ChannelError::MissingLink(l))?;
                if data.domain != LinkDomain::Quantum {
                    return Err(ChannelError::NotQuantum(l));
                }
                Ok(data.error_probability)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { hops })
    }

    pub fn hop_count(&self) -> usize {
        self.hops.len()
    }

    /// Carry one qubit across every hop.
    pub fn transmit(&self, qubit: Qubit, rng: &mut SimRng) -> Qubit {
        let mut out = qubit;
        for &p in &self.hops {
            if rng.chance(p) {
                out.bit = !out.bit;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed::f64_to_fixed64;
    use crate::topology::{LinkSpec, NodeKind};

    #[test]
    fn matching_basis_reads_carried_bit() {
        let mut rng = SimRng::new(1);
        let q = Qubit { basis: Basis::Diagonal, bit: true };
        for _ in 0..50 {
            assert!(q.measure(Basis::Diagonal, &mut rng));
        }
    }

    #[test]
    fn mismatched_basis_reads_both_values() {
        let mut rng = SimRng::new(1);
        let q = Qubit { basis: Basis::Diagonal, bit: true };
        let ones = (0..200).filter(|_| q.measure(Basis::Rectilinear, &mut rng)).count();
        assert!(ones > 0 && ones < 200);
    }

    #[test]
    fn noiseless_channel_preserves_qubits() {
        let ch = QuantumChannel::new(vec![Fixed64::ZERO; 3]);
        let mut rng = SimRng::new(5);
        let q = Qubit { basis: Basis::Rectilinear, bit: false };
        assert_eq!(ch.transmit(q, &mut rng), q);
    }

    #[test]
    fn certain_flip_on_each_hop() {
        let mut rng = SimRng::new(5);
        let q = Qubit { basis: Basis::Rectilinear, bit: false };
        let one_hop = QuantumChannel::new(vec![Fixed64::ONE]);
        let two_hops = QuantumChannel::new(vec![Fixed64::ONE, Fixed64::ONE]);
        assert!(one_hop.transmit(q, &mut rng).bit);
        assert!(!two_hops.transmit(q, &mut rng).bit);
        assert_eq!(one_hop.transmit(q, &mut rng).basis, Basis::Rectilinear);
    }

    #[test]
    fn from_links_reads_error_probabilities() {
        let mut t = Topology::new();
        let a = t.add_node("A1", NodeKind::QuantumAdapter, "").unwrap();
        let q = t.add_node("QH1", NodeKind::QuantumHost, "").unwrap();
        let l = t.add_link(a, q, LinkSpec::quantum(f64_to_fixed64(0.5))).unwrap();
        let ch = QuantumChannel::from_links(&t, &[l]).unwrap();
        assert_eq!(ch.hop_count(), 1);

        t.remove_link(l).unwrap();
        assert_eq!(QuantumChannel::from_links(&t, &[l]), Err(ChannelError::MissingLink(l)));
    }
}
