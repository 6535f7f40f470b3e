//! Inbound command queue.
//!
//! Commands submitted by the client are executed at the start of the next
//! tick (the pre-tick phase), never mid-tick, so submission timing cannot
//! perturb the deterministic ordering of a tick.

use crate::fixed::Ticks;
use crate::id::{NodeId, PacketSeq};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Command enum
// ---------------------------------------------------------------------------

/// A single deferred command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Originate application data at a host.
    SendMessage {
        source: NodeId,
        destination: NodeId,
        seq: PacketSeq,
        payload: Vec<u8>,
    },
    /// Establish a key on an adapter pair ahead of traffic.
    RequestKey { initiator: NodeId, responder: NodeId },
}

// ---------------------------------------------------------------------------
// CommandQueue
// ---------------------------------------------------------------------------

/// Commands waiting for the next tick boundary, with optional history.
#[derive(Debug, Default)]
pub struct CommandQueue {
    pending: Vec<Command>,
    /// Executed commands: (tick, command).
    history: Vec<(Ticks, Command)>,
    /// Maximum history entries to retain. 0 = no history.
    max_history: usize,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_history(max_history: usize) -> Self {
        Self {
            max_history,
            ..Self::default()
        }
    }

    pub fn push(&mut self, command: Command) {
        self.pending.push(command);
    }

    /// Drain all pending commands in submission order, recording them in
    /// history under `tick`.
    pub fn drain(&mut self, tick: Ticks) -> Vec<Command> {
        let commands: Vec<Command> = self.pending.drain(..).collect();

        if self.max_history > 0 {
            self.history
                .extend(commands.iter().cloned().map(|c| (tick, c)));
            let excess = self.history.len().saturating_sub(self.max_history);
            if excess > 0 {
                self.history.drain(..excess);
            }
        }

        commands
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Commands waiting for the next tick, in submission order.
    pub fn pending(&self) -> &[Command] {
        &self.pending
    }

    pub fn history(&self) -> &[(Ticks, Command)] {
        &self.history
    }

    /// Discard pending commands without executing them.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    fn send(seq: u64) -> Command {
        let mut sm = SlotMap::<NodeId, ()>::with_key();
        Command::SendMessage {
            source: sm.insert(()),
            destination: sm.insert(()),
            seq: PacketSeq(seq),
            payload: b"hi".to_vec(),
        }
    }

    #[test]
    fn drain_preserves_order() {
        let mut queue = CommandQueue::new();
        queue.push(send(0));
        queue.push(send(1));
        let drained = queue.drain(0);
        assert_eq!(drained, vec![send(0), send(1)]);
        assert!(queue.is_empty());
    }

    #[test]
    fn history_is_off_by_default() {
        let mut queue = CommandQueue::new();
        queue.push(send(0));
        queue.drain(10);
        assert!(queue.history().is_empty());
    }

    #[test]
    fn history_trimmed_to_limit() {
        let mut queue = CommandQueue::with_max_history(2);
        for i in 0..3 {
            queue.push(send(i));
        }
        queue.drain(1);
        queue.push(send(9));
        queue.drain(2);
        let history = queue.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0], (1, send(2)));
        assert_eq!(history[1], (2, send(9)));
    }

    #[test]
    fn clear_discards_pending() {
        let mut queue = CommandQueue::new();
        queue.push(send(0));
        queue.clear();
        assert_eq!(queue.pending_count(), 0);
    }
}
