//! Cooperative abort and the host control handle
//!
//! Abort sequence on every rank:
//!
//! ```text
//!   Abort seen ──► stop processing, answer steals with "no work"
//!              ──► wait for answers to all own steal requests (merge items)
//!              ──► checkpoint local queue
//!              ──► broadcast Parked, keep serving the mailbox
//!              ──► every rank parked (or drain timeout) ──► ABORTED
//! ```
//!
//! Once every rank has parked, no item can be in transit: a parked rank
//! gives nothing away, and nobody parks before its own requests are
//! answered. The checkpoints taken along the way therefore hold every item.

use crate::engine::message::{Message, Peers};
use crossbeam_channel::Sender;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Handle for steering a run from outside the rank threads
///
/// Cheap to clone and safe to move into signal handlers or callbacks.
/// Requests sent after the run has finished are ignored.
#[derive(Clone)]
pub struct Control {
    senders: Vec<Sender<Message>>,
}

impl Control {
    pub(crate) fn new(senders: Vec<Sender<Message>>) -> Self {
        Self { senders }
    }

    /// Ask every rank to write a checkpoint of its local queue
    ///
    /// Each rank snapshots at its next poll point. Items travelling between
    /// ranks at that moment are in neither snapshot; use [`Control::abort`]
    /// for a consistent set of records.
    pub fn checkpoint(&self) {
        info!(ranks = self.senders.len(), "Checkpoint requested");
        for sender in &self.senders {
            let _ = sender.send(Message::Checkpoint);
        }
    }

    /// Cancel the run on every rank, checkpointing remaining work
    pub fn abort(&self) {
        info!(ranks = self.senders.len(), "Abort requested");
        for sender in &self.senders {
            let _ = sender.send(Message::Abort { origin: None });
        }
    }
}

impl std::fmt::Debug for Control {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Control")
            .field("ranks", &self.senders.len())
            .finish()
    }
}

/// Where a rank is in the abort sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AbortPhase {
    /// No abort seen
    Running,
    /// Waiting for answers to own steal requests
    Draining,
    /// Checkpointed; waiting for the other ranks
    Parked,
}

/// Per-rank abort state
#[derive(Debug)]
pub(crate) struct AbortCoordinator {
    rank: usize,
    phase: AbortPhase,

    /// Ranks known to hold no items in flight any more
    parked: Vec<bool>,

    /// Give up waiting at this point
    deadline: Option<Instant>,

    drain_timeout: Duration,
}

impl AbortCoordinator {
    pub(crate) fn new(rank: usize, ranks: usize, drain_timeout: Duration) -> Self {
        Self {
            rank,
            phase: AbortPhase::Running,
            parked: vec![false; ranks],
            deadline: None,
            drain_timeout,
        }
    }

    pub(crate) fn phase(&self) -> AbortPhase {
        self.phase
    }

    /// Check if an abort is under way
    pub(crate) fn is_aborting(&self) -> bool {
        self.phase != AbortPhase::Running
    }

    /// Enter the abort sequence
    ///
    /// A locally raised abort (`origin == Some(self)`) is broadcast to the
    /// other ranks; host aborts already reach every mailbox.
    pub(crate) fn begin(&mut self, origin: Option<usize>, peers: &Peers, now: Instant) {
        if self.is_aborting() {
            return;
        }

        info!(rank = self.rank, origin = ?origin, "Abort started");
        self.phase = AbortPhase::Draining;
        self.deadline = Some(now + self.drain_timeout);

        if origin == Some(self.rank) {
            peers.broadcast(|| Message::Abort { origin });
        }
    }

    /// Record that another rank has parked or left the run
    pub(crate) fn on_parked(&mut self, rank: usize) {
        debug!(rank = self.rank, parked = rank, "Peer parked");
        if let Some(flag) = self.parked.get_mut(rank) {
            *flag = true;
        }
    }

    /// Mark this rank parked and tell everyone
    pub(crate) fn park(&mut self, peers: &Peers) {
        self.phase = AbortPhase::Parked;
        self.parked[self.rank] = true;
        peers.broadcast(|| Message::Parked { rank: self.rank });
    }

    /// Check if every rank has parked
    pub(crate) fn all_parked(&self) -> bool {
        self.parked.iter().all(|&p| p)
    }

    /// Check the drain deadline, logging once it has passed
    pub(crate) fn expired(&self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                let missing: Vec<usize> = self
                    .parked
                    .iter()
                    .enumerate()
                    .filter(|(_, &p)| !p)
                    .map(|(r, _)| r)
                    .collect();
                warn!(
                    rank = self.rank,
                    phase = ?self.phase,
                    missing = ?missing,
                    "Abort drain timed out"
                );
                true
            }
            _ => false,
        }
    }

    /// Time left before the drain deadline
    pub(crate) fn remaining(&self, now: Instant) -> Duration {
        self.deadline
            .map(|d| d.saturating_duration_since(now))
            .unwrap_or(self.drain_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::message::mailboxes;

    #[test]
    fn test_control_reaches_every_rank() {
        let (senders, receivers) = mailboxes(3);
        let control = Control::new(senders);

        control.abort();
        control.checkpoint();

        for rx in &receivers {
            assert!(matches!(rx.try_recv(), Ok(Message::Abort { origin: None })));
            assert!(matches!(rx.try_recv(), Ok(Message::Checkpoint)));
        }

        // After the run is gone requests are dropped quietly
        drop(receivers);
        control.abort();
    }

    #[test]
    fn test_local_abort_is_broadcast() {
        let (senders, receivers) = mailboxes(3);
        let peers = Peers::new(1, senders);
        let mut abort = AbortCoordinator::new(1, 3, Duration::from_secs(1));

        abort.begin(Some(1), &peers, Instant::now());
        assert_eq!(abort.phase(), AbortPhase::Draining);
        assert!(matches!(
            receivers[0].try_recv(),
            Ok(Message::Abort { origin: Some(1) })
        ));
        assert!(receivers[1].try_recv().is_err());

        // A second abort is a no-op
        abort.begin(Some(1), &peers, Instant::now());
        assert!(receivers[2].try_recv().is_ok());
        assert!(receivers[2].try_recv().is_err());
    }

    #[test]
    fn test_park_barrier() {
        let (senders, receivers) = mailboxes(3);
        let peers = Peers::new(0, senders);
        let mut abort = AbortCoordinator::new(0, 3, Duration::from_millis(10));

        let start = Instant::now();
        abort.begin(None, &peers, start);
        assert!(receivers[1].try_recv().is_err());

        abort.park(&peers);
        assert!(matches!(
            receivers[1].try_recv(),
            Ok(Message::Parked { rank: 0 })
        ));
        assert!(!abort.all_parked());

        abort.on_parked(1);
        abort.on_parked(2);
        abort.on_parked(99);
        assert!(abort.all_parked());

        assert!(!abort.expired(start));
        assert!(abort.expired(start + Duration::from_millis(10)));
    }
}
