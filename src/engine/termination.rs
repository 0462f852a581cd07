//! Distributed termination detection
//!
//! A token travels the ring 0 → 1 → … → N-1 → 0. Only a passive rank
//! (empty queue, no steal request in flight) forwards it.
//!
//! ```text
//!   rank 0 starts round r ──► rank 1 ──► rank 2 ──► … ──► rank 0 checks
//!        all_idle = true          all_idle &= !dirty
//!        balance  = 0             balance  += counter
//! ```
//!
//! `counter` is the rank's cumulative number of item-bearing steal responses
//! sent minus received, so the balance summed over the ring is zero exactly
//! when no items are in transit. A rank is dirty if it enqueued anything, or
//! sent or received items, since it last forwarded the token.
//!
//! Rank 0 declares termination when the token comes back with `all_idle`
//! still set, rank 0 itself is clean, and the balance including rank 0's own
//! counter is zero. Any other outcome starts the next round.

use crate::engine::message::{Message, Peers, Token};
use tracing::{debug, info};

/// What the control loop should do after consulting the detector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Decision {
    /// Keep going
    Continue,
    /// Global termination; leave the process loop
    Terminate,
}

/// Per-rank termination state
#[derive(Debug)]
pub(crate) struct TerminationDetector {
    rank: usize,
    ranks: usize,

    /// Token waiting to be forwarded (or, on rank 0, to be evaluated)
    held: Option<Token>,

    /// Rank 0 only: no round has started yet
    idle_start: bool,

    /// Active since the last forward
    dirty: bool,

    /// Item-bearing responses sent minus received
    counter: i64,

    /// Rounds started (rank 0) or tokens forwarded (others)
    rounds: u64,
}

impl TerminationDetector {
    pub(crate) fn new(rank: usize, ranks: usize) -> Self {
        Self {
            rank,
            ranks,
            held: None,
            idle_start: rank == 0,
            dirty: false,
            counter: 0,
            rounds: 0,
        }
    }

    /// Record local activity (enqueue, restore)
    pub(crate) fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Record a steal response carrying items sent to another rank
    pub(crate) fn items_sent(&mut self) {
        self.counter += 1;
        self.dirty = true;
    }

    /// Record a steal response carrying items received from another rank
    pub(crate) fn items_received(&mut self) {
        self.counter -= 1;
        self.dirty = true;
    }

    /// Store an arriving token until the rank is passive
    pub(crate) fn receive(&mut self, token: Token) {
        debug!(rank = self.rank, round = token.round, "Token received");
        self.held = Some(token);
    }

    /// Token rounds this rank has started or forwarded
    pub(crate) fn rounds(&self) -> u64 {
        self.rounds
    }

    /// Advance the protocol; call whenever the rank is passive
    pub(crate) fn on_passive(&mut self, peers: &Peers) -> Decision {
        if self.ranks == 1 {
            return Decision::Terminate;
        }

        if self.rank == 0 {
            self.coordinate(peers)
        } else {
            if let Some(mut token) = self.held.take() {
                token.all_idle &= !self.dirty;
                token.balance += self.counter;
                self.dirty = false;
                self.rounds += 1;
                peers.send(peers.successor(), Message::Token(token));
            }
            Decision::Continue
        }
    }

    fn coordinate(&mut self, peers: &Peers) -> Decision {
        let round = match self.held.take() {
            Some(token) => {
                if token.all_idle && !self.dirty && token.balance + self.counter == 0 {
                    info!(round = token.round, "Global termination detected");
                    peers.broadcast(|| Message::Terminate);
                    return Decision::Terminate;
                }
                debug!(
                    round = token.round,
                    all_idle = token.all_idle,
                    balance = token.balance + self.counter,
                    "Termination round failed"
                );
                token.round + 1
            }
            None if self.idle_start => {
                self.idle_start = false;
                1
            }
            None => return Decision::Continue,
        };

        self.dirty = false;
        self.rounds += 1;
        peers.send(peers.successor(), Message::Token(Token::new(round)));
        Decision::Continue
    }
}
