//! Load balancer: the steal protocol
//!
//! An idle rank sends a steal request to a victim and waits (without
//! blocking its loop) for the response. A victim holding at least two
//! items answers with the older half of its queue; otherwise it answers
//! with an empty "no work" response.
//!
//! Victim selection:
//! - **Equal split**: the ring successor. On timeout the requester moves on
//!   to the next rank in ring order; an empty answer sends it back to the
//!   successor.
//! - **Random split**: a uniformly random peer for every attempt.
//!
//! Timeouts only change who the requester asks next. A response that shows
//! up after its request timed out is still merged, so items are never lost.

use crate::config::SplitPolicy;
use crate::engine::message::{Message, Peers};
use crate::engine::queue::{LocalQueue, WorkItem};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Steal protocol counters for one rank
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StealStats {
    /// Requests sent
    pub requests_sent: u64,

    /// Responses that carried items
    pub successful_steals: u64,

    /// Responses that carried no items
    pub empty_responses: u64,

    /// Requests abandoned after the steal timeout
    pub timeouts: u64,

    /// Requests answered for other ranks
    pub requests_served: u64,

    /// Requests answered with items
    pub requests_fed: u64,
}

/// A request still waiting for its response
#[derive(Debug, Clone, Copy)]
struct PendingSteal {
    victim: usize,
    seq: u64,
    sent_at: Instant,
}

/// Outcome of handling a steal response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResponseKind {
    /// Items were delivered
    Work(usize),
    /// The victim had nothing to give
    Empty,
}

/// Per-rank steal protocol state
pub(crate) struct LoadBalancer {
    rank: usize,
    ranks: usize,
    policy: SplitPolicy,
    rng: StdRng,

    /// Next request sequence number
    next_seq: u64,

    /// The request the rank is currently waiting on
    pending: Option<PendingSteal>,

    /// Every request without a response yet, including abandoned ones
    awaiting: HashSet<u64>,

    /// Equal split victim; starts at the successor
    ring_victim: usize,

    /// Earliest time for the next request
    next_attempt: Instant,

    /// Current delay after an empty response
    backoff: Duration,

    poll_interval: Duration,
    max_backoff: Duration,
    steal_timeout: Duration,

    stats: StealStats,
}

impl LoadBalancer {
    pub(crate) fn new(
        rank: usize,
        ranks: usize,
        policy: SplitPolicy,
        seed: Option<u64>,
        poll_interval: Duration,
        max_backoff: Duration,
        steal_timeout: Duration,
    ) -> Self {
        let seed = seed.unwrap_or_else(|| rand::rng().random());

        Self {
            rank,
            ranks,
            policy,
            rng: StdRng::seed_from_u64(seed.wrapping_add(rank as u64)),
            next_seq: 0,
            pending: None,
            awaiting: HashSet::new(),
            ring_victim: (rank + 1) % ranks.max(1),
            next_attempt: Instant::now(),
            backoff: poll_interval,
            poll_interval,
            max_backoff,
            steal_timeout,
            stats: StealStats::default(),
        }
    }

    /// Counters
    pub(crate) fn stats(&self) -> &StealStats {
        &self.stats
    }

    /// Check if a request is in progress
    pub(crate) fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Number of requests, current or abandoned, still unanswered
    pub(crate) fn unanswered(&self) -> usize {
        self.awaiting.len()
    }

    /// Time until the next request may be sent or the pending one times out
    pub(crate) fn next_deadline(&self, now: Instant) -> Duration {
        match self.pending {
            Some(p) => (p.sent_at + self.steal_timeout).saturating_duration_since(now),
            None => self.next_attempt.saturating_duration_since(now),
        }
    }

    fn choose_victim(&mut self) -> usize {
        match self.policy {
            SplitPolicy::Equal => self.ring_victim,
            SplitPolicy::Random => {
                let pick = self.rng.random_range(0..self.ranks - 1);
                if pick >= self.rank {
                    pick + 1
                } else {
                    pick
                }
            }
        }
    }

    /// Send a steal request if none is pending and the back-off has passed
    pub(crate) fn maybe_request(&mut self, now: Instant, peers: &Peers) -> bool {
        if self.ranks < 2 || self.pending.is_some() || now < self.next_attempt {
            return false;
        }

        let victim = self.choose_victim();
        let seq = self.next_seq;
        self.next_seq += 1;

        if !peers.send(victim, Message::StealRequest { from: self.rank, seq }) {
            debug!(rank = self.rank, victim, "Victim mailbox closed");
            self.advance_ring_victim();
            return false;
        }

        trace!(rank = self.rank, victim, seq, "Steal request sent");
        self.pending = Some(PendingSteal {
            victim,
            seq,
            sent_at: now,
        });
        self.awaiting.insert(seq);
        self.stats.requests_sent += 1;
        true
    }

    /// Abandon the pending request if it has waited too long
    ///
    /// Returns the victim that timed out.
    pub(crate) fn check_timeout(&mut self, now: Instant) -> Option<usize> {
        let pending = self.pending?;
        if now.duration_since(pending.sent_at) < self.steal_timeout {
            return None;
        }

        warn!(
            rank = self.rank,
            victim = pending.victim,
            seq = pending.seq,
            timeout_ms = self.steal_timeout.as_millis() as u64,
            "Steal request timed out"
        );

        self.pending = None;
        self.stats.timeouts += 1;
        if pending.victim == self.ring_victim {
            self.advance_ring_victim();
        }
        self.next_attempt = now;
        Some(pending.victim)
    }

    fn advance_ring_victim(&mut self) {
        if self.ranks < 2 {
            return;
        }
        let mut next = (self.ring_victim + 1) % self.ranks;
        if next == self.rank {
            next = (next + 1) % self.ranks;
        }
        self.ring_victim = next;
    }

    /// Record a steal response
    ///
    /// The caller merges the items; this only updates protocol state.
    pub(crate) fn on_response(
        &mut self,
        from: usize,
        seq: u64,
        items: usize,
        now: Instant,
    ) -> ResponseKind {
        self.awaiting.remove(&seq);
        if self.pending.is_some_and(|p| p.seq == seq) {
            self.pending = None;
        } else {
            debug!(rank = self.rank, from, seq, items, "Late steal response");
        }

        if items > 0 {
            self.stats.successful_steals += 1;
            self.backoff = self.poll_interval;
            self.next_attempt = now;
            ResponseKind::Work(items)
        } else {
            self.stats.empty_responses += 1;
            self.next_attempt = now + self.backoff;
            self.backoff = (self.backoff * 2).min(self.max_backoff);
            if self.policy == SplitPolicy::Equal {
                self.ring_victim = (self.rank + 1) % self.ranks;
            }
            ResponseKind::Empty
        }
    }

    /// Pick the items to hand to a requester
    ///
    /// Half of the queue, rounded down, from the far end. A single item is
    /// kept: the owner will process it sooner than a thief could.
    pub(crate) fn serve(&mut self, queue: &mut LocalQueue, giving: bool) -> Vec<WorkItem> {
        self.stats.requests_served += 1;
        if !giving {
            return Vec::new();
        }

        let share = queue.len() / 2;
        if share == 0 {
            return Vec::new();
        }

        self.stats.requests_fed += 1;
        queue.take_from_far(share)
    }
}
