//! Messages exchanged between ranks
//!
//! Every rank owns one inbound mailbox. Steal traffic, the termination
//! token and the broadcasts all travel as variants of [`Message`], so a
//! rank's control loop handles everything through a single receiver.

use crate::engine::queue::WorkItem;
use crossbeam_channel::{unbounded, Receiver, SendError, Sender};
use tracing::trace;

/// Termination token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Token {
    /// Round number, assigned by rank 0
    pub round: u64,

    /// Cleared by any rank that was active since its previous forward
    pub all_idle: bool,

    /// Sum of item-bearing steal responses sent minus received
    pub balance: i64,
}

impl Token {
    pub(crate) fn new(round: u64) -> Self {
        Self {
            round,
            all_idle: true,
            balance: 0,
        }
    }
}

/// Inter-rank message
#[derive(Debug)]
pub(crate) enum Message {
    /// Idle rank asks for work
    StealRequest { from: usize, seq: u64 },

    /// Answer to a steal request; empty means "no work"
    StealResponse {
        from: usize,
        seq: u64,
        items: Vec<WorkItem>,
    },

    /// Termination token
    Token(Token),

    /// Global termination notice from rank 0
    Terminate,

    /// Cooperative cancellation
    Abort { origin: Option<usize> },

    /// Host asked for a checkpoint
    Checkpoint,

    /// Rank finished its abort checkpoint
    Parked { rank: usize },
}

impl Message {
    fn kind(&self) -> &'static str {
        match self {
            Message::StealRequest { .. } => "steal_request",
            Message::StealResponse { .. } => "steal_response",
            Message::Token(_) => "token",
            Message::Terminate => "terminate",
            Message::Abort { .. } => "abort",
            Message::Checkpoint => "checkpoint",
            Message::Parked { .. } => "parked",
        }
    }
}

/// Create one mailbox per rank
pub(crate) fn mailboxes(ranks: usize) -> (Vec<Sender<Message>>, Vec<Receiver<Message>>) {
    (0..ranks).map(|_| unbounded()).unzip()
}

/// Outbound side of the mesh, as seen from one rank
#[derive(Clone)]
pub(crate) struct Peers {
    rank: usize,
    senders: Vec<Sender<Message>>,
}

impl Peers {
    pub(crate) fn new(rank: usize, senders: Vec<Sender<Message>>) -> Self {
        Self { rank, senders }
    }

    /// Number of ranks in the mesh
    pub(crate) fn len(&self) -> usize {
        self.senders.len()
    }

    /// Send to one rank
    ///
    /// Returns false if the destination has already shut down.
    pub(crate) fn send(&self, to: usize, message: Message) -> bool {
        trace!(rank = self.rank, to, kind = message.kind(), "Send");
        self.senders[to].send(message).is_ok()
    }

    /// Answer a steal request
    ///
    /// If the requester is gone the items are handed back to the caller.
    pub(crate) fn respond(
        &self,
        to: usize,
        seq: u64,
        items: Vec<WorkItem>,
    ) -> Result<(), Vec<WorkItem>> {
        trace!(rank = self.rank, to, seq, items = items.len(), "Steal response");
        let response = Message::StealResponse {
            from: self.rank,
            seq,
            items,
        };
        match self.senders[to].send(response) {
            Ok(()) => Ok(()),
            Err(SendError(Message::StealResponse { items, .. })) => Err(items),
            Err(_) => Ok(()),
        }
    }

    /// Send a message built by `make` to every other rank
    pub(crate) fn broadcast<F>(&self, make: F)
    where
        F: Fn() -> Message,
    {
        for to in (0..self.senders.len()).filter(|&to| to != self.rank) {
            self.send(to, make());
        }
    }

    /// Next rank in ring order
    pub(crate) fn successor(&self) -> usize {
        (self.rank + 1) % self.senders.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_skips_self() {
        let (senders, receivers) = mailboxes(3);
        let peers = Peers::new(1, senders);

        peers.broadcast(|| Message::Terminate);

        assert!(matches!(receivers[0].try_recv(), Ok(Message::Terminate)));
        assert!(receivers[1].try_recv().is_err());
        assert!(matches!(receivers[2].try_recv(), Ok(Message::Terminate)));
    }

    #[test]
    fn test_successor_wraps() {
        let (senders, _receivers) = mailboxes(4);
        assert_eq!(Peers::new(2, senders.clone()).successor(), 3);
        assert_eq!(Peers::new(3, senders).successor(), 0);
    }

    #[test]
    fn test_send_to_closed_mailbox() {
        let (senders, receivers) = mailboxes(2);
        let peers = Peers::new(0, senders);
        drop(receivers);
        assert!(!peers.send(1, Message::Checkpoint));
    }

    #[test]
    fn test_respond_returns_undelivered_items() {
        let (senders, receivers) = mailboxes(2);
        let peers = Peers::new(1, senders);
        let item = WorkItem::new(b"job".to_vec(), 8).unwrap();

        drop(receivers);
        let returned = peers.respond(0, 4, vec![item]).unwrap_err();
        assert_eq!(returned[0].as_bytes(), b"job");
    }
}
