//! Rank thread: the per-rank control loop
//!
//! Each rank:
//! - Restores its restart record or runs the create callback
//! - Invokes the process callback while its local queue has items
//! - Serves steal requests between callback invocations
//! - Steals from peers and passes the termination token while idle
//! - Checkpoints on request and during abort
//!
//! Nothing but this loop touches the rank's local queue.

use crate::config::CircleConfig;
use crate::engine::abort::{AbortCoordinator, AbortPhase};
use crate::engine::balance::{LoadBalancer, StealStats};
use crate::engine::checkpoint::{CheckpointManager, CheckpointRecord, CheckpointSummary};
use crate::engine::generator::WorkGenerator;
use crate::engine::handle::{set_current_rank, Callback, RankHandle};
use crate::engine::message::{Message, Peers};
use crate::engine::queue::{LocalQueue, QueueStats, WorkItem};
use crate::engine::termination::{Decision, TerminationDetector};
use crate::error::WorkerError;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Live counters shared by all ranks of a run
#[derive(Debug, Default)]
pub struct RunStats {
    /// Items dequeued by process callbacks
    pub items_processed: AtomicU64,

    /// Items accepted from callbacks
    pub items_enqueued: AtomicU64,

    /// Items loaded from restart records
    pub items_restored: AtomicU64,

    /// Items moved between ranks by stealing
    pub items_stolen: AtomicU64,

    /// Checkpoint records written
    pub checkpoints: AtomicU64,

    /// Bytes of checkpoint records written
    pub checkpoint_bytes: AtomicU64,
}

impl RunStats {
    fn record_processed(&self, count: u64) {
        self.items_processed.fetch_add(count, Ordering::Relaxed);
    }

    fn record_enqueued(&self, count: u64) {
        self.items_enqueued.fetch_add(count, Ordering::Relaxed);
    }

    fn record_restored(&self, count: u64) {
        self.items_restored.fetch_add(count, Ordering::Relaxed);
    }

    fn record_stolen(&self, count: u64) {
        self.items_stolen.fetch_add(count, Ordering::Relaxed);
    }

    fn record_checkpoint(&self, bytes: u64) {
        self.checkpoints.fetch_add(1, Ordering::Relaxed);
        self.checkpoint_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Items still queued somewhere in the run
    pub fn pending(&self) -> u64 {
        let added = self.items_enqueued.load(Ordering::Relaxed)
            + self.items_restored.load(Ordering::Relaxed);
        added.saturating_sub(self.items_processed.load(Ordering::Relaxed))
    }
}

/// Rank lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankState {
    Init,
    Create,
    Process,
    Stealing,
    Terminated,
    Aborted,
}

/// Final account of one rank
#[derive(Debug, Clone)]
pub struct RankReport {
    /// Rank number
    pub rank: usize,

    /// State the rank ended in
    pub state: RankState,

    /// Process callback invocations
    pub callbacks: u64,

    /// Local queue counters
    pub queue: QueueStats,

    /// Steal protocol counters
    pub steals: StealStats,

    /// Token rounds started or forwarded
    pub token_rounds: u64,

    /// Records written by this rank
    pub checkpoints: Vec<CheckpointSummary>,

    /// Checkpoint writes that failed
    pub checkpoint_failures: u64,

    /// Items left in the local queue at exit
    pub remaining: usize,

    /// A callback on this rank panicked
    pub callback_panicked: bool,
}

/// Everything a rank thread needs to start
pub(crate) struct RankSetup {
    pub rank: usize,
    pub config: Arc<CircleConfig>,
    pub create: Option<Callback>,
    pub process: Callback,
    pub generator: WorkGenerator,
    pub restore: Option<CheckpointRecord>,
    pub mailbox: Receiver<Message>,
    pub peers: Peers,
    pub stats: Arc<RunStats>,
}

/// A spawned rank thread
pub(crate) struct Worker {
    /// Rank number
    rank: usize,

    /// Thread handle
    handle: Option<JoinHandle<RankReport>>,
}

impl Worker {
    /// Spawn a rank thread
    pub(crate) fn spawn(setup: RankSetup) -> Result<Self, WorkerError> {
        let rank = setup.rank;

        let handle = thread::Builder::new()
            .name(format!("circle-rank-{}", rank))
            .spawn(move || {
                set_current_rank(Some(setup.rank));
                let report = Rank::new(setup).run();
                set_current_rank(None);
                report
            })
            .map_err(|e| WorkerError::SpawnFailed {
                rank,
                reason: e.to_string(),
            })?;

        Ok(Self {
            rank,
            handle: Some(handle),
        })
    }

    /// Wait for the rank to finish
    pub(crate) fn join(mut self) -> Result<RankReport, WorkerError> {
        let Some(handle) = self.handle.take() else {
            return Err(WorkerError::Panicked {
                rank: self.rank,
                message: "Rank already joined".into(),
            });
        };

        handle.join().map_err(|payload| WorkerError::Panicked {
            rank: self.rank,
            message: panic_message(payload.as_ref()),
        })
    }
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// State owned by one rank's control loop
struct Rank {
    rank: usize,
    config: Arc<CircleConfig>,
    state: RankState,

    queue: LocalQueue,
    mailbox: Receiver<Message>,
    peers: Peers,

    balancer: LoadBalancer,
    termination: TerminationDetector,
    abort: AbortCoordinator,
    checkpoints: CheckpointManager,

    create: Option<Callback>,
    process: Callback,
    generator: WorkGenerator,
    restore: Option<CheckpointRecord>,

    stats: Arc<RunStats>,
    callbacks: u64,
    written: Vec<CheckpointSummary>,
    checkpoint_failures: u64,
    callback_panicked: bool,

    /// The "callback did not dequeue" warning was already logged
    warned_idle_callback: bool,
}

impl Rank {
    fn new(setup: RankSetup) -> Self {
        let RankSetup {
            rank,
            config,
            create,
            process,
            generator,
            restore,
            mailbox,
            peers,
            stats,
        } = setup;

        let ranks = peers.len();
        let queue = match config.queue_capacity {
            Some(capacity) => LocalQueue::bounded(config.max_item_len, capacity),
            None => LocalQueue::new(config.max_item_len),
        };

        let balancer = LoadBalancer::new(
            rank,
            ranks,
            config.split,
            config.seed,
            config.poll_interval,
            config.max_steal_backoff,
            config.steal_timeout,
        );

        Self {
            rank,
            state: RankState::Init,
            queue,
            mailbox,
            peers,
            balancer,
            termination: TerminationDetector::new(rank, ranks),
            abort: AbortCoordinator::new(rank, ranks, config.abort_drain_timeout),
            checkpoints: CheckpointManager::new(&config.checkpoint_dir, rank),
            config,
            create,
            process,
            generator,
            restore,
            stats,
            callbacks: 0,
            written: Vec::new(),
            checkpoint_failures: 0,
            callback_panicked: false,
            warned_idle_callback: false,
        }
    }

    fn run(mut self) -> RankReport {
        debug!(rank = self.rank, "Rank started");

        self.state = RankState::Create;
        self.seed_queue();

        self.state = self.process_loop();

        info!(
            rank = self.rank,
            state = ?self.state,
            callbacks = self.callbacks,
            remaining = self.queue.len(),
            "Rank finished"
        );

        RankReport {
            rank: self.rank,
            state: self.state,
            callbacks: self.callbacks,
            queue: self.queue.stats().clone(),
            steals: self.balancer.stats().clone(),
            token_rounds: self.termination.rounds(),
            checkpoints: self.written,
            checkpoint_failures: self.checkpoint_failures,
            remaining: self.queue.len(),
            callback_panicked: self.callback_panicked,
        }
    }

    /// Fill the local queue from a restart record or the create callback
    fn seed_queue(&mut self) {
        if let Some(record) = self.restore.take() {
            let count = record.items.len();
            self.checkpoints =
                CheckpointManager::new(&self.config.checkpoint_dir, self.rank)
                    .resume_after(record.sequence);
            self.queue.restore(record.items);
            self.stats.record_restored(count as u64);
            if count > 0 {
                self.termination.mark_dirty();
            }
            info!(rank = self.rank, items = count, sequence = record.sequence, "Queue restored");
        }

        if !self.generator.creates_on(self.rank) {
            return;
        }
        let Some(create) = self.create.clone() else {
            return;
        };

        debug!(rank = self.rank, "Running create callback");
        let enqueued = self.invoke(&create, "create");
        info!(rank = self.rank, items = enqueued, "Create callback finished");
    }

    /// Run a callback against the local queue, catching panics
    ///
    /// Returns the number of items the callback enqueued.
    fn invoke(&mut self, callback: &Callback, step: &'static str) -> u64 {
        let mut handle = RankHandle::new(self.rank, &mut self.queue);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback(&mut handle)));
        let enqueued = handle.enqueued();
        let dequeued = handle.dequeued();

        if enqueued > 0 {
            self.termination.mark_dirty();
            self.stats.record_enqueued(enqueued);
        }
        if dequeued > 0 {
            self.stats.record_processed(dequeued);
        }

        if let Err(payload) = outcome {
            error!(
                rank = self.rank,
                step,
                message = %panic_message(payload.as_ref()),
                "Callback panicked, aborting run"
            );
            self.callback_panicked = true;
            self.abort.begin(Some(self.rank), &self.peers, Instant::now());
        } else if step == "process" && dequeued == 0 && !self.warned_idle_callback {
            warn!(
                rank = self.rank,
                queued = self.queue.len(),
                "Process callback returned without dequeuing"
            );
            self.warned_idle_callback = true;
        }

        enqueued
    }

    fn process_loop(&mut self) -> RankState {
        loop {
            while let Ok(message) = self.mailbox.try_recv() {
                if self.handle_message(message) {
                    return self.finish_terminated();
                }
            }

            if self.abort.is_aborting() {
                return self.finish_aborted();
            }

            if !self.queue.is_empty() {
                self.state = RankState::Process;
                self.callbacks += 1;
                let process = Arc::clone(&self.process);
                self.invoke(&process, "process");
                continue;
            }

            let now = Instant::now();
            self.balancer.check_timeout(now);
            if !self.balancer.has_pending()
                && self.termination.on_passive(&self.peers) == Decision::Terminate
            {
                return self.finish_terminated();
            }

            self.state = RankState::Stealing;
            self.balancer.maybe_request(now, &self.peers);

            let wait = self
                .balancer
                .next_deadline(Instant::now())
                .max(self.config.poll_interval);
            match self.mailbox.recv_timeout(wait) {
                Ok(message) => {
                    if self.handle_message(message) {
                        return self.finish_terminated();
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    warn!(rank = self.rank, "Mailbox closed");
                    return RankState::Terminated;
                }
            }
        }
    }

    /// Handle one message; returns true on global termination
    fn handle_message(&mut self, message: Message) -> bool {
        match message {
            Message::StealRequest { from, seq } => self.serve_steal(from, seq),
            Message::StealResponse { from, seq, items } => self.receive_items(from, seq, items),
            Message::Token(token) => self.termination.receive(token),
            Message::Terminate => {
                // Rank 0 only declares termination with every queue empty
                // and nothing in flight, so it wins over a racing abort.
                if self.abort.is_aborting() {
                    info!(rank = self.rank, "Global termination declared during abort");
                }
                return true;
            }
            Message::Abort { origin } => {
                self.abort.begin(origin, &self.peers, Instant::now());
            }
            Message::Checkpoint => self.write_checkpoint(),
            Message::Parked { rank } => self.abort.on_parked(rank),
        }
        false
    }

    fn serve_steal(&mut self, from: usize, seq: u64) {
        let items = self
            .balancer
            .serve(&mut self.queue, !self.abort.is_aborting());
        let count = items.len();

        match self.peers.respond(from, seq, items) {
            Ok(()) if count > 0 => {
                self.termination.items_sent();
                self.stats.record_stolen(count as u64);
                debug!(rank = self.rank, thief = from, items = count, "Work given");
            }
            Ok(()) => {}
            Err(items) => {
                warn!(rank = self.rank, thief = from, items = items.len(), "Thief gone, keeping items");
                self.queue.give_back(items);
            }
        }
    }

    fn receive_items(&mut self, from: usize, seq: u64, items: Vec<WorkItem>) {
        let count = items.len();
        self.balancer.on_response(from, seq, count, Instant::now());
        if count == 0 {
            trace!(rank = self.rank, victim = from, "No work");
            return;
        }

        self.queue.merge_stolen(items);
        self.termination.items_received();
        debug!(rank = self.rank, victim = from, items = count, "Work stolen");

        // Items that arrive after the abort snapshot must reach disk too
        if self.abort.phase() == AbortPhase::Parked {
            warn!(rank = self.rank, items = count, "Items arrived after abort checkpoint");
            self.write_checkpoint();
        }
    }

    fn write_checkpoint(&mut self) {
        match self.checkpoints.write(&self.queue) {
            Ok(summary) => {
                self.stats.record_checkpoint(summary.bytes);
                self.written.push(summary);
            }
            Err(e) => {
                error!(rank = self.rank, error = %e, "Checkpoint failed");
                self.checkpoint_failures += 1;
            }
        }
    }

    fn finish_terminated(&mut self) -> RankState {
        // Leaving the run counts as parked for anyone who is aborting
        self.peers.broadcast(|| Message::Parked { rank: self.rank });

        while let Ok(message) = self.mailbox.try_recv() {
            if let Message::StealRequest { from, seq } = message {
                let _ = self.peers.respond(from, seq, Vec::new());
            }
        }
        RankState::Terminated
    }

    fn finish_aborted(&mut self) -> RankState {
        loop {
            let now = Instant::now();

            if self.abort.phase() == AbortPhase::Draining && self.balancer.unanswered() == 0 {
                self.write_checkpoint();
                self.abort.park(&self.peers);
            }

            if self.abort.phase() == AbortPhase::Parked && self.abort.all_parked() {
                return RankState::Aborted;
            }

            if self.abort.expired(now) {
                if self.abort.phase() == AbortPhase::Draining {
                    self.write_checkpoint();
                    self.abort.park(&self.peers);
                }
                return RankState::Aborted;
            }

            let wait = self.abort.remaining(now).min(self.config.steal_timeout);
            match self.mailbox.recv_timeout(wait) {
                Ok(message) => {
                    if self.handle_message(message) {
                        return self.finish_terminated();
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return RankState::Aborted,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::handle::{current_rank, Handle};
    use crate::engine::message::mailboxes;
    use std::time::Duration;

    fn setup(
        rank: usize,
        config: CircleConfig,
        create: Option<Callback>,
        process: Callback,
    ) -> (RankSetup, Vec<crossbeam_channel::Sender<Message>>) {
        let (senders, mut receivers) = mailboxes(config.ranks);
        let generator = WorkGenerator::new(config.create, false, create.is_some());
        let setup = RankSetup {
            rank,
            config: Arc::new(config),
            create,
            process,
            generator,
            restore: None,
            mailbox: receivers.remove(rank),
            peers: Peers::new(rank, senders.clone()),
            stats: Arc::new(RunStats::default()),
        };
        (setup, senders)
    }

    #[test]
    fn test_single_rank_drains_queue() {
        let create: Callback = Arc::new(|h: &mut dyn Handle| {
            for i in 0..5 {
                h.enqueue_str(&i.to_string());
            }
        });
        let process: Callback = Arc::new(|h: &mut dyn Handle| {
            assert_eq!(current_rank(), Some(0));
            h.dequeue();
        });

        let dir = tempfile::tempdir().unwrap();
        let config = CircleConfig {
            checkpoint_dir: dir.path().to_path_buf(),
            ..CircleConfig::with_ranks(1)
        };
        let (setup, _senders) = setup(0, config, Some(create), process);
        let stats = Arc::clone(&setup.stats);

        let report = Worker::spawn(setup).unwrap().join().unwrap();
        assert_eq!(report.state, RankState::Terminated);
        assert_eq!(report.callbacks, 5);
        assert_eq!(report.remaining, 0);
        assert_eq!(stats.items_processed.load(Ordering::Relaxed), 5);
        assert_eq!(stats.pending(), 0);
    }

    #[test]
    fn test_process_panic_aborts_with_checkpoint() {
        let create: Callback = Arc::new(|h: &mut dyn Handle| {
            h.enqueue_str("ok");
            h.enqueue_str("boom");
        });
        let process: Callback = Arc::new(|h: &mut dyn Handle| {
            if let Some(item) = h.dequeue() {
                if item.as_bytes() == b"boom" {
                    panic!("bad item");
                }
            }
        });

        let dir = tempfile::tempdir().unwrap();
        let config = CircleConfig {
            checkpoint_dir: dir.path().to_path_buf(),
            abort_drain_timeout: Duration::from_secs(5),
            ..CircleConfig::with_ranks(1)
        };
        let (setup, _senders) = setup(0, config, Some(create), process);

        let report = Worker::spawn(setup).unwrap().join().unwrap();
        assert_eq!(report.state, RankState::Aborted);
        assert!(report.callback_panicked);
        assert_eq!(report.callbacks, 1);
        assert_eq!(report.remaining, 1);
        assert_eq!(report.checkpoints.len(), 1);
        assert_eq!(report.checkpoints[0].items, 1);
    }

    fn idle_rank_config(dir: &std::path::Path) -> CircleConfig {
        CircleConfig {
            checkpoint_dir: dir.to_path_buf(),
            abort_drain_timeout: Duration::from_secs(5),
            ..CircleConfig::with_ranks(2)
        }
    }

    #[test]
    fn test_terminate_before_abort_ends_terminated() {
        let dir = tempfile::tempdir().unwrap();
        let mut old = LocalQueue::new(64);
        old.enqueue(b"already-processed").unwrap();
        CheckpointManager::new(dir.path(), 1).write(&old).unwrap();

        let process: Callback = Arc::new(|h: &mut dyn Handle| {
            h.dequeue();
        });
        let (setup, senders) = setup(1, idle_rank_config(dir.path()), None, process);
        senders[1].send(Message::Terminate).unwrap();
        senders[1].send(Message::Abort { origin: None }).unwrap();

        let report = Worker::spawn(setup).unwrap().join().unwrap();
        assert_eq!(report.state, RankState::Terminated);
        assert!(report.checkpoints.is_empty());
    }

    #[test]
    fn test_abort_before_terminate_ends_terminated() {
        let dir = tempfile::tempdir().unwrap();
        let process: Callback = Arc::new(|h: &mut dyn Handle| {
            h.dequeue();
        });
        let (setup, senders) = setup(1, idle_rank_config(dir.path()), None, process);
        senders[1].send(Message::Abort { origin: None }).unwrap();
        senders[1].send(Message::Terminate).unwrap();

        let started = Instant::now();
        let report = Worker::spawn(setup).unwrap().join().unwrap();
        assert_eq!(report.state, RankState::Terminated);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_panic_message() {
        let payload = panic::catch_unwind(|| panic!("plain")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "plain");

        let payload = panic::catch_unwind(|| panic!("{} {}", "formatted", 1)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "formatted 1");
    }
}
