//! Circle - sets up and runs one work-stealing engine instance
//!
//! The coordinator is responsible for:
//! - Holding configuration and the registered callbacks
//! - Creating one mailbox per rank and handing out the control handle
//! - Loading restart records before any rank starts
//! - Spawning and joining the rank threads
//! - Aggregating the per-rank reports into a `RunReport`

use crate::config::{CircleConfig, Flags};
use crate::engine::abort::Control;
use crate::engine::checkpoint::{load_restarts, remove_records, CheckpointRecord};
use crate::engine::generator::WorkGenerator;
use crate::engine::handle::{Callback, Handle};
use crate::engine::message::{mailboxes, Message, Peers};
use crate::engine::worker::{RankReport, RankSetup, RankState, RunStats, Worker};
use crate::error::{ConfigError, Result};
use crossbeam_channel::{Receiver, Sender};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

static EPOCH: LazyLock<Instant> = LazyLock::new(Instant::now);

/// Monotonic wall-clock seconds since the first engine was created
pub fn wtime() -> f64 {
    EPOCH.elapsed().as_secs_f64()
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    /// Every rank drained and global termination was detected
    Completed,
    /// The run was cancelled; remaining work is in checkpoint records
    Aborted,
    /// Restart records could not be loaded; nothing ran
    RestartFailed,
}

impl CompletionStatus {
    /// Process exit code for this status
    pub fn exit_code(&self) -> u8 {
        match self {
            CompletionStatus::Completed => 0,
            CompletionStatus::Aborted => 2,
            CompletionStatus::RestartFailed => 3,
        }
    }
}

/// Result of a finished run
#[derive(Debug)]
pub struct RunReport {
    /// How the run ended
    pub status: CompletionStatus,

    /// Per-rank accounts, indexed by rank
    pub ranks: Vec<RankReport>,

    /// Whether the run started from restart records
    pub restarted: bool,

    /// Wall time of the run
    pub duration: Duration,
}

impl RunReport {
    /// Items dequeued by process callbacks across all ranks
    pub fn items_processed(&self) -> u64 {
        self.ranks.iter().map(|r| r.queue.dequeued).sum()
    }

    /// Items left in local queues (non-zero only after an abort)
    pub fn items_remaining(&self) -> usize {
        self.ranks.iter().map(|r| r.remaining).sum()
    }

    /// Items moved between ranks by stealing
    pub fn items_stolen(&self) -> u64 {
        self.ranks.iter().map(|r| r.queue.stolen_in).sum()
    }

    /// Ranks whose process callback ran at least once
    pub fn active_ranks(&self) -> usize {
        self.ranks.iter().filter(|r| r.callbacks > 0).count()
    }

    /// Bytes of checkpoint records written during the run
    pub fn checkpoint_bytes(&self) -> u64 {
        self.ranks
            .iter()
            .flat_map(|r| r.checkpoints.iter())
            .map(|c| c.bytes)
            .sum()
    }

    /// Processed items per second
    pub fn items_per_second(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs > 0.0 {
            self.items_processed() as f64 / secs
        } else {
            0.0
        }
    }
}

/// Decide how a run ended from the rank reports
///
/// A terminated rank means rank 0 declared global termination, which only
/// happens with every queue empty and nothing in flight. That outcome wins
/// over an abort that raced with it.
fn completion_status(reports: &[RankReport]) -> CompletionStatus {
    if reports.iter().any(|r| r.state == RankState::Terminated) {
        CompletionStatus::Completed
    } else if reports.iter().any(|r| r.state == RankState::Aborted) {
        CompletionStatus::Aborted
    } else {
        CompletionStatus::Completed
    }
}

/// One work-stealing engine instance
///
/// ```no_run
/// use workcircle::{Circle, CircleConfig, Handle};
///
/// let mut circle = Circle::new(CircleConfig::with_ranks(4))?;
/// circle.on_create(|h: &mut dyn Handle| {
///     for i in 0..100 {
///         h.enqueue_str(&i.to_string());
///     }
/// });
/// circle.on_process(|h: &mut dyn Handle| {
///     if let Some(item) = h.dequeue() {
///         println!("{:?}", item);
///     }
/// });
/// let report = circle.run()?;
/// println!("{:?}", report.status);
/// # Ok::<(), workcircle::CircleError>(())
/// ```
pub struct Circle {
    /// Configuration
    config: CircleConfig,

    /// Create callback
    create: Option<Callback>,

    /// Process callback
    process: Option<Callback>,

    /// Mailbox senders, one per rank
    senders: Vec<Sender<Message>>,

    /// Mailbox receivers, handed to the rank threads by `run`
    receivers: Vec<Receiver<Message>>,

    /// Loaded restart records, if `read_restarts` succeeded
    restarts: Option<Vec<Option<CheckpointRecord>>>,

    /// Live counters
    stats: Arc<RunStats>,
}

impl Circle {
    /// Create an engine with validated configuration
    pub fn new(config: CircleConfig) -> Result<Self> {
        config.validate()?;
        LazyLock::force(&EPOCH);

        let (senders, receivers) = mailboxes(config.ranks);
        debug!(ranks = config.ranks, "Circle created");

        Ok(Self {
            config,
            create: None,
            process: None,
            senders,
            receivers,
            restarts: None,
            stats: Arc::new(RunStats::default()),
        })
    }

    /// Register the create callback
    pub fn on_create<F>(&mut self, callback: F) -> &mut Self
    where
        F: Fn(&mut dyn Handle) + Send + Sync + 'static,
    {
        self.create = Some(Arc::new(callback));
        self
    }

    /// Register the process callback
    ///
    /// A panicking callback aborts the run. The item it dequeued before
    /// panicking is dropped: it is neither processed nor checkpointed.
    pub fn on_process<F>(&mut self, callback: F) -> &mut Self
    where
        F: Fn(&mut dyn Handle) + Send + Sync + 'static,
    {
        self.process = Some(Arc::new(callback));
        self
    }

    /// Apply option flags (split and create policy)
    pub fn set_options(&mut self, flags: Flags) -> &mut Self {
        self.config.set_options(flags);
        self
    }

    /// Current configuration
    pub fn config(&self) -> &CircleConfig {
        &self.config
    }

    /// Adjust configuration that does not affect the rank count
    pub(crate) fn config_mut(&mut self) -> &mut CircleConfig {
        &mut self.config
    }

    /// Handle for checkpoint and abort requests
    pub fn control(&self) -> Control {
        Control::new(self.senders.clone())
    }

    /// Live counters, readable while the run is in progress
    pub fn stats(&self) -> Arc<RunStats> {
        Arc::clone(&self.stats)
    }

    /// Load every rank's restart record
    ///
    /// On success the run skips the create step and starts from the loaded
    /// queues. Returns the number of items restored.
    pub fn read_restarts(&mut self) -> Result<usize> {
        let records = load_restarts(
            &self.config.checkpoint_dir,
            self.config.ranks,
            self.config.max_item_len,
            self.config.missing_restart,
        )?;

        let items: usize = records.iter().flatten().map(|r| r.items.len()).sum();
        info!(
            ranks = self.config.ranks,
            items,
            dir = %self.config.checkpoint_dir.display(),
            "Restart records loaded"
        );

        self.restarts = Some(records);
        Ok(items)
    }

    /// Run until global termination or abort
    pub fn run(mut self) -> Result<RunReport> {
        let process = self.process.take().ok_or(ConfigError::InvalidValue {
            name: "process callback",
            value: "none".into(),
            reason: "a process callback must be registered".into(),
        })?;

        let ranks = self.config.ranks;
        let restarted = self.restarts.is_some();
        let mut restores = self
            .restarts
            .take()
            .unwrap_or_else(|| (0..ranks).map(|_| None).collect());
        let generator = WorkGenerator::new(self.config.create, restarted, self.create.is_some());
        let config = Arc::new(self.config.clone());

        info!(
            ranks,
            split = ?config.split,
            create = ?config.create,
            restarted,
            "Starting circle"
        );

        let start = Instant::now();
        let mut workers = Vec::with_capacity(ranks);
        for (rank, mailbox) in std::mem::take(&mut self.receivers).into_iter().enumerate() {
            let setup = RankSetup {
                rank,
                config: Arc::clone(&config),
                create: self.create.clone(),
                process: Arc::clone(&process),
                generator,
                restore: restores[rank].take(),
                mailbox,
                peers: Peers::new(rank, self.senders.clone()),
                stats: Arc::clone(&self.stats),
            };

            match Worker::spawn(setup) {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    warn!(rank, error = %e, "Rank failed to start, aborting");
                    self.control().abort();
                    for worker in workers {
                        let _ = worker.join();
                    }
                    return Err(e.into());
                }
            }
        }
        info!(count = workers.len(), "Ranks spawned");

        let mut reports = Vec::with_capacity(ranks);
        let mut failure = None;
        for worker in workers {
            match worker.join() {
                Ok(report) => reports.push(report),
                Err(e) => {
                    warn!(error = %e, "Rank failed to join cleanly");
                    failure.get_or_insert(e);
                }
            }
        }
        if let Some(e) = failure {
            return Err(e.into());
        }

        let status = completion_status(&reports);

        if status == CompletionStatus::Completed && restarted {
            remove_records(&config.checkpoint_dir, ranks);
        }

        let report = RunReport {
            status,
            ranks: reports,
            restarted,
            duration: start.elapsed(),
        };

        info!(
            status = ?report.status,
            processed = report.items_processed(),
            remaining = report.items_remaining(),
            stolen = report.items_stolen(),
            duration_ms = report.duration.as_millis() as u64,
            "Circle finished"
        );

        Ok(report)
    }
}
