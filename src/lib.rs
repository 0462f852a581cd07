//! workcircle - Distributed Work-Stealing Queue Engine
//!
//! Drains a dynamically generated pool of opaque work items across many
//! ranks with no central queue. Designed for large fan-out batch workloads
//! (tree walks, bulk command execution) where work is discovered lazily and
//! load is badly skewed.
//!
//! # Features
//!
//! - **Work Stealing**: Idle ranks take half of a busy rank's queue, picking
//!   victims at random or along the ring.
//!
//! - **Termination Detection**: A token ring decides when every queue is
//!   empty and no work is in flight.
//!
//! - **Checkpoint/Restart**: Each rank can snapshot its queue to disk; a
//!   later run resumes from the snapshots.
//!
//! - **Cooperative Abort**: Cancelling a run checkpoints all remaining work.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Host                                    │
//! │       create callback   process callback   Control handle        │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Rank Threads                              │
//! │  ┌─────────┐  ┌─────────┐  ┌─────────┐         ┌─────────┐     │
//! │  │ Rank 0  │  │ Rank 1  │  │ Rank 2  │  ...    │ Rank N-1│     │
//! │  │ queue   │  │ queue   │  │ queue   │         │ queue   │     │
//! │  └────┬────┘  └────┬────┘  └────┬────┘         └────┬────┘     │
//! │       │            │            │                    │          │
//! │       └────────────┴─ mailboxes (crossbeam) ─────────┘          │
//! │              steal requests · responses · token                  │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │ checkpoint / abort
//!                               ▼
//!                    ┌──────────────────┐
//!                    │ circle<rank>.txt │
//!                    └──────────────────┘
//! ```
//!
//! # Example
//!
//! ```bash
//! # Compress every log file using 16 ranks
//! find . -name '*.log' | workcircle -n 16 xargs gzip
//!
//! # Walk a tree, then resume it after an interrupt
//! workcircle walk /data --checkpoint-dir ckpt
//! workcircle walk /data --checkpoint-dir ckpt --restart
//! ```

pub mod channel;
pub mod commands;
pub mod config;
pub mod engine;
pub mod error;
pub mod progress;

pub use channel::{channel_begin, ChannelQueue};
pub use config::{CircleConfig, CreatePolicy, Flags, LogLevel, MissingRestart, SplitPolicy};
pub use engine::{
    current_rank, wtime, Circle, CompletionStatus, Control, Handle, LocalQueue, RunReport,
    WorkItem,
};
pub use error::{CircleError, Result};
