//! Distributed work-stealing queue engine
//!
//! Ranks are threads, each with a private local queue and one inbound
//! mailbox. No queue is shared: work moves between ranks only inside
//! steal responses.
//!
//! # Architecture
//!
//! ```text
//!                     ┌─────────────────────────┐
//!                     │         Circle          │
//!                     │  - restart records      │
//!                     │  - spawn / join ranks   │
//!                     └───────────┬─────────────┘
//!                                 │
//!       ┌─────────────────────────┼─────────────────────────┐
//!       │                         │                         │
//! ┌─────▼─────┐  steal req  ┌─────▼─────┐  token      ┌─────▼─────┐
//! │  Rank 0   │◄───────────►│  Rank 1   │────────────►│  Rank N-1 │
//! │ LocalQueue│  steal resp │ LocalQueue│             │ LocalQueue│
//! │ mailbox   │             │ mailbox   │             │ mailbox   │
//! └─────┬─────┘             └─────┬─────┘             └─────┬─────┘
//!       │                         │                         │
//!       └────────────► circle<rank>.txt checkpoints ◄───────┘
//! ```

pub mod abort;
pub mod balance;
pub mod checkpoint;
pub mod coordinator;
mod generator;
pub mod handle;
mod message;
pub mod queue;
mod termination;
pub mod worker;

pub use abort::Control;
pub use balance::StealStats;
pub use checkpoint::{CheckpointManager, CheckpointRecord, CheckpointSummary};
pub use coordinator::{wtime, Circle, CompletionStatus, RunReport};
pub use handle::{current_rank, Callback, Handle};
pub use queue::{LocalQueue, QueueStats, WorkItem, RESERVED_DELIMITER};
pub use worker::{RankReport, RankState, RunStats};
