//! Error types for workcircle
//!
//! This module defines the error hierarchy for the engine:
//! - Local queue rejections (never cross the callback boundary)
//! - Checkpoint write failures
//! - Restart record failures (fatal to the host)
//! - Configuration errors
//! - Rank thread errors
//!
//! Queue-local and steal-protocol conditions are handled inside the engine.
//! Only configuration, restart and thread failures reach the host as errors;
//! an abort is a completion status, not an error.

use crate::engine::CompletionStatus;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for workcircle
#[derive(Error, Debug)]
pub enum CircleError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Restart records could not be used
    #[error("Restart error: {0}")]
    Restart(#[from] RestartError),

    /// Checkpoint write errors
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Rank thread errors
    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CircleError {
    /// Process exit code for this error
    ///
    /// Restart failures get their own code, everything else is 1.
    pub fn exit_code(&self) -> u8 {
        match self {
            CircleError::Restart(_) => CompletionStatus::RestartFailed.exit_code(),
            _ => 1,
        }
    }
}

/// Reasons an enqueue is rejected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Item is longer than the configured maximum
    #[error("Work item of {len} bytes exceeds the maximum of {max} bytes")]
    ItemTooLong { len: usize, max: usize },

    /// Item contains the reserved delimiter byte
    #[error("Work item contains the reserved NUL byte at offset {offset}")]
    ContainsDelimiter { offset: usize },

    /// Bounded queue is at capacity
    #[error("Local queue is full ({capacity} items)")]
    QueueFull { capacity: usize },
}

/// Checkpoint write errors
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// Failed to create the checkpoint directory
    #[error("Failed to create checkpoint directory '{path}': {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to write or rename the record
    #[error("Failed to write checkpoint '{path}': {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to encode the record
    #[error("Failed to encode checkpoint for rank {rank}: {reason}")]
    Encode { rank: usize, reason: String },
}

/// Restart record errors
///
/// Every variant is a hard failure: the host must decide what to do,
/// the engine never silently starts from an empty queue.
#[derive(Error, Debug)]
pub enum RestartError {
    /// No record exists for a rank
    #[error("No restart record for rank {rank} at '{path}'")]
    Missing { rank: usize, path: PathBuf },

    /// Record exists but cannot be decoded
    #[error("Malformed restart record '{path}': {reason}")]
    Malformed { path: PathBuf, reason: String },

    /// Record header names a different rank than its file name
    #[error("Restart record '{path}' belongs to rank {found}, expected rank {expected}")]
    RankMismatch {
        path: PathBuf,
        expected: usize,
        found: usize,
    },

    /// Record exists for a rank outside the current run
    #[error("Restart record '{path}' is for rank {rank} but the run has only {ranks} ranks")]
    UnexpectedRank {
        path: PathBuf,
        rank: usize,
        ranks: usize,
    },

    /// Record could not be read
    #[error("Failed to read restart record '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Invalid rank count
    #[error("Invalid rank count {count}: must be between 1 and {max}")]
    InvalidRankCount { count: usize, max: usize },

    /// Invalid maximum item length
    #[error("Invalid maximum item length {len}: must be between 1 and {max}")]
    InvalidItemLength { len: usize, max: usize },

    /// Invalid queue capacity
    #[error("Invalid queue capacity {capacity}: must be at least 1")]
    InvalidCapacity { capacity: usize },

    /// Timing settings are inconsistent
    #[error("Invalid timing: {reason}")]
    InvalidTiming { reason: String },

    /// Unparseable option value
    #[error("Invalid value '{value}' for {name}: {reason}")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: String,
    },

    /// Checkpoint directory is not usable
    #[error("Invalid checkpoint directory '{path}': {reason}")]
    InvalidCheckpointDir { path: PathBuf, reason: String },
}

/// Rank thread errors
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Thread could not be spawned
    #[error("Failed to spawn rank {rank}: {reason}")]
    SpawnFailed { rank: usize, reason: String },

    /// Thread panicked outside of a user callback
    #[error("Rank {rank} panicked: {message}")]
    Panicked { rank: usize, message: String },
}

/// Result type alias for CircleError
pub type Result<T> = std::result::Result<T, CircleError>;

/// Result type alias for QueueError
pub type QueueResult<T> = std::result::Result<T, QueueError>;

/// Result type alias for RestartError
pub type RestartResult<T> = std::result::Result<T, RestartError>;

/// Result type alias for CheckpointError
pub type CheckpointResult<T> = std::result::Result<T, CheckpointError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion() {
        let restart = RestartError::Missing {
            rank: 3,
            path: PathBuf::from("/tmp/circle3.txt"),
        };
        let err: CircleError = restart.into();
        assert!(matches!(err, CircleError::Restart(_)));
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn test_queue_error_messages() {
        let err = QueueError::ItemTooLong { len: 10, max: 4 };
        assert_eq!(
            err.to_string(),
            "Work item of 10 bytes exceeds the maximum of 4 bytes"
        );

        let err: CircleError = ConfigError::InvalidCapacity { capacity: 0 }.into();
        assert_eq!(err.exit_code(), 1);
    }
}
