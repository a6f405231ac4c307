use shardq_core::PartitionId;
use shardq_store::StoreError;
use thiserror::Error;

use crate::state_machine::PartitionState;

/// Errors surfaced by the worker components.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The coordinator delivered a partition name without a trailing integer.
    #[error("Invalid partition name: {0}")]
    InvalidPartitionName(String),

    #[error("Partition {partition} out of range (num_partitions = {num_partitions})")]
    PartitionOutOfRange {
        partition: PartitionId,
        num_partitions: u32,
    },

    /// A state change that skips a required intermediate state.
    #[error("Invalid transition for {partition}: {from} -> {to}")]
    InvalidTransition {
        partition: String,
        from: PartitionState,
        to: PartitionState,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] shardq_core::ShardqError),
}

/// Failure to hand one message to the bus. Always retryable.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Publish failed: {0}")]
    PublishFailed(String),

    #[error("Publish timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, WorkerError>;
