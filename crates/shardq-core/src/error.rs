use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShardqError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Partition count mismatch: configured {configured}, coordinator reports {coordinator}")]
    PartitionCountMismatch { configured: u32, coordinator: u32 },

    #[error("Partition {partition} out of range (num_partitions = {num_partitions})")]
    PartitionOutOfRange { partition: u32, num_partitions: u32 },

    #[error("Invalid event status: {0}")]
    InvalidStatus(String),
}

pub type Result<T> = std::result::Result<T, ShardqError>;
