//! `shardq-core`: shared types, configuration and partition routing for the
//! shardq worker fleet.

pub mod config;
pub mod error;
pub mod partition;
pub mod truncate;
pub mod types;

pub use config::ShardqConfig;
pub use error::{Result, ShardqError};
pub use partition::partition_for;
pub use types::{Event, EventStatus, NewEvent, OutboxRecord, PartitionId};
