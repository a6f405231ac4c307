//! `shardq-worker`: the partition claim / process / publish / recover loop.
//!
//! # Overview
//!
//! A [`WorkerNode`] owns a dynamic set of hash partitions, fed by
//! coordinator callbacks through the [`PartitionOwnershipStateMachine`].
//! Three pollers read a snapshot of that set each cycle:
//!
//! | Poller      | Component                   | Default interval |
//! |-------------|-----------------------------|------------------|
//! | `pipeline`  | [`ClaimAndProcessPipeline`] | 1 s              |
//! | `publisher` | [`OutboxPublisher`]         | 1 s              |
//! | `reaper`    | [`StuckClaimReaper`]        | 60 s             |
//!
//! Ownership may briefly overlap between nodes during hand-off. Every claim
//! goes through the store, which never hands the same row to two claimers,
//! so overlap costs throughput only.

pub mod bus;
pub mod coordinator;
pub mod error;
pub mod node;
pub mod pipeline;
pub mod poller;
pub mod pool;
pub mod publisher;
pub mod reaper;
pub mod state_machine;
pub mod submit;
pub mod task;
pub mod tracker;

pub use bus::{InMemoryBus, LogBus, MessageBus, WebhookBus};
pub use coordinator::{validate_partition_count, StaticCoordinator};
pub use error::{BusError, Result, WorkerError};
pub use node::{NodeHandle, WorkerNode};
pub use pipeline::{ClaimAndProcessPipeline, CycleReport};
pub use publisher::{OutboxPublisher, PublishReport};
pub use reaper::StuckClaimReaper;
pub use state_machine::{OwnershipListener, PartitionOwnershipStateMachine, PartitionState};
pub use submit::EventSubmitter;
pub use task::{AcknowledgeHandler, FnHandler, TaskHandler, TaskOutcome};
pub use tracker::PartitionOwnershipTracker;
