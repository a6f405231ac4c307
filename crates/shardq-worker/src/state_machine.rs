//! Per-partition OFFLINE / STANDBY / OWNER model driven by the coordinator.
//!
//! Notifications arrive at least once and may overlap with another node's
//! ownership of the same partition. Each partition is modelled independently;
//! redelivery of a transition whose target is the current state is accepted
//! as a no-op, while a jump that skips an intermediate state is rejected.
//! Ownership is only a load-distribution hint: claim exclusivity is enforced
//! by the store.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use shardq_core::PartitionId;
use tracing::{debug, info, warn};

use crate::{
    error::{Result, WorkerError},
    tracker::PartitionOwnershipTracker,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PartitionState {
    #[default]
    Offline,
    Standby,
    Owner,
}

impl fmt::Display for PartitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Offline => "OFFLINE",
            Self::Standby => "STANDBY",
            Self::Owner => "OWNER",
        };
        f.write_str(s)
    }
}

/// Callback contract offered to a cluster coordinator.
pub trait OwnershipListener: Send + Sync {
    /// This process is now the sole owner of `partition`.
    fn on_partition_becomes_owner(&self, partition: &str) -> Result<()>;

    /// This process no longer owns `partition`.
    fn on_partition_loses_ownership(&self, partition: &str) -> Result<()>;
}

impl<T: OwnershipListener + ?Sized> OwnershipListener for Arc<T> {
    fn on_partition_becomes_owner(&self, partition: &str) -> Result<()> {
        (**self).on_partition_becomes_owner(partition)
    }

    fn on_partition_loses_ownership(&self, partition: &str) -> Result<()> {
        (**self).on_partition_loses_ownership(partition)
    }
}

/// Coordinator-facing name of partition `n` of `resource`.
pub fn partition_name(resource: &str, partition: PartitionId) -> String {
    format!("{resource}_{partition}")
}

/// Trailing integer of a `<resource>_<n>` partition name.
pub fn parse_partition_id(name: &str) -> Result<PartitionId> {
    name.rsplit('_')
        .next()
        .and_then(|tail| tail.parse::<PartitionId>().ok())
        .ok_or_else(|| WorkerError::InvalidPartitionName(name.to_string()))
}

pub struct PartitionOwnershipStateMachine {
    states: DashMap<String, PartitionState>,
    tracker: Arc<PartitionOwnershipTracker>,
    num_partitions: u32,
}

impl PartitionOwnershipStateMachine {
    pub fn new(tracker: Arc<PartitionOwnershipTracker>, num_partitions: u32) -> Arc<Self> {
        Arc::new(Self {
            states: DashMap::new(),
            tracker,
            num_partitions,
        })
    }

    pub fn tracker(&self) -> &Arc<PartitionOwnershipTracker> {
        &self.tracker
    }

    pub fn state(&self, name: &str) -> PartitionState {
        self.states.get(name).map(|s| *s).unwrap_or_default()
    }

    pub fn on_offline_to_standby(&self, name: &str) -> Result<()> {
        self.transition(name, PartitionState::Offline, PartitionState::Standby)
    }

    pub fn on_standby_to_owner(&self, name: &str) -> Result<()> {
        self.transition(name, PartitionState::Standby, PartitionState::Owner)
    }

    pub fn on_owner_to_standby(&self, name: &str) -> Result<()> {
        self.transition(name, PartitionState::Owner, PartitionState::Standby)
    }

    pub fn on_standby_to_offline(&self, name: &str) -> Result<()> {
        self.transition(name, PartitionState::Standby, PartitionState::Offline)
    }

    /// Forget every partition model and empty the tracker. Used when the
    /// coordinator session is re-established and ownership is rebuilt.
    pub fn reset(&self) {
        warn!(models = self.states.len(), "resetting partition ownership state");
        self.states.clear();
        self.tracker.clear();
    }

    fn partition_id(&self, name: &str) -> Result<PartitionId> {
        let partition = parse_partition_id(name)?;
        if partition >= self.num_partitions {
            return Err(WorkerError::PartitionOutOfRange {
                partition,
                num_partitions: self.num_partitions,
            });
        }
        Ok(partition)
    }

    fn transition(&self, name: &str, from: PartitionState, to: PartitionState) -> Result<()> {
        let partition = self.partition_id(name)?;

        // Holding the entry serialises transitions of the same partition.
        let mut entry = self.states.entry(name.to_string()).or_default();
        let current = *entry;
        if current == to {
            debug!(partition = name, state = %to, "redelivered transition ignored");
            return Ok(());
        }
        if current != from {
            return Err(WorkerError::InvalidTransition {
                partition: name.to_string(),
                from: current,
                to,
            });
        }

        match to {
            PartitionState::Owner => self.tracker.add(partition),
            // Leaving OWNER stops new claims; committed claims stay IN_PROGRESS.
            PartitionState::Standby if from == PartitionState::Owner => {
                self.tracker.remove(partition)
            }
            PartitionState::Offline => self.tracker.remove(partition),
            PartitionState::Standby => {}
        }
        *entry = to;

        info!(partition = name, %from, %to, "partition state changed");
        Ok(())
    }
}

impl OwnershipListener for PartitionOwnershipStateMachine {
    fn on_partition_becomes_owner(&self, partition: &str) -> Result<()> {
        if self.state(partition) == PartitionState::Offline {
            self.on_offline_to_standby(partition)?;
        }
        self.on_standby_to_owner(partition)
    }

    fn on_partition_loses_ownership(&self, partition: &str) -> Result<()> {
        if self.state(partition) == PartitionState::Owner {
            self.on_owner_to_standby(partition)?;
        }
        self.on_standby_to_offline(partition)
    }
}
