use shardq_core::{PartitionId, ShardqError};
use tracing::info;

use crate::{
    error::Result,
    state_machine::{partition_name, OwnershipListener},
};

/// Fail fast when the routing partition count disagrees with the count the
/// coordinator was provisioned with; events would otherwise land on
/// partitions nobody is assigned.
pub fn validate_partition_count(configured: u32, coordinator: u32) -> Result<()> {
    if configured != coordinator {
        return Err(ShardqError::PartitionCountMismatch {
            configured,
            coordinator,
        }
        .into());
    }
    Ok(())
}

/// Config-driven coordinator: delivers a fixed assignment through the same
/// callbacks a cluster manager would.
#[derive(Debug, Clone)]
pub struct StaticCoordinator {
    resource_name: String,
    num_partitions: u32,
    partitions: Vec<PartitionId>,
}

impl StaticCoordinator {
    pub fn new(
        resource_name: impl Into<String>,
        num_partitions: u32,
        partitions: Vec<PartitionId>,
    ) -> Self {
        Self {
            resource_name: resource_name.into(),
            num_partitions,
            partitions,
        }
    }

    /// Partitions this coordinator hands out.
    pub fn partitions(&self) -> &[PartitionId] {
        &self.partitions
    }

    pub fn num_partitions(&self) -> u32 {
        self.num_partitions
    }

    /// Make `listener` the owner of every assigned partition.
    pub fn assign<L: OwnershipListener + ?Sized>(&self, listener: &L) -> Result<()> {
        for &partition in &self.partitions {
            listener.on_partition_becomes_owner(&partition_name(&self.resource_name, partition))?;
        }
        info!(
            resource = %self.resource_name,
            partitions = ?self.partitions,
            "static partition assignment delivered"
        );
        Ok(())
    }

    /// Take every assigned partition back from `listener`.
    pub fn release<L: OwnershipListener + ?Sized>(&self, listener: &L) -> Result<()> {
        for &partition in &self.partitions {
            listener
                .on_partition_loses_ownership(&partition_name(&self.resource_name, partition))?;
        }
        info!(resource = %self.resource_name, "static partition assignment released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::WorkerError, state_machine::PartitionOwnershipStateMachine,
        tracker::PartitionOwnershipTracker,
    };

    #[test]
    fn mismatched_counts_fail() {
        assert!(validate_partition_count(6, 6).is_ok());
        assert!(matches!(
            validate_partition_count(6, 8),
            Err(WorkerError::Config(ShardqError::PartitionCountMismatch { .. }))
        ));
    }

    #[test]
    fn assign_then_release() {
        let tracker = PartitionOwnershipTracker::new();
        let sm = PartitionOwnershipStateMachine::new(tracker.clone(), 6);
        let coordinator = StaticCoordinator::new("res", 6, vec![4, 1]);

        coordinator.assign(&sm).unwrap();
        assert_eq!(tracker.snapshot(), vec![1, 4]);

        // At-least-once delivery: a second assignment changes nothing.
        coordinator.assign(&sm).unwrap();
        assert_eq!(tracker.snapshot(), vec![1, 4]);

        coordinator.release(&sm).unwrap();
        assert!(tracker.is_empty());
    }
}
