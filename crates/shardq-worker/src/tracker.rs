use std::sync::Arc;

use dashmap::DashSet;
use shardq_core::PartitionId;
use tracing::info;

/// Concurrent set of the partitions this process currently owns.
///
/// Mutated only by ownership notifications; the pollers read it through
/// [`snapshot`](Self::snapshot) once per cycle.
#[derive(Debug, Default)]
pub struct PartitionOwnershipTracker {
    owned: DashSet<PartitionId>,
}

impl PartitionOwnershipTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, partition: PartitionId) {
        if self.owned.insert(partition) {
            info!(partition, "partition added to owned set");
        }
    }

    pub fn remove(&self, partition: PartitionId) {
        if self.owned.remove(&partition).is_some() {
            info!(partition, "partition removed from owned set");
        }
    }

    pub fn contains(&self, partition: PartitionId) -> bool {
        self.owned.contains(&partition)
    }

    pub fn is_empty(&self) -> bool {
        self.owned.is_empty()
    }

    /// Point-in-time copy of the owned set, sorted ascending.
    pub fn snapshot(&self) -> Vec<PartitionId> {
        let mut partitions: Vec<PartitionId> = self.owned.iter().map(|p| *p).collect();
        partitions.sort_unstable();
        partitions
    }

    pub fn clear(&self) {
        if !self.owned.is_empty() {
            info!(count = self.owned.len(), "clearing owned partitions");
            self.owned.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_remove_are_idempotent() {
        let tracker = PartitionOwnershipTracker::new();
        tracker.add(3);
        tracker.add(3);
        tracker.add(1);
        assert_eq!(tracker.snapshot(), vec![1, 3]);

        tracker.remove(3);
        tracker.remove(3);
        assert_eq!(tracker.snapshot(), vec![1]);
        assert!(tracker.contains(1));
        assert!(!tracker.contains(3));
    }

    #[test]
    fn snapshot_is_detached_from_later_mutation() {
        let tracker = PartitionOwnershipTracker::new();
        tracker.add(0);
        let snap = tracker.snapshot();
        tracker.add(5);
        tracker.clear();
        assert_eq!(snap, vec![0]);
        assert!(tracker.is_empty());
    }
}
