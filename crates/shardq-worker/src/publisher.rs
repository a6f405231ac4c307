//! Outbox drain: publish records to the bus, delete the confirmed ones.

use std::ops::AddAssign;
use std::sync::Arc;

use futures_util::future::join_all;
use shardq_core::config::OutboxConfig;
use shardq_core::PartitionId;
use shardq_store::EventStore;
use tracing::{debug, error, info, warn};

use crate::{bus::MessageBus, tracker::PartitionOwnershipTracker};

/// Counters for one publisher cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub partitions: usize,
    pub fetched: usize,
    pub published: usize,
    pub failed: usize,
    pub deleted: u64,
}

impl AddAssign for PublishReport {
    fn add_assign(&mut self, other: Self) {
        self.partitions += other.partitions;
        self.fetched += other.fetched;
        self.published += other.published;
        self.failed += other.failed;
        self.deleted += other.deleted;
    }
}

#[derive(Clone)]
pub struct OutboxPublisher {
    store: Arc<dyn EventStore>,
    tracker: Arc<PartitionOwnershipTracker>,
    bus: Arc<dyn MessageBus>,
    fetch_batch_size: usize,
    max_batches_per_cycle: usize,
}

impl OutboxPublisher {
    pub fn new(
        store: Arc<dyn EventStore>,
        tracker: Arc<PartitionOwnershipTracker>,
        bus: Arc<dyn MessageBus>,
        config: &OutboxConfig,
    ) -> Self {
        Self {
            store,
            tracker,
            bus,
            fetch_batch_size: config.fetch_batch_size,
            max_batches_per_cycle: config.max_batches_per_cycle,
        }
    }

    pub async fn run_cycle(&self) -> PublishReport {
        let mut partitions = self.tracker.snapshot();
        if partitions.is_empty() {
            debug!("no owned partitions; publisher cycle skipped");
            return PublishReport::default();
        }
        fastrand::shuffle(&mut partitions);

        let mut report = PublishReport::default();
        for partial in join_all(partitions.iter().map(|&p| self.drain_partition(p))).await {
            report += partial;
        }
        if report.fetched > 0 {
            info!(
                published = report.published,
                failed = report.failed,
                deleted = report.deleted,
                "publisher cycle finished"
            );
        }
        report
    }

    async fn drain_partition(&self, partition: PartitionId) -> PublishReport {
        let mut report = PublishReport {
            partitions: 1,
            ..PublishReport::default()
        };

        for _ in 0..self.max_batches_per_cycle {
            let records = match self
                .store
                .fetch_outbox(partition, self.fetch_batch_size)
                .await
            {
                Ok(records) => records,
                Err(e) => {
                    error!(partition, error = %e, "outbox fetch failed");
                    break;
                }
            };
            if records.is_empty() {
                break;
            }
            report.fetched += records.len();

            let sends = records
                .iter()
                .map(|r| self.bus.publish(&r.aggregate_id, &r.payload));
            let results = join_all(sends).await;

            // Only rows the bus confirmed are deleted; the rest retry later.
            let mut confirmed = Vec::with_capacity(records.len());
            for (record, result) in records.iter().zip(results) {
                match result {
                    Ok(()) => confirmed.push(record.id.clone()),
                    Err(e) => {
                        warn!(partition, aggregate_id = %record.aggregate_id, error = %e, "publish failed");
                        report.failed += 1;
                    }
                }
            }
            report.published += confirmed.len();
            if confirmed.is_empty() {
                break;
            }

            match self.store.delete_outbox(&confirmed).await {
                Ok(n) => report.deleted += n,
                Err(e) => {
                    // Rows will be published again; consumers de-duplicate.
                    error!(partition, error = %e, "outbox delete failed after publish");
                    break;
                }
            }

            if records.len() < self.fetch_batch_size {
                break;
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;
    use chrono::Utc;
    use shardq_core::{Event, OutboxRecord};
    use shardq_store::MemoryStore;

    async fn seed(store: &MemoryStore, partition: PartitionId, n: usize) {
        let now = Utc::now();
        for i in 0..n {
            let id = format!("p{partition}-{i}");
            store
                .insert_event(&Event::pending(&id, "t", partition, now, "{}"))
                .await
                .unwrap();
        }
        let mut claimed = store.claim_due(partition, now, n).await.unwrap();
        claimed.iter_mut().for_each(|e| e.mark_processed());
        let outbox: Vec<_> = claimed.iter().map(|e| OutboxRecord::for_event(e, now)).collect();
        store.complete_batch(&claimed, &outbox).await.unwrap();
    }

    fn publisher(store: &MemoryStore, bus: &Arc<InMemoryBus>, owned: &[PartitionId]) -> OutboxPublisher {
        let tracker = PartitionOwnershipTracker::new();
        owned.iter().for_each(|&p| tracker.add(p));
        OutboxPublisher::new(
            Arc::new(store.clone()),
            tracker,
            Arc::clone(bus) as Arc<dyn MessageBus>,
            &OutboxConfig::default(),
        )
    }

    #[tokio::test]
    async fn publishes_only_owned_partitions() {
        let store = MemoryStore::new();
        seed(&store, 0, 3).await;
        seed(&store, 1, 2).await;
        let bus = Arc::new(InMemoryBus::new());

        let report = publisher(&store, &bus, &[0]).run_cycle().await;
        assert_eq!(report.deleted, 3);
        assert_eq!(bus.published_count(), 3);
        assert_eq!(store.outbox_len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn failed_rows_are_kept_and_retried() {
        let store = MemoryStore::new();
        seed(&store, 0, 5).await;
        let bus = Arc::new(InMemoryBus::new());
        let publisher = publisher(&store, &bus, &[0]);

        bus.fail_next(2);
        let first = publisher.run_cycle().await;
        assert_eq!((first.published, first.failed, first.deleted), (3, 2, 3));
        assert_eq!(store.outbox_len().await.unwrap(), 2);

        let second = publisher.run_cycle().await;
        assert_eq!(second.deleted, 2);
        assert_eq!(store.outbox_len().await.unwrap(), 0);
        assert_eq!(bus.published_count(), 5);
    }

    #[tokio::test]
    async fn bus_outage_stops_the_partition() {
        let store = MemoryStore::new();
        seed(&store, 0, 4).await;
        let bus = Arc::new(InMemoryBus::new());
        bus.set_failing(true);

        let report = publisher(&store, &bus, &[0]).run_cycle().await;
        assert_eq!((report.fetched, report.failed, report.deleted), (4, 4, 0));
        assert_eq!(store.outbox_len().await.unwrap(), 4);
    }
}
