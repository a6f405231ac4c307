use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use shardq_store::EventStore;
use tracing::{debug, error, warn};

use crate::tracker::PartitionOwnershipTracker;

/// Returns claims abandoned by crashed or stalled workers to `PENDING`.
#[derive(Clone)]
pub struct StuckClaimReaper {
    store: Arc<dyn EventStore>,
    tracker: Arc<PartitionOwnershipTracker>,
    stale_timeout: Duration,
}

impl StuckClaimReaper {
    pub fn new(
        store: Arc<dyn EventStore>,
        tracker: Arc<PartitionOwnershipTracker>,
        stale_timeout: std::time::Duration,
    ) -> Self {
        Self {
            store,
            tracker,
            stale_timeout: Duration::from_std(stale_timeout).unwrap_or_else(|_| Duration::days(36_500)),
        }
    }

    pub async fn reap(&self) -> u64 {
        self.reap_at(Utc::now()).await
    }

    /// Reset claims in owned partitions older than `now - stale_timeout`.
    /// Store errors are logged and count as zero; the next run retries.
    pub async fn reap_at(&self, now: DateTime<Utc>) -> u64 {
        let partitions = self.tracker.snapshot();
        if partitions.is_empty() {
            debug!("no owned partitions; reaper skipped");
            return 0;
        }

        let Some(cutoff) = now.checked_sub_signed(self.stale_timeout) else {
            return 0;
        };
        match self.store.reset_stale_claims(&partitions, cutoff).await {
            Ok(0) => 0,
            Ok(n) => {
                warn!(count = n, ?partitions, %cutoff, "reset stuck claims to PENDING");
                n
            }
            Err(e) => {
                error!(error = %e, "stuck-claim reset failed");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardq_core::{Event, EventStatus};
    use shardq_store::MemoryStore;

    #[tokio::test]
    async fn resets_once_then_idempotent() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.insert_event(&Event::pending("a", "t", 0, now, "{}")).await.unwrap();
        store.claim_due(0, now, 10).await.unwrap();

        let tracker = PartitionOwnershipTracker::new();
        tracker.add(0);
        let reaper = StuckClaimReaper::new(
            Arc::new(store.clone()),
            tracker,
            std::time::Duration::from_secs(600),
        );

        assert_eq!(reaper.reap_at(now + Duration::minutes(5)).await, 0);
        let later = now + Duration::minutes(11);
        assert_eq!(reaper.reap_at(later).await, 1);
        assert_eq!(reaper.reap_at(later).await, 0);
        assert_eq!(store.count_by_status(EventStatus::Pending).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn store_errors_are_swallowed() {
        let store = MemoryStore::new();
        store.set_unavailable(true).unwrap();
        let tracker = PartitionOwnershipTracker::new();
        tracker.add(0);
        let reaper = StuckClaimReaper::new(
            Arc::new(store),
            tracker,
            std::time::Duration::from_secs(600),
        );
        assert_eq!(reaper.reap().await, 0);
    }
}
