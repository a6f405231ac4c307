use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shardq_core::{Event, EventStatus, OutboxRecord, PartitionId};

use crate::error::Result;

/// Query/transaction contract the worker pipeline needs from storage.
///
/// Every method is one transaction. Implementations must guarantee claim
/// exclusivity: two concurrent [`claim_due`](EventStore::claim_due) calls
/// never return the same row, whatever the caller's partition ownership.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Insert a new event. Fails with `Duplicate` if the id exists.
    async fn insert_event(&self, event: &Event) -> Result<()>;

    async fn get_event(&self, id: &str) -> Result<Option<Event>>;

    /// Delete an event. Fails with `NotFound` if no row is deleted.
    async fn delete_event(&self, id: &str) -> Result<()>;

    /// Claim up to `limit` due `PENDING` rows of `partition`, oldest
    /// `scheduled_time` first, skipping rows held by other transactions.
    /// Claimed rows are committed as `IN_PROGRESS` with `locked_at = now`.
    async fn claim_due(
        &self,
        partition: PartitionId,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Event>>;

    /// Atomically insert `outbox` and save the terminal status of every
    /// event in `events`.
    ///
    /// Each event must still be `IN_PROGRESS` under the claim recorded in its
    /// `locked_at`; otherwise nothing is written and `ClaimLost` is returned.
    async fn complete_batch(&self, events: &[Event], outbox: &[OutboxRecord]) -> Result<()>;

    /// Reset `IN_PROGRESS` rows of `partitions` claimed before `cutoff` back
    /// to `PENDING`. Returns the number of rows reset.
    async fn reset_stale_claims(
        &self,
        partitions: &[PartitionId],
        cutoff: DateTime<Utc>,
    ) -> Result<u64>;

    /// Up to `limit` outbox rows of `partition`, oldest first.
    async fn fetch_outbox(&self, partition: PartitionId, limit: usize)
        -> Result<Vec<OutboxRecord>>;

    /// Delete outbox rows by id. Returns the number of rows deleted.
    async fn delete_outbox(&self, ids: &[String]) -> Result<u64>;

    async fn count_by_status(&self, status: EventStatus) -> Result<u64>;

    async fn outbox_len(&self) -> Result<u64>;
}
