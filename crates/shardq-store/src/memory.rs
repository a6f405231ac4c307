//! In-process [`EventStore`] with row-level locks.
//!
//! Each trait call is one transaction executed under a single mutex, so it is
//! atomic with respect to every other call. [`RowLock`] models a lock held by
//! an outside transaction (`SELECT ... FOR UPDATE` on another connection):
//! claims skip such rows instead of waiting, exactly like `SKIP LOCKED`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shardq_core::{Event, EventStatus, OutboxRecord, PartitionId};
use tracing::debug;

use crate::{
    error::{Result, StoreError},
    store::EventStore,
};

#[derive(Default)]
struct Inner {
    events: HashMap<String, Event>,
    /// Outbox rows keyed by id, with an insertion sequence for tie-breaking.
    outbox: HashMap<String, (u64, OutboxRecord)>,
    next_seq: u64,
    row_locks: HashSet<String>,
    claim_counts: HashMap<String, u32>,
    failing_completions: u32,
    unavailable: bool,
}

impl Inner {
    fn ensure_available(&self) -> Result<()> {
        if self.unavailable {
            return Err(StoreError::Unavailable("memory store marked unavailable".into()));
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

/// Lock on one event row held outside the store's own transactions.
/// Released on drop.
pub struct RowLock {
    id: String,
    inner: Arc<Mutex<Inner>>,
}

impl Drop for RowLock {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.row_locks.remove(&self.id);
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store mutex poisoned".into()))
    }

    /// Take a row lock on `id`, as another transaction would with
    /// `SELECT ... FOR UPDATE`. Fails with `RowLocked` if already held.
    pub fn lock_row(&self, id: &str) -> Result<RowLock> {
        let mut inner = self.lock()?;
        if !inner.events.contains_key(id) {
            return Err(StoreError::NotFound { id: id.to_string() });
        }
        if !inner.row_locks.insert(id.to_string()) {
            return Err(StoreError::RowLocked { id: id.to_string() });
        }
        Ok(RowLock {
            id: id.to_string(),
            inner: Arc::clone(&self.inner),
        })
    }

    /// Make the next `n` calls to `complete_batch` fail before writing anything.
    pub fn fail_next_completions(&self, n: u32) -> Result<()> {
        self.lock()?.failing_completions = n;
        Ok(())
    }

    /// Toggle whole-store unavailability; every call fails while set.
    pub fn set_unavailable(&self, unavailable: bool) -> Result<()> {
        self.lock()?.unavailable = unavailable;
        Ok(())
    }

    /// How many times each event has been claimed so far.
    pub fn claim_counts(&self) -> Result<HashMap<String, u32>> {
        Ok(self.lock()?.claim_counts.clone())
    }

    pub fn events(&self) -> Result<Vec<Event>> {
        Ok(self.lock()?.events.values().cloned().collect())
    }

    pub fn outbox_records(&self) -> Result<Vec<OutboxRecord>> {
        Ok(self
            .lock()?
            .outbox
            .values()
            .map(|(_, record)| record.clone())
            .collect())
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn insert_event(&self, event: &Event) -> Result<()> {
        let mut inner = self.lock()?;
        inner.ensure_available()?;
        if inner.events.contains_key(&event.id) {
            return Err(StoreError::Duplicate {
                id: event.id.clone(),
            });
        }
        inner.events.insert(event.id.clone(), event.clone());
        Ok(())
    }

    async fn get_event(&self, id: &str) -> Result<Option<Event>> {
        let inner = self.lock()?;
        inner.ensure_available()?;
        Ok(inner.events.get(id).cloned())
    }

    async fn delete_event(&self, id: &str) -> Result<()> {
        let mut inner = self.lock()?;
        inner.ensure_available()?;
        if inner.row_locks.contains(id) {
            return Err(StoreError::RowLocked { id: id.to_string() });
        }
        inner
            .events
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })
    }

    async fn claim_due(
        &self,
        partition: PartitionId,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Event>> {
        let mut inner = self.lock()?;
        inner.ensure_available()?;

        let mut due: Vec<(DateTime<Utc>, String)> = inner
            .events
            .values()
            .filter(|e| e.partition_id == partition && e.is_due(now))
            .filter(|e| !inner.row_locks.contains(&e.id))
            .map(|e| (e.scheduled_time, e.id.clone()))
            .collect();
        due.sort();
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            *inner.claim_counts.entry(id.clone()).or_insert(0) += 1;
            if let Some(event) = inner.events.get_mut(&id) {
                event.status = EventStatus::InProgress;
                event.locked_at = Some(now);
                claimed.push(event.clone());
            }
        }

        debug!(partition, count = claimed.len(), "claimed events");
        Ok(claimed)
    }

    async fn complete_batch(&self, events: &[Event], outbox: &[OutboxRecord]) -> Result<()> {
        let mut inner = self.lock()?;
        inner.ensure_available()?;
        if inner.failing_completions > 0 {
            inner.failing_completions -= 1;
            return Err(StoreError::Unavailable("injected completion failure".into()));
        }

        // Validate everything first; nothing is written unless all rows pass.
        for event in events {
            if inner.row_locks.contains(&event.id) {
                return Err(StoreError::RowLocked {
                    id: event.id.clone(),
                });
            }
            let claim_held = inner.events.get(&event.id).is_some_and(|stored| {
                stored.status == EventStatus::InProgress && stored.locked_at == event.locked_at
            });
            if !claim_held {
                return Err(StoreError::ClaimLost {
                    id: event.id.clone(),
                });
            }
        }
        if let Some(record) = outbox.iter().find(|r| inner.outbox.contains_key(&r.id)) {
            return Err(StoreError::Duplicate {
                id: record.id.clone(),
            });
        }

        for record in outbox {
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.outbox.insert(record.id.clone(), (seq, record.clone()));
        }
        for event in events {
            if let Some(stored) = inner.events.get_mut(&event.id) {
                stored.status = event.status;
                stored.exception_stack_trace = event.exception_stack_trace.clone();
                stored.locked_at = None;
            }
        }
        Ok(())
    }

    async fn reset_stale_claims(
        &self,
        partitions: &[PartitionId],
        cutoff: DateTime<Utc>,
    ) -> Result<u64> {
        let mut inner = self.lock()?;
        inner.ensure_available()?;
        let Inner {
            events, row_locks, ..
        } = &mut *inner;

        let mut reset = 0u64;
        for event in events.values_mut() {
            let stale = event.status == EventStatus::InProgress
                && partitions.contains(&event.partition_id)
                && event.locked_at.is_some_and(|at| at < cutoff)
                && !row_locks.contains(&event.id);
            if stale {
                event.status = EventStatus::Pending;
                event.locked_at = None;
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn fetch_outbox(
        &self,
        partition: PartitionId,
        limit: usize,
    ) -> Result<Vec<OutboxRecord>> {
        let inner = self.lock()?;
        inner.ensure_available()?;
        let mut rows: Vec<&(u64, OutboxRecord)> = inner
            .outbox
            .values()
            .filter(|(_, r)| r.partition_id == partition)
            .collect();
        rows.sort_by(|a, b| a.1.created_at.cmp(&b.1.created_at).then(a.0.cmp(&b.0)));
        Ok(rows
            .into_iter()
            .take(limit)
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn delete_outbox(&self, ids: &[String]) -> Result<u64> {
        let mut inner = self.lock()?;
        inner.ensure_available()?;
        let deleted = ids
            .iter()
            .filter(|id| inner.outbox.remove(id.as_str()).is_some())
            .count();
        Ok(deleted as u64)
    }

    async fn count_by_status(&self, status: EventStatus) -> Result<u64> {
        let inner = self.lock()?;
        inner.ensure_available()?;
        Ok(inner.events.values().filter(|e| e.status == status).count() as u64)
    }

    async fn outbox_len(&self) -> Result<u64> {
        let inner = self.lock()?;
        inner.ensure_available()?;
        Ok(inner.outbox.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn pending(id: &str, partition: PartitionId, at: DateTime<Utc>) -> Event {
        Event::pending(id, "test", partition, at, "{}")
    }

    #[tokio::test]
    async fn claim_skips_externally_locked_rows() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.insert_event(&pending("locked", 1, now)).await.unwrap();
        store.insert_event(&pending("free", 1, now)).await.unwrap();

        let guard = store.lock_row("locked").unwrap();
        let claimed = store.claim_due(1, now, 50).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, "free");

        drop(guard);
        let claimed = store.claim_due(1, now, 50).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, "locked");
    }

    #[tokio::test]
    async fn row_lock_is_exclusive() {
        let store = MemoryStore::new();
        store.insert_event(&pending("a", 0, Utc::now())).await.unwrap();
        let _held = store.lock_row("a").unwrap();
        assert!(matches!(store.lock_row("a"), Err(StoreError::RowLocked { .. })));
    }

    #[tokio::test]
    async fn injected_completion_failure_writes_nothing() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.insert_event(&pending("a", 0, now)).await.unwrap();
        let mut claimed = store.claim_due(0, now, 50).await.unwrap();
        claimed[0].mark_processed();
        let outbox = vec![OutboxRecord::for_event(&claimed[0], now)];

        store.fail_next_completions(1).unwrap();
        assert!(store.complete_batch(&claimed, &outbox).await.is_err());
        assert_eq!(store.outbox_len().await.unwrap(), 0);
        assert_eq!(store.count_by_status(EventStatus::InProgress).await.unwrap(), 1);

        store.complete_batch(&claimed, &outbox).await.unwrap();
        assert_eq!(store.outbox_len().await.unwrap(), 1);
        assert_eq!(store.count_by_status(EventStatus::Processed).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn reset_only_touches_stale_claims_in_given_partitions() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.insert_event(&pending("p0", 0, now)).await.unwrap();
        store.insert_event(&pending("p1", 1, now)).await.unwrap();
        store.claim_due(0, now, 50).await.unwrap();
        store.claim_due(1, now, 50).await.unwrap();

        // Not stale yet.
        assert_eq!(store.reset_stale_claims(&[0, 1], now).await.unwrap(), 0);
        // Stale, but only partition 0 is requested.
        let later = now + Duration::minutes(11);
        assert_eq!(store.reset_stale_claims(&[0], later).await.unwrap(), 1);
        assert_eq!(
            store.get_event("p0").await.unwrap().unwrap().status,
            EventStatus::Pending
        );
        assert_eq!(
            store.get_event("p1").await.unwrap().unwrap().status,
            EventStatus::InProgress
        );
    }

    #[tokio::test]
    async fn unavailable_store_rejects_claims() {
        let store = MemoryStore::new();
        store.set_unavailable(true).unwrap();
        assert!(matches!(
            store.claim_due(0, Utc::now(), 50).await,
            Err(StoreError::Unavailable(_))
        ));
    }
}
