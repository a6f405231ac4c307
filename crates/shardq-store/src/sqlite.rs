use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode, TransactionBehavior};
use shardq_core::types::{format_timestamp, parse_timestamp};
use shardq_core::{Event, EventStatus, OutboxRecord, PartitionId};
use tracing::{debug, instrument};

use crate::{
    db::init_db,
    error::{Result, StoreError},
    store::EventStore,
};

const EVENT_COLUMNS: &str = "id, name, partition_id, scheduled_time, payload, status,
     locked_at, exception_stack_trace, created_at, namespace";

const OUTBOX_COLUMNS: &str = "id, aggregate_id, aggregate_type, partition_id, payload, created_at";

/// SQLite-backed [`EventStore`].
///
/// Wraps one connection in a `Mutex`; every call runs on the blocking pool.
/// Claim exclusivity comes from `BEGIN IMMEDIATE`: SQLite admits one writer
/// at a time across all connections to the file, so a claim transaction
/// never observes a row that a concurrent claim already flipped to
/// `IN_PROGRESS`. Several worker processes may open the same file.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Wrap an already-open connection, initialising the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open (or create) the database file at `path` in WAL mode.
    pub fn open(path: &str, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.busy_timeout(busy_timeout)?;
        Self::new(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    /// Run `f` against the connection on the blocking thread pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Unavailable("connection mutex poisoned".into()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

#[async_trait]
impl EventStore for SqliteStore {
    #[instrument(skip(self, event), fields(event_id = %event.id, partition = event.partition_id))]
    async fn insert_event(&self, event: &Event) -> Result<()> {
        let event = event.clone();
        self.with_conn(move |conn| {
            let res = conn.execute(
                "INSERT INTO events
                 (id, name, partition_id, scheduled_time, payload, status,
                  locked_at, exception_stack_trace, created_at, namespace)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                rusqlite::params![
                    event.id,
                    event.name,
                    event.partition_id,
                    format_timestamp(event.scheduled_time),
                    event.payload,
                    event.status.as_str(),
                    event.locked_at.map(format_timestamp),
                    event.exception_stack_trace,
                    format_timestamp(event.created_at),
                    event.namespace,
                ],
            );
            match res {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == ErrorCode::ConstraintViolation =>
                {
                    Err(StoreError::Duplicate { id: event.id })
                }
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn get_event(&self, id: &str) -> Result<Option<Event>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = ?1");
            match conn.query_row(&sql, [&id], row_to_event) {
                Ok(event) => Ok(Some(event)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn delete_event(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let n = conn.execute("DELETE FROM events WHERE id = ?1", [&id])?;
            if n == 0 {
                return Err(StoreError::NotFound { id });
            }
            Ok(())
        })
        .await
    }

    #[instrument(skip(self))]
    async fn claim_due(
        &self,
        partition: PartitionId,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Event>> {
        self.with_conn(move |conn| {
            let now_str = format_timestamp(now);
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            // Collect eagerly so `stmt` is dropped before the UPDATE borrows `tx`.
            let mut claimed: Vec<Event> = {
                let sql = format!(
                    "SELECT {EVENT_COLUMNS} FROM events
                     WHERE partition_id = ?1 AND status = 'PENDING' AND scheduled_time <= ?2
                     ORDER BY scheduled_time
                     LIMIT ?3"
                );
                let mut stmt = tx.prepare_cached(&sql)?;
                let rows = stmt.query_map(
                    rusqlite::params![partition, now_str, limit as i64],
                    row_to_event,
                )?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };

            if !claimed.is_empty() {
                let mut stmt = tx.prepare_cached(
                    "UPDATE events SET status = 'IN_PROGRESS', locked_at = ?1 WHERE id = ?2",
                )?;
                for event in claimed.iter_mut() {
                    stmt.execute(rusqlite::params![now_str, event.id])?;
                    event.status = EventStatus::InProgress;
                    event.locked_at = Some(now);
                }
            }
            tx.commit()?;

            debug!(partition, count = claimed.len(), "claimed events");
            Ok(claimed)
        })
        .await
    }

    #[instrument(skip(self, events, outbox), fields(batch = events.len(), records = outbox.len()))]
    async fn complete_batch(&self, events: &[Event], outbox: &[OutboxRecord]) -> Result<()> {
        let events = events.to_vec();
        let outbox = outbox.to_vec();
        self.with_conn(move |conn| {
            // Dropping `tx` on any early return rolls the whole batch back.
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            {
                let mut insert = tx.prepare_cached(
                    "INSERT INTO outbox
                     (id, aggregate_id, aggregate_type, partition_id, payload, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?;
                for record in &outbox {
                    insert.execute(rusqlite::params![
                        record.id,
                        record.aggregate_id,
                        record.aggregate_type,
                        record.partition_id,
                        record.payload,
                        format_timestamp(record.created_at),
                    ])?;
                }

                let mut update = tx.prepare_cached(
                    "UPDATE events
                     SET status = ?1, exception_stack_trace = ?2, locked_at = NULL
                     WHERE id = ?3 AND status = 'IN_PROGRESS' AND locked_at = ?4",
                )?;
                for event in &events {
                    let claim = event.locked_at.map(format_timestamp);
                    let n = update.execute(rusqlite::params![
                        event.status.as_str(),
                        event.exception_stack_trace,
                        event.id,
                        claim,
                    ])?;
                    if n != 1 {
                        return Err(StoreError::ClaimLost {
                            id: event.id.clone(),
                        });
                    }
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    #[instrument(skip(self))]
    async fn reset_stale_claims(
        &self,
        partitions: &[PartitionId],
        cutoff: DateTime<Utc>,
    ) -> Result<u64> {
        let partitions = partitions.to_vec();
        self.with_conn(move |conn| {
            let cutoff_str = format_timestamp(cutoff);
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut total = 0u64;
            {
                let mut stmt = tx.prepare_cached(
                    "UPDATE events SET status = 'PENDING', locked_at = NULL
                     WHERE status = 'IN_PROGRESS' AND locked_at < ?1 AND partition_id = ?2",
                )?;
                for partition in &partitions {
                    total += stmt.execute(rusqlite::params![cutoff_str, partition])? as u64;
                }
            }
            tx.commit()?;
            Ok(total)
        })
        .await
    }

    async fn fetch_outbox(
        &self,
        partition: PartitionId,
        limit: usize,
    ) -> Result<Vec<OutboxRecord>> {
        self.with_conn(move |conn| {
            // rowid breaks created_at ties in insertion order.
            let sql = format!(
                "SELECT {OUTBOX_COLUMNS} FROM outbox
                 WHERE partition_id = ?1
                 ORDER BY created_at, rowid
                 LIMIT ?2"
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map(rusqlite::params![partition, limit as i64], row_to_outbox)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn delete_outbox(&self, ids: &[String]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let ids = ids.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut total = 0u64;
            {
                let mut stmt = tx.prepare_cached("DELETE FROM outbox WHERE id = ?1")?;
                for id in &ids {
                    total += stmt.execute([id])? as u64;
                }
            }
            tx.commit()?;
            Ok(total)
        })
        .await
    }

    async fn count_by_status(&self, status: EventStatus) -> Result<u64> {
        self.with_conn(move |conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM events WHERE status = ?1",
                [status.as_str()],
                |row| row.get(0),
            )?;
            Ok(n as u64)
        })
        .await
    }

    async fn outbox_len(&self) -> Result<u64> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM outbox", [], |row| row.get(0))?;
            Ok(n as u64)
        })
        .await
    }
}

/// Map a SQLite row to an `Event`.
fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    let status_str: String = row.get(5)?;
    let status = status_str
        .parse::<EventStatus>()
        .map_err(|e| conversion_error(5, e.to_string()))?;
    let locked_at = match row.get::<_, Option<String>>(6)? {
        Some(raw) => Some(parse_ts(6, &raw)?),
        None => None,
    };

    Ok(Event {
        id: row.get(0)?,
        name: row.get(1)?,
        partition_id: row.get(2)?,
        scheduled_time: parse_ts(3, &row.get::<_, String>(3)?)?,
        payload: row.get(4)?,
        status,
        locked_at,
        exception_stack_trace: row.get(7)?,
        created_at: parse_ts(8, &row.get::<_, String>(8)?)?,
        namespace: row.get(9)?,
    })
}

/// Map a SQLite row to an `OutboxRecord`.
fn row_to_outbox(row: &rusqlite::Row<'_>) -> rusqlite::Result<OutboxRecord> {
    Ok(OutboxRecord {
        id: row.get(0)?,
        aggregate_id: row.get(1)?,
        aggregate_type: row.get(2)?,
        partition_id: row.get(3)?,
        payload: row.get(4)?,
        created_at: parse_ts(5, &row.get::<_, String>(5)?)?,
    })
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    parse_timestamp(raw).ok_or_else(|| conversion_error(idx, format!("bad timestamp: {raw}")))
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, msg.into())
}
