use rusqlite::Connection;

use crate::error::Result;

/// Initialise the `events` and `outbox` schema in `conn`.
///
/// Safe to call on every startup; it uses `IF NOT EXISTS` throughout.
/// Timestamps are fixed-width RFC 3339 UTC text, so the range predicates and
/// `ORDER BY` clauses below compare them as plain strings.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS events (
            id                    TEXT    NOT NULL PRIMARY KEY,
            name                  TEXT    NOT NULL,
            partition_id          INTEGER NOT NULL,
            scheduled_time        TEXT    NOT NULL,
            payload               TEXT    NOT NULL,
            status                TEXT    NOT NULL DEFAULT 'PENDING',
            locked_at             TEXT,               -- set while IN_PROGRESS
            exception_stack_trace TEXT,               -- set on FAILED
            created_at            TEXT    NOT NULL,
            namespace             TEXT
        ) STRICT;

        -- Claim query: WHERE partition_id = ? AND status = 'PENDING'
        --              AND scheduled_time <= ? ORDER BY scheduled_time
        CREATE INDEX IF NOT EXISTS idx_events_claim
            ON events (partition_id, status, scheduled_time);

        -- Reaper: WHERE status = 'IN_PROGRESS' AND locked_at < ?
        CREATE INDEX IF NOT EXISTS idx_events_locked
            ON events (status, locked_at);

        CREATE TABLE IF NOT EXISTS outbox (
            id             TEXT    NOT NULL PRIMARY KEY,
            aggregate_id   TEXT    NOT NULL,
            aggregate_type TEXT    NOT NULL,
            partition_id   INTEGER NOT NULL,
            payload        TEXT    NOT NULL,
            created_at     TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_outbox_partition
            ON outbox (partition_id, created_at);
        ",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        init_db(&conn).unwrap();
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('events', 'outbox')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 2);
    }
}
