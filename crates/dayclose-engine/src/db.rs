use rusqlite::Connection;

use crate::error::Result;

/// Initialise the engine schema in `conn`.
///
/// Safe to call on every startup — uses `IF NOT EXISTS` throughout. All
/// timestamps are stored as UTC RFC-3339 with millisecond precision so
/// lexical order matches chronological order.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS invocations (
            id                TEXT    NOT NULL PRIMARY KEY,
            service           TEXT    NOT NULL,
            key               TEXT    NOT NULL,
            handler           TEXT    NOT NULL,
            input             TEXT    NOT NULL,   -- JSON
            status            TEXT    NOT NULL DEFAULT 'pending',
            attempt           INTEGER NOT NULL DEFAULT 0,
            output            TEXT,               -- JSON, set on completion
            failure           TEXT,
            wake_at           TEXT,               -- continuation wake time
            created_at        TEXT    NOT NULL,
            updated_at        TEXT    NOT NULL,
            last_progress_at  TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_invocations_target
            ON invocations (service, key, created_at);
        CREATE INDEX IF NOT EXISTS idx_invocations_status
            ON invocations (status, updated_at);

        -- Write-once step records: (invocation_id, name) -> value
        CREATE TABLE IF NOT EXISTS journal (
            invocation_id  TEXT    NOT NULL,
            name           TEXT    NOT NULL,
            seq            INTEGER NOT NULL,
            kind           TEXT    NOT NULL,
            value          TEXT    NOT NULL,   -- JSON
            created_at     TEXT    NOT NULL,
            PRIMARY KEY (invocation_id, name)
        ) STRICT;

        CREATE TABLE IF NOT EXISTS state (
            service     TEXT NOT NULL,
            key         TEXT NOT NULL,
            name        TEXT NOT NULL,
            value       TEXT NOT NULL,   -- JSON
            updated_at  TEXT NOT NULL,
            PRIMARY KEY (service, key, name)
        ) STRICT;

        CREATE TABLE IF NOT EXISTS timers (
            id             TEXT NOT NULL PRIMARY KEY,
            fire_at        TEXT NOT NULL,
            kind           TEXT NOT NULL,   -- invoke | resume
            invocation_id  TEXT,
            service        TEXT NOT NULL,
            key            TEXT NOT NULL,
            handler        TEXT NOT NULL,
            input          TEXT NOT NULL,   -- JSON
            created_at     TEXT NOT NULL
        ) STRICT;

        -- Efficient polling: SELECT … WHERE fire_at <= ? ORDER BY fire_at
        CREATE INDEX IF NOT EXISTS idx_timers_fire_at ON timers (fire_at);
        ",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_db_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        init_db(&conn).unwrap();
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master
                 WHERE type = 'table' AND name IN ('invocations', 'journal', 'state', 'timers')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 4);
    }
}
