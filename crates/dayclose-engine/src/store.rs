use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info, instrument};

use crate::db::init_db;
use crate::error::{EngineError, Result};
use crate::types::{
    Invocation, InvocationStatus, JournalEntry, JournalKind, Target, Timer, TimerKind,
};

/// Format an instant the way every engine table stores it.
pub fn ts(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(column: &'static str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| EngineError::Corrupt {
            column,
            value: value.to_string(),
        })
}

fn parse_json(column: &'static str, value: &str) -> Result<serde_json::Value> {
    serde_json::from_str(value).map_err(|_| EngineError::Corrupt {
        column,
        value: value.to_string(),
    })
}

/// Side effect committed in the same transaction as a journal entry.
pub enum Effect<'a> {
    None,
    SetState {
        service: &'a str,
        key: &'a str,
        name: &'a str,
        value: &'a serde_json::Value,
    },
    Schedule(&'a Timer),
}

/// A journal entry about to be appended.
pub struct NewEntry<'a> {
    pub name: &'a str,
    pub seq: u32,
    pub kind: JournalKind,
    pub value: &'a serde_json::Value,
}

/// Rows removed by a retention pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PurgeStats {
    pub invocations: usize,
    pub journal_entries: usize,
}

/// SQLite persistence for invocations, journal, state and timers.
///
/// Cheap to clone: every clone shares the same connection behind a `Mutex`.
/// The lock is only ever held for the duration of one statement or
/// transaction, never across an `.await`.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

const INVOCATION_COLUMNS: &str = "id, service, key, handler, input, status, attempt, output,
     failure, wake_at, created_at, updated_at, last_progress_at";

const TIMER_COLUMNS: &str = "id, fire_at, kind, invocation_id, service, key, handler, input";

struct InvocationRow {
    id: String,
    service: String,
    key: String,
    handler: String,
    input: String,
    status: String,
    attempt: i64,
    output: Option<String>,
    failure: Option<String>,
    wake_at: Option<String>,
    created_at: String,
    updated_at: String,
    last_progress_at: String,
}

fn read_invocation_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<InvocationRow> {
    Ok(InvocationRow {
        id: row.get(0)?,
        service: row.get(1)?,
        key: row.get(2)?,
        handler: row.get(3)?,
        input: row.get(4)?,
        status: row.get(5)?,
        attempt: row.get(6)?,
        output: row.get(7)?,
        failure: row.get(8)?,
        wake_at: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
        last_progress_at: row.get(12)?,
    })
}

impl InvocationRow {
    fn decode(self) -> Result<Invocation> {
        let status = self.status.parse().map_err(|_| EngineError::Corrupt {
            column: "invocations.status",
            value: self.status.clone(),
        })?;
        Ok(Invocation {
            id: self.id,
            target: Target::new(self.service, self.key, self.handler),
            input: parse_json("invocations.input", &self.input)?,
            status,
            attempt: u32::try_from(self.attempt).unwrap_or(0),
            output: self
                .output
                .as_deref()
                .map(|v| parse_json("invocations.output", v))
                .transpose()?,
            failure: self.failure,
            wake_at: self
                .wake_at
                .as_deref()
                .map(|v| parse_ts("invocations.wake_at", v))
                .transpose()?,
            created_at: parse_ts("invocations.created_at", &self.created_at)?,
            updated_at: parse_ts("invocations.updated_at", &self.updated_at)?,
            last_progress_at: parse_ts("invocations.last_progress_at", &self.last_progress_at)?,
        })
    }
}

type TimerRow = (
    String,
    String,
    String,
    Option<String>,
    String,
    String,
    String,
    String,
);

fn read_timer_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TimerRow> {
    Ok((
        row.get(0)?, // id
        row.get(1)?, // fire_at
        row.get(2)?, // kind
        row.get(3)?, // invocation_id
        row.get(4)?, // service
        row.get(5)?, // key
        row.get(6)?, // handler
        row.get(7)?, // input JSON
    ))
}

fn decode_timer(row: TimerRow) -> Result<Timer> {
    let (id, fire_at, kind, invocation_id, service, key, handler, input) = row;
    let kind: TimerKind = kind.parse().map_err(|_| EngineError::Corrupt {
        column: "timers.kind",
        value: kind.clone(),
    })?;
    Ok(Timer {
        id,
        fire_at: parse_ts("timers.fire_at", &fire_at)?,
        kind,
        invocation_id,
        target: Target::new(service, key, handler),
        input: parse_json("timers.input", &input)?,
    })
}

fn insert_timer_on(conn: &Connection, timer: &Timer, now: DateTime<Utc>) -> Result<bool> {
    let n = conn.execute(
        "INSERT OR IGNORE INTO timers
         (id, fire_at, kind, invocation_id, service, key, handler, input, created_at)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
        rusqlite::params![
            timer.id,
            ts(timer.fire_at),
            timer.kind.as_str(),
            timer.invocation_id,
            timer.target.service,
            timer.target.key,
            timer.target.handler,
            timer.input.to_string(),
            ts(now),
        ],
    )?;
    Ok(n > 0)
}

impl Store {
    /// Wrap an open connection, initialising the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open (or create) a database file in WAL mode.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        info!(path, "engine store opened");
        Self::new(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| EngineError::LockPoisoned("engine store connection"))
    }

    // --- timers ------------------------------------------------------------

    /// Insert a timer unless one with the same id already exists.
    pub fn insert_timer(&self, timer: &Timer, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn()?;
        insert_timer_on(&conn, timer, now)
    }

    /// Timers whose `fire_at` has arrived, oldest first.
    pub fn due_timers(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Timer>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {TIMER_COLUMNS} FROM timers
             WHERE fire_at <= ?1 ORDER BY fire_at, id LIMIT ?2"
        ))?;
        let rows: Vec<TimerRow> = stmt
            .query_map(
                rusqlite::params![ts(now), i64::try_from(limit).unwrap_or(i64::MAX)],
                read_timer_row,
            )?
            .collect::<rusqlite::Result<_>>()?;
        rows.into_iter().map(decode_timer).collect()
    }

    /// All armed timers ordered by fire time.
    pub fn timers(&self) -> Result<Vec<Timer>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TIMER_COLUMNS} FROM timers ORDER BY fire_at, id"
        ))?;
        let rows: Vec<TimerRow> = stmt
            .query_map([], read_timer_row)?
            .collect::<rusqlite::Result<_>>()?;
        rows.into_iter().map(decode_timer).collect()
    }

    pub fn delete_timer(&self, id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM timers WHERE id = ?1", [id])?;
        Ok(())
    }

    pub fn next_timer_at(&self) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn()?;
        let next: Option<String> =
            conn.query_row("SELECT MIN(fire_at) FROM timers", [], |row| row.get(0))?;
        next.as_deref()
            .map(|v| parse_ts("timers.fire_at", v))
            .transpose()
    }

    // --- invocations -------------------------------------------------------

    /// Create invocation `id` from a fired `invoke` timer and consume the timer.
    ///
    /// Returns `false` when an invocation with that id already exists; the
    /// timer is consumed either way, which makes duplicate deliveries no-ops.
    #[instrument(skip(self, timer), fields(timer_id = %timer.id))]
    pub fn accept_invocation(&self, id: &str, timer: &Timer, now: DateTime<Utc>) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now_str = ts(now);
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO invocations
             (id, service, key, handler, input, status, attempt, output, failure,
              wake_at, created_at, updated_at, last_progress_at)
             VALUES (?1,?2,?3,?4,?5,'pending',0,NULL,NULL,NULL,?6,?6,?6)",
            rusqlite::params![
                id,
                timer.target.service,
                timer.target.key,
                timer.target.handler,
                timer.input.to_string(),
                now_str,
            ],
        )?;
        tx.execute("DELETE FROM timers WHERE id = ?1", [&timer.id])?;
        tx.commit()?;
        debug!(invocation_id = id, created = inserted > 0, "invoke timer consumed");
        Ok(inserted > 0)
    }

    /// Whether the message behind `message_id` can still run: its timer has
    /// not fired yet, or the invocation it created is not finished.
    ///
    /// Only meaningful for object targets, whose invocations take the id of
    /// the timer that delivered them.
    pub fn message_pending(&self, message_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let pending = conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM timers WHERE id = ?1 AND kind = 'invoke')
                 OR EXISTS (SELECT 1 FROM invocations
                            WHERE id = ?1 AND status NOT IN ('completed', 'failed'))",
            [message_id],
            |row| row.get::<_, bool>(0),
        )?;
        Ok(pending)
    }

    pub fn invocation(&self, id: &str) -> Result<Option<Invocation>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {INVOCATION_COLUMNS} FROM invocations WHERE id = ?1"),
                [id],
                read_invocation_row,
            )
            .optional()?;
        row.map(InvocationRow::decode).transpose()
    }

    /// Most recent invocation addressed to `service/key`.
    pub fn latest_invocation(&self, service: &str, key: &str) -> Result<Option<Invocation>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {INVOCATION_COLUMNS} FROM invocations
                     WHERE service = ?1 AND key = ?2
                     ORDER BY created_at DESC, id DESC LIMIT 1"
                ),
                [service, key],
                read_invocation_row,
            )
            .optional()?;
        row.map(InvocationRow::decode).transpose()
    }

    pub fn non_terminal_invocations(&self) -> Result<Vec<Invocation>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {INVOCATION_COLUMNS} FROM invocations
             WHERE status NOT IN ('completed', 'failed') ORDER BY created_at"
        ))?;
        let rows: Vec<InvocationRow> = stmt
            .query_map([], read_invocation_row)?
            .collect::<rusqlite::Result<_>>()?;
        rows.into_iter().map(InvocationRow::decode).collect()
    }

    pub fn mark_running(&self, id: &str, now: DateTime<Utc>) -> Result<()> {
        self.update_status(id, InvocationStatus::Running, now)
    }

    fn update_status(&self, id: &str, status: InvocationStatus, now: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE invocations SET status = ?1, wake_at = NULL, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![status.as_str(), ts(now), id],
        )?;
        if n == 0 {
            return Err(EngineError::InvocationNotFound { id: id.to_string() });
        }
        Ok(())
    }

    pub fn complete(&self, id: &str, output: &serde_json::Value, now: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE invocations SET status = 'completed', output = ?1, wake_at = NULL,
                    failure = NULL, updated_at = ?2
             WHERE id = ?3",
            rusqlite::params![output.to_string(), ts(now), id],
        )?;
        Ok(())
    }

    pub fn fail(&self, id: &str, reason: &str, now: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE invocations SET status = 'failed', failure = ?1, wake_at = NULL, updated_at = ?2
             WHERE id = ?3",
            rusqlite::params![reason, ts(now), id],
        )?;
        Ok(())
    }

    /// Record a continuation (`suspended` or `backing-off`) and arm its resume
    /// timer in one transaction.
    pub fn park(
        &self,
        id: &str,
        status: InvocationStatus,
        attempt: u32,
        failure: Option<&str>,
        timer: &Timer,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE invocations SET status = ?1, attempt = ?2, failure = ?3, wake_at = ?4,
                    updated_at = ?5
             WHERE id = ?6",
            rusqlite::params![
                status.as_str(),
                attempt,
                failure,
                ts(timer.fire_at),
                ts(now),
                id
            ],
        )?;
        insert_timer_on(&tx, timer, now)?;
        tx.commit()?;
        Ok(())
    }

    // --- journal -----------------------------------------------------------

    pub fn journal_entry(&self, invocation_id: &str, name: &str) -> Result<Option<JournalEntry>> {
        let conn = self.conn()?;
        let row: Option<(u32, String, String, String)> = conn
            .query_row(
                "SELECT seq, kind, value, created_at FROM journal
                 WHERE invocation_id = ?1 AND name = ?2",
                [invocation_id, name],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;
        row.map(|(seq, kind, value, created_at)| decode_entry(name.to_string(), seq, kind, value, created_at))
            .transpose()
    }

    /// Full journal of an invocation in program order.
    pub fn journal(&self, invocation_id: &str) -> Result<Vec<JournalEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT name, seq, kind, value, created_at FROM journal
             WHERE invocation_id = ?1 ORDER BY seq",
        )?;
        let rows: Vec<(String, u32, String, String, String)> = stmt
            .query_map([invocation_id], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
            })?
            .collect::<rusqlite::Result<_>>()?;
        rows.into_iter()
            .map(|(name, seq, kind, value, created_at)| decode_entry(name, seq, kind, value, created_at))
            .collect()
    }

    /// Append a write-once journal entry together with its effect and bump the
    /// invocation's progress timestamp, all in one transaction.
    pub fn append(
        &self,
        invocation_id: &str,
        entry: &NewEntry<'_>,
        effect: Effect<'_>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now_str = ts(now);
        tx.execute(
            "INSERT INTO journal (invocation_id, name, seq, kind, value, created_at)
             VALUES (?1,?2,?3,?4,?5,?6)",
            rusqlite::params![
                invocation_id,
                entry.name,
                entry.seq,
                entry.kind.as_str(),
                entry.value.to_string(),
                now_str
            ],
        )?;
        match effect {
            Effect::None => {}
            Effect::SetState {
                service,
                key,
                name,
                value,
            } => {
                tx.execute(
                    "INSERT INTO state (service, key, name, value, updated_at)
                     VALUES (?1,?2,?3,?4,?5)
                     ON CONFLICT (service, key, name)
                     DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                    rusqlite::params![service, key, name, value.to_string(), now_str],
                )?;
            }
            Effect::Schedule(timer) => {
                insert_timer_on(&tx, timer, now)?;
            }
        }
        tx.execute(
            "UPDATE invocations SET last_progress_at = ?1, updated_at = ?1 WHERE id = ?2",
            rusqlite::params![now_str, invocation_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    // --- state -------------------------------------------------------------

    pub fn get_state(&self, service: &str, key: &str, name: &str) -> Result<Option<serde_json::Value>> {
        let conn = self.conn()?;
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM state WHERE service = ?1 AND key = ?2 AND name = ?3",
                [service, key, name],
                |row| row.get(0),
            )
            .optional()?;
        value.as_deref().map(|v| parse_json("state.value", v)).transpose()
    }

    /// Write a state slot outside of any journal. Only used for engine-driven
    /// transitions after an invocation has been given up on.
    pub fn put_state(
        &self,
        service: &str,
        key: &str,
        name: &str,
        value: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO state (service, key, name, value, updated_at)
             VALUES (?1,?2,?3,?4,?5)
             ON CONFLICT (service, key, name)
             DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            rusqlite::params![service, key, name, value.to_string(), ts(now)],
        )?;
        Ok(())
    }

    // --- retention ---------------------------------------------------------

    /// Delete finished invocations last touched before `workflow_cutoff`
    /// together with their journal, and journal rows older than
    /// `journal_cutoff` that no live invocation needs.
    ///
    /// A purged invocation never leaves journal rows behind: a later message
    /// for the same workflow key reuses its id and must start from an empty
    /// journal.
    #[instrument(skip(self))]
    pub fn purge(
        &self,
        workflow_cutoff: DateTime<Utc>,
        journal_cutoff: DateTime<Utc>,
    ) -> Result<PurgeStats> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let orphaned = tx.execute(
            "DELETE FROM journal
             WHERE invocation_id IN (
                 SELECT id FROM invocations
                 WHERE status IN ('completed', 'failed') AND updated_at < ?1)",
            [ts(workflow_cutoff)],
        )?;
        let invocations = tx.execute(
            "DELETE FROM invocations
             WHERE status IN ('completed', 'failed') AND updated_at < ?1",
            [ts(workflow_cutoff)],
        )?;
        let aged = tx.execute(
            "DELETE FROM journal
             WHERE created_at < ?1
               AND invocation_id NOT IN (
                   SELECT id FROM invocations WHERE status NOT IN ('completed', 'failed'))",
            [ts(journal_cutoff)],
        )?;
        tx.commit()?;
        Ok(PurgeStats {
            invocations,
            journal_entries: orphaned + aged,
        })
    }
}

fn decode_entry(
    name: String,
    seq: u32,
    kind: String,
    value: String,
    created_at: String,
) -> Result<JournalEntry> {
    let kind: JournalKind = kind.parse().map_err(|_| EngineError::Corrupt {
        column: "journal.kind",
        value: kind.clone(),
    })?;
    Ok(JournalEntry {
        name,
        seq,
        kind,
        value: parse_json("journal.value", &value)?,
        created_at: parse_ts("journal.created_at", &created_at)?,
    })
}
