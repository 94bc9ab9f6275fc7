//! Append-only event store backed by SQLite.
//!
//! One writer per run; concurrent readers are fine (WAL). Sequence numbers
//! are allocated from `MAX(seq)+1` inside the same transaction as the
//! insert, and the `UNIQUE(run_id, seq)` index turns a racing second writer
//! into a `SEQUENCE_CONFLICT` instead of a gap or a duplicate.
//!
//! Payloads are stored as canonical JSON so that digests computed over
//! store contents are stable.

use crate::core::canonical;
use crate::core::error::{ErrorCode, PortunusError};
use crate::core::event::{Event, EventType, Run, RunMode, RunStatus};
use crate::core::time;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value as JsonValue;
use std::time::Duration;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS runs (
  run_id TEXT PRIMARY KEY,
  goal TEXT NOT NULL,
  mode TEXT NOT NULL,
  status TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS events (
  event_id TEXT PRIMARY KEY,
  run_id TEXT NOT NULL,
  seq INTEGER NOT NULL,
  type TEXT NOT NULL,
  ts TEXT NOT NULL,
  payload_json TEXT NOT NULL,
  FOREIGN KEY(run_id) REFERENCES runs(run_id)
);

CREATE UNIQUE INDEX IF NOT EXISTS ux_events_run_seq ON events(run_id, seq);
CREATE INDEX IF NOT EXISTS ix_events_run ON events(run_id);
";

/// Filter for [`EventStore::list_runs`].
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub status: Option<RunStatus>,
    /// Lower bound (inclusive) on `created_at`, compared lexicographically.
    pub since: Option<String>,
    pub limit: Option<usize>,
    pub offset: usize,
}

/// Store-wide run counts, independent of the filter's limit/offset.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RunCounts {
    pub total: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

pub struct EventStore {
    conn: Connection,
}

impl EventStore {
    /// Open a store at `db_path`, configuring WAL mode, foreign keys, and a
    /// busy timeout, and ensuring the schema. `":memory:"` is ephemeral.
    pub fn open(db_path: &str) -> Result<Self, PortunusError> {
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))?;
        conn.execute("PRAGMA foreign_keys=ON;", [])?;
        conn.execute_batch(SCHEMA)?;
        Ok(EventStore { conn })
    }

    pub(crate) fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Explicitly close the store. Dropping the store has the same effect;
    /// this surfaces any flush error instead of discarding it.
    pub fn close(self) -> Result<(), PortunusError> {
        self.conn.close().map_err(|(_, e)| PortunusError::Sqlite(e))
    }

    /// Insert the run row. Fails with `RUN_EXISTS` if the id is taken.
    pub fn create_run(
        &self,
        run_id: &str,
        goal: &str,
        mode: RunMode,
        ts: &str,
    ) -> Result<Run, PortunusError> {
        let run = Run {
            run_id: run_id.to_string(),
            goal: goal.to_string(),
            mode,
            status: RunStatus::Running,
            created_at: ts.to_string(),
        };
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO runs(run_id, goal, mode, status, created_at)
             VALUES(?1, ?2, ?3, ?4, ?5)",
            params![
                run.run_id,
                run.goal,
                run.mode.as_str(),
                run.status.as_str(),
                run.created_at
            ],
        )?;
        if inserted == 0 {
            return Err(PortunusError::operational_with(
                ErrorCode::RunExists,
                format!("Run '{run_id}' already exists"),
                serde_json::json!({ "run_id": run_id }),
            ));
        }
        Ok(run)
    }

    /// Append an event, allocating the next seq for the run atomically.
    pub fn append(
        &mut self,
        run_id: &str,
        r#type: EventType,
        payload: JsonValue,
    ) -> Result<Event, PortunusError> {
        let tx = self.conn.transaction()?;
        let seq: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq) + 1, 0) FROM events WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )?;
        let event = Event {
            event_id: time::new_event_id(),
            run_id: run_id.to_string(),
            seq,
            r#type,
            ts: time::now_epoch_z(),
            payload,
        };
        insert_event_row(&tx, &event)?;
        tx.commit()?;
        Ok(event)
    }

    /// Update the status column; idempotent for equal values.
    pub fn set_status(&self, run_id: &str, status: RunStatus) -> Result<(), PortunusError> {
        self.conn.execute(
            "UPDATE runs SET status = ?2 WHERE run_id = ?1",
            params![run_id, status.as_str()],
        )?;
        Ok(())
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<Run>, PortunusError> {
        let row = self
            .conn
            .query_row(
                "SELECT run_id, goal, mode, status, created_at FROM runs WHERE run_id = ?1",
                params![run_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some((run_id, goal, mode, status, created_at)) => Ok(Some(Run {
                run_id,
                goal,
                mode: RunMode::parse(&mode)?,
                status: RunStatus::parse(&status)?,
                created_at,
            })),
        }
    }

    /// All events of a run in ascending seq order.
    pub fn events(&self, run_id: &str) -> Result<Vec<Event>, PortunusError> {
        let mut stmt = self.conn.prepare(
            "SELECT event_id, run_id, seq, type, ts, payload_json
             FROM events WHERE run_id = ?1 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (event_id, run_id, seq, ty, ts, payload_json) = row?;
            let payload: JsonValue = serde_json::from_str(&payload_json).map_err(|e| {
                PortunusError::bug(
                    ErrorCode::BugError,
                    format!("Corrupt payload for event {event_id}: {e}"),
                )
            })?;
            events.push(Event {
                event_id,
                run_id,
                seq,
                r#type: EventType::parse(&ty)?,
                ts,
                payload,
            });
        }
        Ok(events)
    }

    pub fn event_count(&self, run_id: &str) -> Result<usize, PortunusError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM events WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as usize)
    }

    /// Runs matching the filter (newest first) plus store-wide counts.
    pub fn list_runs(&self, filter: &RunFilter) -> Result<(Vec<Run>, RunCounts), PortunusError> {
        let mut sql = String::from(
            "SELECT run_id, goal, mode, status, created_at FROM runs WHERE 1 = 1",
        );
        let mut args: Vec<String> = Vec::new();
        if let Some(status) = filter.status {
            args.push(status.as_str().to_string());
            sql.push_str(&format!(" AND status = ?{}", args.len()));
        }
        if let Some(since) = &filter.since {
            args.push(since.clone());
            sql.push_str(&format!(" AND created_at >= ?{}", args.len()));
        }
        sql.push_str(" ORDER BY created_at DESC, run_id DESC");
        let limit = filter.limit.unwrap_or(50);
        sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, filter.offset));

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut runs = Vec::new();
        for row in rows {
            let (run_id, goal, mode, status, created_at) = row?;
            runs.push(Run {
                run_id,
                goal,
                mode: RunMode::parse(&mode)?,
                status: RunStatus::parse(&status)?,
                created_at,
            });
        }

        let mut counts = RunCounts {
            total: 0,
            running: 0,
            completed: 0,
            failed: 0,
        };
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM runs GROUP BY status")?;
        let count_rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in count_rows {
            let (status, n) = row?;
            let n = n.max(0) as usize;
            counts.total += n;
            match RunStatus::parse(&status)? {
                RunStatus::Running => counts.running += n,
                RunStatus::Completed => counts.completed += n,
                RunStatus::Failed => counts.failed += n,
            }
        }

        Ok((runs, counts))
    }
}

/// Insert a fully-formed event row. Shared by `append` and bundle import,
/// which must preserve original seq/ts values.
pub(crate) fn insert_event_row(
    conn: &Connection,
    event: &Event,
) -> Result<(), PortunusError> {
    let payload_value = serde_json::to_value(&event.payload)
        .map_err(|e| PortunusError::Config(format!("Unable to serialize payload: {e}")))?;
    let payload_json = canonical::canonical_string(&payload_value);
    let result = conn.execute(
        "INSERT INTO events(event_id, run_id, seq, type, ts, payload_json)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            event.event_id,
            event.run_id,
            event.seq,
            event.r#type.as_str(),
            event.ts,
            payload_json
        ],
    );
    match result {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            // A second writer advanced the run: the single-writer contract
            // was broken somewhere upstream.
            Err(PortunusError::bug_with(
                ErrorCode::SequenceConflict,
                format!(
                    "Sequence {} already written for run '{}'",
                    event.seq, event.run_id
                ),
                serde_json::json!({ "run_id": event.run_id, "seq": event.seq }),
            ))
        }
        Err(e) => Err(e.into()),
    }
}
