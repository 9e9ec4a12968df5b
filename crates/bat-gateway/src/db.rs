use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, Row};
use std::path::Path;
use std::sync::Mutex;

use bat_types::trace::{AgentEvent, TraceRunMeta};

/// Trace storage: `trace_events` is the append-only per-run log and the
/// system of record; `trace_runs` is the derived summary index.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        let db = Self { conn: Mutex::new(conn) };
        db.init_tables()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn: Mutex::new(conn) };
        db.init_tables()?;
        Ok(db)
    }

    pub(crate) fn init_tables(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS trace_events (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id      TEXT NOT NULL,
                seq         INTEGER NOT NULL,
                ts          INTEGER NOT NULL,
                stream      TEXT NOT NULL,
                event_json  TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_trace_events_run ON trace_events(run_id, id);

            CREATE TABLE IF NOT EXISTS trace_runs (
                run_id          TEXT PRIMARY KEY,
                client_run_id   TEXT,
                session_key     TEXT,
                status          TEXT NOT NULL,
                tool_calls      INTEGER NOT NULL DEFAULT 0,
                tool_errors     INTEGER NOT NULL DEFAULT 0,
                started_at      INTEGER,
                ended_at        INTEGER,
                first_event_at  INTEGER NOT NULL,
                last_event_at   INTEGER NOT NULL,
                error           TEXT,
                updated_at      TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_trace_runs_recent
                ON trace_runs(COALESCE(started_at, first_event_at) DESC);",
        )?;
        Ok(())
    }

    // --- Event log ---

    pub fn append_trace_event(&self, run_id: &str, event: &AgentEvent) -> Result<()> {
        let json = serde_json::to_string(event).context("Failed to serialize agent event")?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO trace_events (run_id, seq, ts, stream, event_json)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                run_id,
                event.seq as i64,
                event.ts,
                event.stream().to_string(),
                json
            ],
        )?;
        Ok(())
    }

    /// Events of one run in insertion order, starting after `after_seq`.
    /// Returns at most `limit` events and whether more were available.
    pub fn get_trace_events(
        &self,
        run_id: &str,
        after_seq: Option<u64>,
        limit: usize,
    ) -> Result<(Vec<AgentEvent>, bool)> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT event_json FROM trace_events
             WHERE run_id = ?1 AND seq > ?2
             ORDER BY id ASC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![run_id, after_seq.unwrap_or(0) as i64, limit as i64 + 1],
            |row| row.get::<_, String>(0),
        )?;

        let mut events = Vec::new();
        for row in rows {
            let json = row?;
            let event: AgentEvent = serde_json::from_str(&json)
                .with_context(|| format!("Corrupt trace event for run {run_id}"))?;
            events.push(event);
        }

        let truncated = events.len() > limit;
        events.truncate(limit);
        Ok((events, truncated))
    }

    /// Highest sequence number logged for a run, 0 if it has none.
    pub fn max_trace_seq(&self, run_id: &str) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let max: i64 = conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) FROM trace_events WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )?;
        Ok(max as u64)
    }

    /// The complete log of one run, in insertion order.
    pub fn load_trace_log(&self, run_id: &str) -> Result<Vec<AgentEvent>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT event_json FROM trace_events WHERE run_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![run_id], |row| row.get::<_, String>(0))?;
        let mut events = Vec::new();
        for row in rows {
            let event = serde_json::from_str(&row?)
                .with_context(|| format!("Corrupt trace event for run {run_id}"))?;
            events.push(event);
        }
        Ok(events)
    }

    /// Every run id that has at least one logged event.
    pub fn list_trace_event_run_ids(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT run_id FROM trace_events GROUP BY run_id ORDER BY MIN(id)",
        )?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    // --- Run index ---

    /// Insert or replace summaries in a single transaction.
    pub fn upsert_trace_runs(&self, runs: &[TraceRunMeta]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();
        {
            let mut stmt = tx.prepare(
                "INSERT INTO trace_runs (run_id, client_run_id, session_key, status,
                    tool_calls, tool_errors, started_at, ended_at,
                    first_event_at, last_event_at, error, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT(run_id) DO UPDATE SET
                    client_run_id = excluded.client_run_id,
                    session_key = excluded.session_key,
                    status = excluded.status,
                    tool_calls = excluded.tool_calls,
                    tool_errors = excluded.tool_errors,
                    started_at = excluded.started_at,
                    ended_at = excluded.ended_at,
                    first_event_at = excluded.first_event_at,
                    last_event_at = excluded.last_event_at,
                    error = excluded.error,
                    updated_at = excluded.updated_at",
            )?;
            for run in runs {
                stmt.execute(params![
                    run.run_id,
                    run.client_run_id,
                    run.session_key,
                    run.status.to_string(),
                    run.tool_calls as i64,
                    run.tool_errors as i64,
                    run.started_at,
                    run.ended_at,
                    run.first_event_at,
                    run.last_event_at,
                    run.error,
                    now,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Persisted summaries, most recent first.
    pub fn list_trace_runs(&self, limit: usize) -> Result<Vec<TraceRunMeta>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT run_id, client_run_id, session_key, status, tool_calls, tool_errors,
                    started_at, ended_at, first_event_at, last_event_at, error
             FROM trace_runs
             ORDER BY COALESCE(started_at, first_event_at) DESC, run_id ASC
             LIMIT ?1",
        )?;
        let mut rows = stmt.query(params![limit as i64])?;
        let mut runs = Vec::new();
        while let Some(row) = rows.next()? {
            runs.push(row_to_trace_run(row)?);
        }
        Ok(runs)
    }

    pub fn get_trace_run(&self, run_id: &str) -> Result<Option<TraceRunMeta>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT run_id, client_run_id, session_key, status, tool_calls, tool_errors,
                    started_at, ended_at, first_event_at, last_event_at, error
             FROM trace_runs WHERE run_id = ?1",
        )?;
        let mut rows = stmt.query(params![run_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_trace_run(row)?)),
            None => Ok(None),
        }
    }

    pub fn count_trace_runs(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let count = conn.query_row("SELECT COUNT(*) FROM trace_runs", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Run raw SQL against the connection, for breaking storage in tests.
    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<()> {
        self.conn.lock().unwrap().execute_batch(sql)?;
        Ok(())
    }
}

fn row_to_trace_run(row: &Row<'_>) -> Result<TraceRunMeta> {
    let status: String = row.get(3)?;
    Ok(TraceRunMeta {
        run_id: row.get(0)?,
        client_run_id: row.get(1)?,
        session_key: row.get(2)?,
        status: status.parse()?,
        tool_calls: row.get::<_, i64>(4)? as u64,
        tool_errors: row.get::<_, i64>(5)? as u64,
        started_at: row.get(6)?,
        ended_at: row.get(7)?,
        first_event_at: row.get(8)?,
        last_event_at: row.get(9)?,
        error: row.get(10)?,
    })
}
