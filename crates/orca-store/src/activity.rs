// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params_from_iter, Connection};
use tracing::warn;

use crate::event::{ActivityEvent, EventPayload, EventType};

const DEFAULT_READ_LIMIT: usize = 1_000;

/// Filter for [`ActivityLog::get_events`].  All fields are optional; the
/// result is always descending by insertion id.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub session_id: Option<String>,
    pub event_type: Option<EventType>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

/// Append-only activity event store.
///
/// Single logical writer, multiple readers.  Write failures are swallowed
/// and reported to the debug channel; activity logging is observability,
/// not a hard dependency of the agent loop.
pub struct ActivityLog {
    conn: Mutex<Connection>,
    closed: AtomicBool,
}

impl ActivityLog {
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open activity log: {}", db_path.display()))?;
        let log = Self { conn: Mutex::new(conn), closed: AtomicBool::new(false) };
        log.init_schema()?;
        Ok(log)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let log = Self { conn: Mutex::new(conn), closed: AtomicBool::new(false) };
        log.init_schema()?;
        Ok(log)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS activity_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_type TEXT NOT NULL,
                session_id TEXT NOT NULL,
                model_session_id TEXT,
                timestamp TEXT NOT NULL,
                data TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_activity_session ON activity_events(session_id);
            CREATE INDEX IF NOT EXISTS idx_activity_type ON activity_events(event_type);
            "#,
        )?;
        Ok(())
    }

    /// Append one event.  Never propagates store failures; after [`close`]
    /// this is a no-op.
    ///
    /// [`close`]: ActivityLog::close
    pub fn log_event(
        &self,
        session_id: &str,
        model_session_id: Option<&str>,
        payload: &EventPayload,
    ) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if let Err(e) = self.try_log(session_id, model_session_id, payload) {
            warn!(event_type = %payload.kind(), error = %e, "activity log write failed; dropping event");
        }
    }

    fn try_log(
        &self,
        session_id: &str,
        model_session_id: Option<&str>,
        payload: &EventPayload,
    ) -> Result<()> {
        let data = serde_json::to_string(&payload.to_json())?;
        let ts = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO activity_events (event_type, session_id, model_session_id, timestamp, data)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![payload.kind().as_str(), session_id, model_session_id, ts, data],
        )?;
        Ok(())
    }

    /// Read events, newest first, honoring the filter.  `limit` defaults to
    /// 1,000.
    pub fn get_events(&self, filter: &EventFilter) -> Result<Vec<ActivityEvent>> {
        let mut sql = String::from(
            "SELECT id, event_type, session_id, model_session_id, timestamp, data
             FROM activity_events WHERE 1=1",
        );
        let mut args: Vec<String> = Vec::new();
        if let Some(session_id) = &filter.session_id {
            sql.push_str(&format!(" AND session_id = ?{}", args.len() + 1));
            args.push(session_id.clone());
        }
        if let Some(event_type) = filter.event_type {
            sql.push_str(&format!(" AND event_type = ?{}", args.len() + 1));
            args.push(event_type.as_str().to_string());
        }
        if let Some(since) = filter.since {
            sql.push_str(&format!(" AND timestamp >= ?{}", args.len() + 1));
            args.push(since.to_rfc3339_opts(SecondsFormat::Micros, true));
        }
        sql.push_str(" ORDER BY id DESC LIMIT ");
        sql.push_str(&filter.limit.unwrap_or(DEFAULT_READ_LIMIT).to_string());

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), row_to_event)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// The `n` most recent events across all sessions, newest first.
    pub fn get_recent_events(&self, n: usize) -> Result<Vec<ActivityEvent>> {
        self.get_events(&EventFilter { limit: Some(n), ..Default::default() })
    }

    /// Idempotent close: subsequent writes become no-ops and do not error.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<ActivityEvent> {
    let ts: String = row.get(4)?;
    let data: String = row.get(5)?;
    Ok(ActivityEvent {
        id: row.get(0)?,
        event_type: row.get(1)?,
        session_id: row.get(2)?,
        model_session_id: row.get(3)?,
        timestamp: ts.parse().unwrap_or_else(|_| Utc::now()),
        data: serde_json::from_str(&data).unwrap_or(serde_json::Value::Null),
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
