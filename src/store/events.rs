//! Diagnostic system event log.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::domain::{SystemEvent, SystemEventKind};

use super::{json_col, millis_col, parsed_col, to_millis, StoreError};

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<SystemEvent> {
    Ok(SystemEvent {
        id: row.get(0)?,
        kind: parsed_col(row, 1)?,
        subject: row.get(2)?,
        payload: json_col(row, 3)?,
        timestamp: millis_col(row, 4)?,
    })
}

pub fn record(
    conn: &Connection,
    kind: SystemEventKind,
    subject: Option<&str>,
    payload: &serde_json::Value,
    now: DateTime<Utc>,
) -> Result<i64, StoreError> {
    conn.execute(
        "INSERT INTO system_events(kind, subject, payload, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![
            kind.as_str(),
            subject,
            serde_json::to_string(payload)?,
            to_millis(now)
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Most recent event of a kind
pub fn latest(
    conn: &Connection,
    kind: SystemEventKind,
) -> Result<Option<SystemEvent>, StoreError> {
    Ok(conn
        .query_row(
            "SELECT id, kind, subject, payload, created_at FROM system_events
             WHERE kind = ?1 ORDER BY id DESC LIMIT 1",
            [kind.as_str()],
            event_from_row,
        )
        .optional()?)
}

/// Recent events, newest first, optionally filtered by kind
pub fn recent(
    conn: &Connection,
    kind: Option<SystemEventKind>,
    limit: usize,
) -> Result<Vec<SystemEvent>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, kind, subject, payload, created_at FROM system_events
         WHERE ?1 IS NULL OR kind = ?1
         ORDER BY id DESC LIMIT ?2",
    )?;
    let rows = stmt.query_map(
        params![kind.map(|k| k.as_str()), limit as i64],
        event_from_row,
    )?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn count_since(
    conn: &Connection,
    kind: SystemEventKind,
    since: DateTime<Utc>,
) -> Result<usize, StoreError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM system_events WHERE kind = ?1 AND created_at >= ?2",
        params![kind.as_str(), to_millis(since)],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}
