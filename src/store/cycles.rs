//! Scheduler cycle records.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::domain::{Cycle, CycleStatus};

use super::{millis_col, opt_millis_col, parsed_col, to_millis, StoreError};

fn cycle_from_row(row: &Row<'_>) -> rusqlite::Result<Cycle> {
    Ok(Cycle {
        id: parsed_col(row, 0)?,
        started_at: millis_col(row, 1)?,
        ended_at: opt_millis_col(row, 2)?,
        status: parsed_col(row, 3)?,
        note: row.get(4)?,
    })
}

/// Open a `running` cycle
pub fn open(conn: &Connection, now: DateTime<Utc>) -> Result<Cycle, StoreError> {
    let id = Uuid::new_v4();
    conn.execute(
        "INSERT INTO cycles(id, started_at, status) VALUES (?1, ?2, 'running')",
        params![id.to_string(), to_millis(now)],
    )?;
    Ok(Cycle {
        id,
        started_at: now,
        ended_at: None,
        status: CycleStatus::Running,
        note: None,
    })
}

/// Close a running cycle. A closed cycle is never mutated again.
pub fn close(
    conn: &Connection,
    id: Uuid,
    status: CycleStatus,
    note: Option<&str>,
    now: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let changed = conn.execute(
        "UPDATE cycles SET status = ?2, note = ?3, ended_at = ?4
         WHERE id = ?1 AND status = 'running'",
        params![id.to_string(), status.as_str(), note, to_millis(now)],
    )?;
    Ok(changed > 0)
}

pub fn get(conn: &Connection, id: Uuid) -> Result<Option<Cycle>, StoreError> {
    Ok(conn
        .query_row(
            "SELECT id, started_at, ended_at, status, note FROM cycles WHERE id = ?1",
            [id.to_string()],
            cycle_from_row,
        )
        .optional()?)
}

/// Most recent cycles, newest first
pub fn recent(conn: &Connection, limit: usize) -> Result<Vec<Cycle>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, started_at, ended_at, status, note FROM cycles
         ORDER BY started_at DESC, rowid DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map([limit as i64], cycle_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}
