//! Append-only spend ledger. Every budget figure is an aggregation over it.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

use crate::domain::SpendRecord;

use super::{millis_col, parsed_col, to_millis, StoreError};

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<SpendRecord> {
    Ok(SpendRecord {
        task: parsed_col(row, 0)?,
        model: row.get(1)?,
        input_tokens: row.get::<_, i64>(2)? as u64,
        output_tokens: row.get::<_, i64>(3)? as u64,
        cost_usd: row.get(4)?,
        recorded_at: millis_col(row, 5)?,
    })
}

pub fn record(conn: &Connection, entry: &SpendRecord) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO spend_ledger(task, model, input_tokens, output_tokens, cost_usd, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            entry.task.as_str(),
            entry.model,
            entry.input_tokens as i64,
            entry.output_tokens as i64,
            entry.cost_usd,
            to_millis(entry.recorded_at),
        ],
    )?;
    Ok(())
}

/// Total spend recorded at or after `since`
pub fn spend_since(conn: &Connection, since: DateTime<Utc>) -> Result<f64, StoreError> {
    let total: f64 = conn.query_row(
        "SELECT COALESCE(SUM(cost_usd), 0.0) FROM spend_ledger WHERE recorded_at >= ?1",
        [to_millis(since)],
        |row| row.get(0),
    )?;
    Ok(total)
}

pub fn spend_total(conn: &Connection) -> Result<f64, StoreError> {
    let total: f64 = conn.query_row(
        "SELECT COALESCE(SUM(cost_usd), 0.0) FROM spend_ledger",
        [],
        |row| row.get(0),
    )?;
    Ok(total)
}

/// Most recent entries, newest first
pub fn recent(conn: &Connection, limit: usize) -> Result<Vec<SpendRecord>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT task, model, input_tokens, output_tokens, cost_usd, recorded_at
         FROM spend_ledger ORDER BY id DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map([limit as i64], record_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}
