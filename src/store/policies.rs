//! Policy key/value table.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::{json_col, to_millis, StoreError};

pub fn get(conn: &Connection, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
    Ok(conn
        .query_row("SELECT value FROM policies WHERE key = ?1", [key], |row| {
            json_col(row, 0)
        })
        .optional()?)
}

pub fn set(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO policies(key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![key, serde_json::to_string(value)?, to_millis(now)],
    )?;
    Ok(())
}

pub fn all(conn: &Connection) -> Result<Vec<(String, serde_json::Value)>, StoreError> {
    let mut stmt = conn.prepare("SELECT key, value FROM policies ORDER BY key")?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, json_col(row, 1)?)))?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}
