//! Validation records for opportunities in `building`.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::domain::{Validation, ValidationStatus};

use super::{millis_col, opt_millis_col, parsed_col, to_millis, StoreError};

const VALIDATION_COLUMNS: &str = "id, opportunity_id, kind, status, artifact, payments_usd, \
     window_ends_at, created_at, resolved_at";

fn validation_from_row(row: &Row<'_>) -> rusqlite::Result<Validation> {
    Ok(Validation {
        id: parsed_col(row, 0)?,
        opportunity_id: parsed_col(row, 1)?,
        kind: row.get(2)?,
        status: parsed_col(row, 3)?,
        artifact: row.get(4)?,
        payments_usd: row.get(5)?,
        window_ends_at: millis_col(row, 6)?,
        created_at: millis_col(row, 7)?,
        resolved_at: opt_millis_col(row, 8)?,
    })
}

pub fn create(
    conn: &Connection,
    opportunity_id: Uuid,
    kind: &str,
    artifact: &str,
    window_ends_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<Validation, StoreError> {
    let id = Uuid::new_v4();
    conn.execute(
        "INSERT INTO validations(id, opportunity_id, kind, status, artifact, window_ends_at, created_at)
         VALUES (?1, ?2, ?3, 'active', ?4, ?5, ?6)",
        params![
            id.to_string(),
            opportunity_id.to_string(),
            kind,
            artifact,
            to_millis(window_ends_at),
            to_millis(now),
        ],
    )?;
    Ok(Validation {
        id,
        opportunity_id,
        kind: kind.to_string(),
        status: ValidationStatus::Active,
        artifact: artifact.to_string(),
        payments_usd: 0.0,
        window_ends_at,
        created_at: now,
        resolved_at: None,
    })
}

pub fn get(conn: &Connection, id: Uuid) -> Result<Option<Validation>, StoreError> {
    let sql = format!("SELECT {VALIDATION_COLUMNS} FROM validations WHERE id = ?1");
    Ok(conn
        .query_row(&sql, [id.to_string()], validation_from_row)
        .optional()?)
}

pub fn for_opportunity(conn: &Connection, opportunity_id: Uuid) -> Result<Vec<Validation>, StoreError> {
    let sql = format!(
        "SELECT {VALIDATION_COLUMNS} FROM validations WHERE opportunity_id = ?1
         ORDER BY created_at ASC, rowid ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([opportunity_id.to_string()], validation_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Active validations whose window ended at or before `now`
pub fn elapsed_active(conn: &Connection, now: DateTime<Utc>) -> Result<Vec<Validation>, StoreError> {
    let sql = format!(
        "SELECT {VALIDATION_COLUMNS} FROM validations
         WHERE status = 'active' AND window_ends_at <= ?1
         ORDER BY window_ends_at ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([to_millis(now)], validation_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Converted validations whose opportunity is still `building`
pub fn converted_awaiting_build(conn: &Connection) -> Result<Vec<Validation>, StoreError> {
    let sql = format!(
        "SELECT {VALIDATION_COLUMNS} FROM validations v
         WHERE v.status = 'converted'
           AND EXISTS (
               SELECT 1 FROM opportunity_current c
               WHERE c.id = v.opportunity_id AND c.status = 'building'
           )
         ORDER BY v.resolved_at ASC, v.rowid ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], validation_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Resolve an active validation. Returns false if it was not active.
pub fn resolve(
    conn: &Connection,
    id: Uuid,
    status: ValidationStatus,
    now: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let changed = conn.execute(
        "UPDATE validations SET status = ?2, resolved_at = ?3
         WHERE id = ?1 AND status = 'active'",
        params![id.to_string(), status.as_str(), to_millis(now)],
    )?;
    Ok(changed > 0)
}

/// Close every active validation of an opportunity
pub fn expire_for_opportunity(
    conn: &Connection,
    opportunity_id: Uuid,
    now: DateTime<Utc>,
) -> Result<usize, StoreError> {
    Ok(conn.execute(
        "UPDATE validations SET status = 'expired', resolved_at = ?2
         WHERE opportunity_id = ?1 AND status = 'active'",
        params![opportunity_id.to_string(), to_millis(now)],
    )?)
}

/// Add a payment to an active validation. Returns false if it is not active.
pub fn add_payment(conn: &Connection, id: Uuid, amount_usd: f64) -> Result<bool, StoreError> {
    let changed = conn.execute(
        "UPDATE validations SET payments_usd = payments_usd + ?2
         WHERE id = ?1 AND status = 'active'",
        params![id.to_string(), amount_usd],
    )?;
    Ok(changed > 0)
}
