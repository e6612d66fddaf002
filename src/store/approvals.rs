//! Cloud budget approval requests.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::domain::{ApprovalRequest, ApprovalStatus};

use super::{millis_col, opt_millis_col, parsed_col, to_millis, StoreError};

const APPROVAL_COLUMNS: &str =
    "id, reason, spent_usd, budget_usd, status, requested_at, resolved_at";

fn approval_from_row(row: &Row<'_>) -> rusqlite::Result<ApprovalRequest> {
    Ok(ApprovalRequest {
        id: parsed_col(row, 0)?,
        reason: row.get(1)?,
        spent_usd: row.get(2)?,
        budget_usd: row.get(3)?,
        status: parsed_col(row, 4)?,
        requested_at: millis_col(row, 5)?,
        resolved_at: opt_millis_col(row, 6)?,
    })
}

pub fn create(
    conn: &Connection,
    reason: &str,
    spent_usd: f64,
    budget_usd: f64,
    now: DateTime<Utc>,
) -> Result<ApprovalRequest, StoreError> {
    let id = Uuid::new_v4();
    conn.execute(
        "INSERT INTO approvals(id, reason, spent_usd, budget_usd, status, requested_at)
         VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
        params![id.to_string(), reason, spent_usd, budget_usd, to_millis(now)],
    )?;
    Ok(ApprovalRequest {
        id,
        reason: reason.to_string(),
        spent_usd,
        budget_usd,
        status: ApprovalStatus::Pending,
        requested_at: now,
        resolved_at: None,
    })
}

pub fn get(conn: &Connection, id: Uuid) -> Result<Option<ApprovalRequest>, StoreError> {
    let sql = format!("SELECT {APPROVAL_COLUMNS} FROM approvals WHERE id = ?1");
    Ok(conn
        .query_row(&sql, [id.to_string()], approval_from_row)
        .optional()?)
}

/// Oldest pending request, if any
pub fn oldest_pending(conn: &Connection) -> Result<Option<ApprovalRequest>, StoreError> {
    let sql = format!(
        "SELECT {APPROVAL_COLUMNS} FROM approvals WHERE status = 'pending'
         ORDER BY requested_at ASC, rowid ASC LIMIT 1"
    );
    Ok(conn.query_row(&sql, [], approval_from_row).optional()?)
}

pub fn pending(conn: &Connection) -> Result<Vec<ApprovalRequest>, StoreError> {
    let sql = format!(
        "SELECT {APPROVAL_COLUMNS} FROM approvals WHERE status = 'pending'
         ORDER BY requested_at ASC, rowid ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], approval_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Resolve a pending request. Returns false if it was already resolved.
pub fn resolve(
    conn: &Connection,
    id: Uuid,
    status: ApprovalStatus,
    now: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let changed = conn.execute(
        "UPDATE approvals SET status = ?2, resolved_at = ?3
         WHERE id = ?1 AND status = 'pending'",
        params![id.to_string(), status.as_str(), to_millis(now)],
    )?;
    Ok(changed > 0)
}
