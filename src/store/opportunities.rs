//! Opportunity rows and their append-only status log.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::domain::{
    NewOpportunity, Opportunity, OpportunityEvent, OpportunityStatus, Rating, Scores,
};

use super::{json_col, millis_col, opt_parsed_col, parsed_col, to_millis, StoreError};

const CURRENT_COLUMNS: &str = "id, title, source, evidence, pain, willingness_to_pay, competition, \
     viability, weighted_viability, plan, rating, created_at, updated_at, status, status_since";

fn opportunity_from_row(row: &Row<'_>) -> rusqlite::Result<Opportunity> {
    Ok(Opportunity {
        id: parsed_col(row, 0)?,
        title: row.get(1)?,
        source: row.get(2)?,
        evidence: row.get(3)?,
        scores: Scores {
            pain: row.get(4)?,
            willingness_to_pay: row.get(5)?,
            competition: row.get(6)?,
            viability: row.get(7)?,
            weighted_viability: row.get(8)?,
        },
        plan: row.get(9)?,
        rating: opt_parsed_col::<Rating>(row, 10)?,
        created_at: millis_col(row, 11)?,
        updated_at: millis_col(row, 12)?,
        status: parsed_col(row, 13)?,
        status_since: millis_col(row, 14)?,
    })
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<OpportunityEvent> {
    Ok(OpportunityEvent {
        id: row.get(0)?,
        opportunity_id: parsed_col(row, 1)?,
        status: parsed_col(row, 2)?,
        payload: json_col(row, 3)?,
        timestamp: millis_col(row, 4)?,
    })
}

/// Insert a new opportunity together with its initial `new` event
pub fn insert(
    conn: &Connection,
    new: &NewOpportunity,
    now: DateTime<Utc>,
) -> Result<Opportunity, StoreError> {
    let id = Uuid::new_v4();
    conn.execute(
        "INSERT INTO opportunities(id, title, source, evidence, pain, willingness_to_pay, competition,
                                   viability, weighted_viability, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
        params![
            id.to_string(),
            new.title,
            new.source,
            new.evidence,
            new.scores.pain,
            new.scores.willingness_to_pay,
            new.scores.competition,
            new.scores.viability,
            new.scores.weighted_viability,
            to_millis(now),
        ],
    )?;
    append_event(
        conn,
        id,
        OpportunityStatus::New,
        &serde_json::json!({ "source": new.source }),
        now,
    )?;

    get(conn, id)?.ok_or_else(|| StoreError::not_found("opportunity", id))
}

pub fn get(conn: &Connection, id: Uuid) -> Result<Option<Opportunity>, StoreError> {
    let sql = format!("SELECT {CURRENT_COLUMNS} FROM opportunity_current WHERE id = ?1");
    Ok(conn
        .query_row(&sql, [id.to_string()], opportunity_from_row)
        .optional()?)
}

/// Latest status and when it was entered
pub fn latest_status(
    conn: &Connection,
    id: Uuid,
) -> Result<Option<(OpportunityStatus, DateTime<Utc>)>, StoreError> {
    Ok(conn
        .query_row(
            "SELECT status, created_at FROM opportunity_events
             WHERE opportunity_id = ?1 ORDER BY id DESC LIMIT 1",
            [id.to_string()],
            |row| Ok((parsed_col(row, 0)?, millis_col(row, 1)?)),
        )
        .optional()?)
}

/// Append a status event. Callers validate the edge first; see
/// [`crate::core::OpportunityMachine`].
pub fn append_event(
    conn: &Connection,
    id: Uuid,
    status: OpportunityStatus,
    payload: &serde_json::Value,
    at: DateTime<Utc>,
) -> Result<OpportunityEvent, StoreError> {
    let payload_text = serde_json::to_string(payload)?;
    conn.execute(
        "INSERT INTO opportunity_events(opportunity_id, status, payload, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![id.to_string(), status.as_str(), payload_text, to_millis(at)],
    )?;

    Ok(OpportunityEvent {
        id: conn.last_insert_rowid(),
        opportunity_id: id,
        status,
        payload: payload.clone(),
        timestamp: at,
    })
}

/// Full event history in append order
pub fn history(conn: &Connection, id: Uuid) -> Result<Vec<OpportunityEvent>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, opportunity_id, status, payload, created_at FROM opportunity_events
         WHERE opportunity_id = ?1 ORDER BY id ASC",
    )?;
    let rows = stmt.query_map([id.to_string()], event_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// All opportunities currently in `status`, highest viability first
pub fn list_by_status(
    conn: &Connection,
    status: OpportunityStatus,
) -> Result<Vec<Opportunity>, StoreError> {
    let sql = format!(
        "SELECT {CURRENT_COLUMNS} FROM opportunity_current
         WHERE status = ?1 ORDER BY viability DESC, created_at ASC, id ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([status.as_str()], opportunity_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Selection candidates: `new` and at or above the viability floor.
///
/// Ordering (viability desc, then insertion) is the tie-break order for
/// equal weighted scores.
pub fn candidates(conn: &Connection, floor: f64) -> Result<Vec<Opportunity>, StoreError> {
    let sql = format!(
        "SELECT {CURRENT_COLUMNS} FROM opportunity_current
         WHERE status = 'new' AND viability >= ?1
         ORDER BY viability DESC, created_at ASC, id ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([floor], opportunity_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// `building` opportunities that entered the status before `cutoff` and have
/// no converted validation
pub fn stale_building(
    conn: &Connection,
    cutoff: DateTime<Utc>,
) -> Result<Vec<Opportunity>, StoreError> {
    let sql = format!(
        "SELECT {CURRENT_COLUMNS} FROM opportunity_current c
         WHERE c.status = 'building' AND c.status_since < ?1
           AND NOT EXISTS (
               SELECT 1 FROM validations v
               WHERE v.opportunity_id = c.id AND v.status = 'converted'
           )
         ORDER BY c.status_since ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([to_millis(cutoff)], opportunity_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// `building` opportunities holding a validation slot (no conversion yet)
pub fn count_building_unconverted(conn: &Connection) -> Result<usize, StoreError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM opportunity_current c
         WHERE c.status = 'building'
           AND NOT EXISTS (
               SELECT 1 FROM validations v
               WHERE v.opportunity_id = c.id AND v.status = 'converted'
           )",
        [],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

/// `pursue` opportunities eligible for a validation launch, best first
pub fn launch_candidates(conn: &Connection, limit: usize) -> Result<Vec<Opportunity>, StoreError> {
    let sql = format!(
        "SELECT {CURRENT_COLUMNS} FROM opportunity_current c
         WHERE c.status = 'pursue'
           AND NOT EXISTS (
               SELECT 1 FROM validations v
               WHERE v.opportunity_id = c.id AND v.status = 'converted'
           )
         ORDER BY c.viability DESC, c.created_at ASC, c.id ASC
         LIMIT ?1"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([limit as i64], opportunity_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Number of opportunities per current status
pub fn counts_by_status(
    conn: &Connection,
) -> Result<HashMap<OpportunityStatus, usize>, StoreError> {
    let mut stmt =
        conn.prepare("SELECT status, COUNT(*) FROM opportunity_current GROUP BY status")?;
    let rows = stmt.query_map([], |row| {
        Ok((parsed_col::<OpportunityStatus>(row, 0)?, row.get::<_, i64>(1)?))
    })?;

    let mut counts = HashMap::new();
    for row in rows {
        let (status, count) = row?;
        counts.insert(status, count as usize);
    }
    Ok(counts)
}

/// Number of transitions into `status` recorded since `since`
pub fn transitions_since(
    conn: &Connection,
    status: OpportunityStatus,
    since: DateTime<Utc>,
) -> Result<usize, StoreError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM opportunity_events WHERE status = ?1 AND created_at >= ?2",
        params![status.as_str(), to_millis(since)],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

/// Good/bad rating tallies per source tag
pub fn ratings_by_source(conn: &Connection) -> Result<Vec<(String, usize, usize)>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT source,
                SUM(CASE WHEN rating = 'good' THEN 1 ELSE 0 END),
                SUM(CASE WHEN rating = 'bad' THEN 1 ELSE 0 END)
         FROM opportunities
         WHERE rating IS NOT NULL
         GROUP BY source
         ORDER BY source",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, i64>(1)? as usize,
            row.get::<_, i64>(2)? as usize,
        ))
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn set_weighted_viability(
    conn: &Connection,
    id: Uuid,
    weighted: f64,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE opportunities SET weighted_viability = ?2, updated_at = ?3 WHERE id = ?1",
        params![id.to_string(), weighted, to_millis(now)],
    )?;
    Ok(())
}

pub fn set_plan(
    conn: &Connection,
    id: Uuid,
    plan: &str,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let changed = conn.execute(
        "UPDATE opportunities SET plan = ?2, updated_at = ?3 WHERE id = ?1",
        params![id.to_string(), plan, to_millis(now)],
    )?;
    if changed == 0 {
        return Err(StoreError::not_found("opportunity", id));
    }
    Ok(())
}

pub fn set_scores(
    conn: &Connection,
    id: Uuid,
    scores: &Scores,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let changed = conn.execute(
        "UPDATE opportunities
         SET pain = ?2, willingness_to_pay = ?3, competition = ?4, viability = ?5, updated_at = ?6
         WHERE id = ?1",
        params![
            id.to_string(),
            scores.pain,
            scores.willingness_to_pay,
            scores.competition,
            scores.viability,
            to_millis(now),
        ],
    )?;
    if changed == 0 {
        return Err(StoreError::not_found("opportunity", id));
    }
    Ok(())
}

pub fn set_rating(
    conn: &Connection,
    id: Uuid,
    rating: Rating,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let changed = conn.execute(
        "UPDATE opportunities SET rating = ?2, updated_at = ?3 WHERE id = ?1",
        params![id.to_string(), rating.as_str(), to_millis(now)],
    )?;
    if changed == 0 {
        return Err(StoreError::not_found("opportunity", id));
    }
    Ok(())
}
