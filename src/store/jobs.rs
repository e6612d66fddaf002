//! LLM job rows and the atomic claim primitive.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::domain::{Job, JobCounts, JobStatus, JobType};

use super::{
    json_col, millis_col, opt_json_col, opt_millis_col, parsed_col, to_millis, StoreError,
};

const JOB_COLUMNS: &str = "id, job_type, input, status, output, cost_usd, error, claimed_by, \
     created_at, locked_at, started_at, finished_at";

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    Ok(Job {
        id: parsed_col(row, 0)?,
        job_type: JobType::from(row.get::<_, String>(1)?.as_str()),
        input: json_col(row, 2)?,
        status: parsed_col(row, 3)?,
        output: opt_json_col(row, 4)?,
        cost_usd: row.get(5)?,
        error: row.get(6)?,
        claimed_by: row.get(7)?,
        created_at: millis_col(row, 8)?,
        locked_at: opt_millis_col(row, 9)?,
        started_at: opt_millis_col(row, 10)?,
        finished_at: opt_millis_col(row, 11)?,
    })
}

/// Insert a `pending` job and return its id
pub fn insert(
    conn: &Connection,
    job_type: &JobType,
    input: &serde_json::Value,
    now: DateTime<Utc>,
) -> Result<Uuid, StoreError> {
    let id = Uuid::new_v4();
    conn.execute(
        "INSERT INTO llm_jobs(id, job_type, input, status, created_at)
         VALUES (?1, ?2, ?3, 'pending', ?4)",
        params![
            id.to_string(),
            job_type.as_str(),
            serde_json::to_string(input)?,
            to_millis(now),
        ],
    )?;
    Ok(id)
}

/// Claim up to `limit` pending jobs for `worker`.
///
/// A single conditional UPDATE selects and locks the rows, so two callers
/// (even on separate connections) can never both receive the same job. The
/// outer status guard makes a row that lost the race a no-op rather than a
/// double claim.
pub fn claim(
    conn: &Connection,
    limit: usize,
    worker: &str,
    now: DateTime<Utc>,
) -> Result<Vec<Job>, StoreError> {
    if limit == 0 {
        return Ok(Vec::new());
    }

    let sql = format!(
        "UPDATE llm_jobs
         SET status = 'locked', claimed_by = ?2, locked_at = ?3
         WHERE status = 'pending' AND id IN (
             SELECT id FROM llm_jobs
             WHERE status = 'pending'
             ORDER BY created_at ASC, rowid ASC
             LIMIT ?1
         )
         RETURNING {JOB_COLUMNS}"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![limit as i64, worker, to_millis(now)], job_from_row)?;
    let mut jobs = rows.collect::<rusqlite::Result<Vec<_>>>()?;

    // RETURNING order is unspecified
    jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    Ok(jobs)
}

/// `locked → running`. Returns false if the job was not locked.
pub fn mark_running(conn: &Connection, id: Uuid, now: DateTime<Utc>) -> Result<bool, StoreError> {
    let changed = conn.execute(
        "UPDATE llm_jobs SET status = 'running', started_at = ?2
         WHERE id = ?1 AND status = 'locked'",
        params![id.to_string(), to_millis(now)],
    )?;
    Ok(changed > 0)
}

/// Move a claimed job to `done`. Terminal rows are never touched.
pub fn complete(
    conn: &Connection,
    id: Uuid,
    output: &serde_json::Value,
    cost_usd: f64,
    now: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let changed = conn.execute(
        "UPDATE llm_jobs SET status = 'done', output = ?2, cost_usd = ?3, finished_at = ?4
         WHERE id = ?1 AND status IN ('locked', 'running')",
        params![
            id.to_string(),
            serde_json::to_string(output)?,
            cost_usd,
            to_millis(now)
        ],
    )?;
    Ok(changed > 0)
}

/// Move a claimed job to `failed` with the error captured
pub fn fail(
    conn: &Connection,
    id: Uuid,
    error: &str,
    cost_usd: f64,
    now: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let changed = conn.execute(
        "UPDATE llm_jobs SET status = 'failed', error = ?2, cost_usd = ?3, finished_at = ?4
         WHERE id = ?1 AND status IN ('locked', 'running')",
        params![id.to_string(), error, cost_usd, to_millis(now)],
    )?;
    Ok(changed > 0)
}

pub fn get(conn: &Connection, id: Uuid) -> Result<Option<Job>, StoreError> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM llm_jobs WHERE id = ?1");
    Ok(conn.query_row(&sql, [id.to_string()], job_from_row).optional()?)
}

/// Jobs in a given status, oldest first
pub fn list_by_status(
    conn: &Connection,
    status: JobStatus,
    limit: usize,
) -> Result<Vec<Job>, StoreError> {
    let sql = format!(
        "SELECT {JOB_COLUMNS} FROM llm_jobs WHERE status = ?1
         ORDER BY created_at ASC, rowid ASC LIMIT ?2"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![status.as_str(), limit as i64], job_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn counts(conn: &Connection) -> Result<JobCounts, StoreError> {
    let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM llm_jobs GROUP BY status")?;
    let rows = stmt.query_map([], |row| {
        Ok((parsed_col::<JobStatus>(row, 0)?, row.get::<_, i64>(1)?))
    })?;

    let mut counts = JobCounts::default();
    for row in rows {
        let (status, count) = row?;
        counts.add(status, count as usize);
    }
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    #[tokio::test]
    async fn test_claim_respects_limit_and_order() {
        let store = Store::open_in_memory().unwrap();
        let ids = store
            .call(|conn| {
                let base = Utc::now();
                (0..3)
                    .map(|i| {
                        insert(
                            conn,
                            &JobType::Plan,
                            &serde_json::json!({ "n": i }),
                            base + chrono::Duration::milliseconds(i),
                        )
                    })
                    .collect::<Result<Vec<_>, _>>()
            })
            .await
            .unwrap();

        let claimed = store
            .call(|conn| claim(conn, 2, "worker-a", Utc::now()))
            .await
            .unwrap();
        assert_eq!(claimed.len(), 2);
        assert_eq!(claimed[0].id, ids[0]);
        assert_eq!(claimed[1].id, ids[1]);
        assert!(claimed.iter().all(|j| j.status == JobStatus::Locked));
        assert!(claimed.iter().all(|j| j.claimed_by.as_deref() == Some("worker-a")));

        let counts = store.call(counts).await.unwrap();
        assert_eq!(counts.locked, 2);
        assert_eq!(counts.pending, 1);
    }

    #[tokio::test]
    async fn test_terminal_jobs_are_immutable() {
        let store = Store::open_in_memory().unwrap();
        let id = store
            .call(|conn| insert(conn, &JobType::Score, &serde_json::json!({}), Utc::now()))
            .await
            .unwrap();

        let (completed, failed_after) = store
            .call(move |conn| {
                claim(conn, 1, "w", Utc::now())?;
                let completed = complete(conn, id, &serde_json::json!({"ok": true}), 0.01, Utc::now())?;
                let failed_after = fail(conn, id, "late failure", 0.0, Utc::now())?;
                Ok::<_, StoreError>((completed, failed_after))
            })
            .await
            .unwrap();
        assert!(completed);
        assert!(!failed_after);

        let job = store.call(move |conn| get(conn, id)).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert!(job.error.is_none());
    }

    #[tokio::test]
    async fn test_pending_jobs_cannot_complete() {
        let store = Store::open_in_memory().unwrap();
        let id = store
            .call(|conn| insert(conn, &JobType::Plan, &serde_json::json!({}), Utc::now()))
            .await
            .unwrap();

        let changed = store
            .call(move |conn| complete(conn, id, &serde_json::Value::Null, 0.0, Utc::now()))
            .await
            .unwrap();
        assert!(!changed);
    }
}
