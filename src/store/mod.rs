//! SQLite-backed persistent store.
//!
//! The store is the only shared mutable resource. Two primitives carry all
//! cross-loop correctness:
//! - an atomic "claim N pending jobs" update ([`jobs::claim`])
//! - append-with-validation of opportunity events inside an immediate
//!   transaction ([`opportunities::append_event`])
//!
//! All SQLite work runs on the blocking pool via [`Store::call`] and
//! [`Store::transaction`], so async loops never stall on disk I/O.

pub mod approvals;
pub mod cycles;
pub mod events;
pub mod jobs;
pub mod ledger;
pub mod opportunities;
pub mod policies;
pub mod validations;

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, Row, TransactionBehavior};
use thiserror::Error;
use tracing::debug;

const SCHEMA: &str = include_str!("schema.sql");

/// How long a connection waits on another writer before giving up
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors raised by the persistence layer
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Store connection lock poisoned")]
    Poisoned,

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
}

impl StoreError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

/// Handle to the agent database. Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl Store {
    /// Open (or create) a database file and apply the schema
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(conn, Some(path.to_path_buf()))
    }

    /// Open a private in-memory database (tests, dry runs)
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;

        debug!(path = ?path, "Store opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    /// Database file path (None for in-memory stores)
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run a closure against the connection on the blocking pool
    pub async fn call<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Connection) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&guard)
        })
        .await
        .map_err(StoreError::from)?
    }

    /// Run a closure inside an IMMEDIATE transaction.
    ///
    /// The write lock is taken up front, so a read-decide-write sequence in
    /// `f` cannot interleave with another writer. Commits on `Ok`, rolls back
    /// on `Err`.
    pub async fn transaction<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Connection) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
            let tx = guard
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(StoreError::from)?;
            let value = f(&tx)?;
            tx.commit().map_err(StoreError::from)?;
            Ok(value)
        })
        .await
        .map_err(StoreError::from)?
    }

    /// Cheap reachability probe
    pub async fn ping(&self) -> Result<(), StoreError> {
        self.call(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await
    }
}

// ============================================================================
// Column helpers shared by the table modules
// ============================================================================

pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn conversion_error<E>(idx: usize, ty: Type, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, ty, Box::new(err))
}

#[derive(Debug, Error)]
#[error("timestamp out of range: {0}")]
struct TimestampOutOfRange(i64);

pub(crate) fn millis_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: i64 = row.get(idx)?;
    Utc.timestamp_millis_opt(raw)
        .single()
        .ok_or_else(|| conversion_error(idx, Type::Integer, TimestampOutOfRange(raw)))
}

pub(crate) fn opt_millis_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<i64> = row.get(idx)?;
    raw.map(|ms| {
        Utc.timestamp_millis_opt(ms)
            .single()
            .ok_or_else(|| conversion_error(idx, Type::Integer, TimestampOutOfRange(ms)))
    })
    .transpose()
}

/// Parse a TEXT column through `FromStr` (uuids, status enums)
pub(crate) fn parsed_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>()
        .map_err(|e| conversion_error(idx, Type::Text, e))
}

pub(crate) fn opt_parsed_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| s.parse::<T>().map_err(|e| conversion_error(idx, Type::Text, e)))
        .transpose()
}

pub(crate) fn json_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<serde_json::Value> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, Type::Text, e))
}

pub(crate) fn opt_json_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<serde_json::Value>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| serde_json::from_str(&s).map_err(|e| conversion_error(idx, Type::Text, e)))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_open_in_memory_and_ping() {
        let store = Store::open_in_memory().unwrap();
        store.ping().await.unwrap();
        assert!(store.path().is_none());
    }

    #[tokio::test]
    async fn test_open_file_creates_parent_dirs() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("agent.db");

        let store = Store::open(&path).unwrap();
        store.ping().await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_transaction_rolls_back_on_error() {
        let store = Store::open_in_memory().unwrap();

        let result: Result<(), StoreError> = store
            .transaction(|conn| {
                conn.execute(
                    "INSERT INTO policies(key, value, updated_at) VALUES ('k', '1', 0)",
                    [],
                )?;
                Err(StoreError::not_found("policy", "forced"))
            })
            .await;
        assert!(result.is_err());

        let count: i64 = store
            .call(|conn| {
                Ok::<_, StoreError>(conn.query_row("SELECT COUNT(*) FROM policies", [], |r| r.get(0))?)
            })
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
