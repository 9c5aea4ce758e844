//! Durable per-table snapshot progress.
//!
//! A small SQLite-backed store keyed by table name. The snapshot engine is
//! the only writer; readers (the `status` subcommand) may observe any prior
//! durable state. Uses a single `Mutex<Connection>` for thread safety.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, info};

/// Idempotent DDL for the progress table.
const CREATE_TABLES: &str = "
CREATE TABLE IF NOT EXISTS migration_progress (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    table_name TEXT NOT NULL UNIQUE,
    total_rows INTEGER NOT NULL DEFAULT 0,
    migrated_rows INTEGER NOT NULL DEFAULT 0,
    last_pk TEXT,
    status TEXT NOT NULL DEFAULT 'PENDING',
    start_time TEXT NOT NULL,
    last_update_time TEXT NOT NULL,
    complete_time TEXT,
    error_message TEXT
);
";

/// Lifecycle of one table's snapshot copy.
///
/// Transitions form a DAG: PENDING → IN_PROGRESS → {COMPLETED, FAILED}.
/// FAILED may only go back to PENDING through an explicit operator
/// [`reset`](ProgressStore::reset).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TableStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TableStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TableStatus::Pending => "PENDING",
            TableStatus::InProgress => "IN_PROGRESS",
            TableStatus::Completed => "COMPLETED",
            TableStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(TableStatus::Pending),
            "IN_PROGRESS" => Ok(TableStatus::InProgress),
            "COMPLETED" => Ok(TableStatus::Completed),
            "FAILED" => Ok(TableStatus::Failed),
            other => Err(anyhow!("unknown progress status: {other}")),
        }
    }
}

/// One table's progress record.
#[derive(Debug, Clone, Serialize)]
pub struct TableProgress {
    pub table_name: String,
    pub total_rows: u64,
    pub migrated_rows: u64,
    pub last_pk: Option<String>,
    pub status: TableStatus,
    pub start_time: DateTime<Utc>,
    pub last_update_time: DateTime<Utc>,
    pub complete_time: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// SQLite-backed progress store.
///
/// Create with [`ProgressStore::open`] for file-backed persistence or
/// [`ProgressStore::in_memory`] for tests.
pub struct ProgressStore {
    conn: Mutex<Connection>,
}

impl ProgressStore {
    /// Open or create the progress database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("cannot open progress database {}", path.display()))?;
        conn.execute_batch(CREATE_TABLES)?;
        info!("progress store ready at {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("progress store lock poisoned"))
    }

    /// Begin (or resume) a table copy.
    ///
    /// Creates a fresh record when none exists; resets a COMPLETED record so
    /// a re-run starts over; otherwise marks the existing record IN_PROGRESS
    /// and leaves its cursor intact so the copy resumes.
    pub fn start(&self, table: &str, total_rows: u64) -> Result<TableProgress> {
        let now = Utc::now();
        match self.get(table)? {
            None => {
                let conn = self.lock_conn()?;
                conn.execute(
                    "INSERT INTO migration_progress \
                     (table_name, total_rows, migrated_rows, status, start_time, last_update_time) \
                     VALUES (?1, ?2, 0, 'PENDING', ?3, ?3)",
                    rusqlite::params![table, total_rows as i64, now.to_rfc3339()],
                )?;
                info!("starting new copy of {table} ({total_rows} rows)");
            }
            Some(existing) if existing.status == TableStatus::Completed => {
                let conn = self.lock_conn()?;
                conn.execute(
                    "UPDATE migration_progress SET total_rows = ?2, migrated_rows = 0, \
                     last_pk = NULL, status = 'PENDING', start_time = ?3, \
                     last_update_time = ?3, complete_time = NULL, error_message = NULL \
                     WHERE table_name = ?1",
                    rusqlite::params![table, total_rows as i64, now.to_rfc3339()],
                )?;
                info!("re-copying completed table {table} ({total_rows} rows)");
            }
            Some(existing) => {
                let conn = self.lock_conn()?;
                conn.execute(
                    "UPDATE migration_progress SET total_rows = ?2, status = 'IN_PROGRESS', \
                     last_update_time = ?3 WHERE table_name = ?1",
                    rusqlite::params![table, total_rows as i64, now.to_rfc3339()],
                )?;
                info!(
                    "resuming copy of {table}: {}/{} rows done, cursor {:?}",
                    existing.migrated_rows, total_rows, existing.last_pk
                );
            }
        }
        self.get(table)?
            .ok_or_else(|| anyhow!("progress record vanished for {table}"))
    }

    /// Record batch progress. Does not touch the status and is safe to call
    /// at any frequency.
    pub fn update(&self, table: &str, migrated_rows: u64, last_pk: Option<&str>) -> Result<()> {
        let conn = self.lock_conn()?;
        let updated = conn.execute(
            "UPDATE migration_progress SET migrated_rows = ?2, \
             last_pk = COALESCE(?3, last_pk), last_update_time = ?4 \
             WHERE table_name = ?1",
            rusqlite::params![
                table,
                migrated_rows as i64,
                last_pk,
                Utc::now().to_rfc3339()
            ],
        )?;
        if updated == 0 {
            return Err(anyhow!("no progress record for {table}"));
        }
        debug!("progress: {table} {migrated_rows} rows, cursor {last_pk:?}");
        Ok(())
    }

    pub fn complete(&self, table: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE migration_progress SET status = 'COMPLETED', \
             last_update_time = ?2, complete_time = ?2 WHERE table_name = ?1",
            rusqlite::params![table, now],
        )?;
        info!("copy of {table} completed");
        Ok(())
    }

    pub fn fail(&self, table: &str, error: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE migration_progress SET status = 'FAILED', \
             last_update_time = ?2, error_message = ?3 WHERE table_name = ?1",
            rusqlite::params![table, Utc::now().to_rfc3339(), error],
        )?;
        Ok(())
    }

    pub fn get(&self, table: &str) -> Result<Option<TableProgress>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            "SELECT table_name, total_rows, migrated_rows, last_pk, status, \
             start_time, last_update_time, complete_time, error_message \
             FROM migration_progress WHERE table_name = ?1",
            [table],
            map_progress_row,
        );
        match result {
            Ok(progress) => Ok(Some(progress?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_all(&self) -> Result<Vec<TableProgress>> {
        self.select_where("1 = 1")
    }

    /// Records whose copy has not completed (PENDING, IN_PROGRESS, FAILED).
    pub fn get_incomplete(&self) -> Result<Vec<TableProgress>> {
        self.select_where("status IN ('PENDING', 'IN_PROGRESS', 'FAILED')")
    }

    pub fn has_incomplete(&self) -> Result<bool> {
        Ok(!self.get_incomplete()?.is_empty())
    }

    /// Operator action: send a table (typically FAILED) back to PENDING with
    /// a cleared cursor.
    pub fn reset(&self, table: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        let updated = conn.execute(
            "UPDATE migration_progress SET migrated_rows = 0, last_pk = NULL, \
             status = 'PENDING', last_update_time = ?2, complete_time = NULL, \
             error_message = NULL WHERE table_name = ?1",
            rusqlite::params![table, Utc::now().to_rfc3339()],
        )?;
        if updated == 0 {
            return Err(anyhow!("no progress record for {table}"));
        }
        info!("progress reset for {table}");
        Ok(())
    }

    pub fn delete(&self, table: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "DELETE FROM migration_progress WHERE table_name = ?1",
            [table],
        )?;
        Ok(())
    }

    pub fn clear_all(&self) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute("DELETE FROM migration_progress", [])?;
        info!("cleared all progress records");
        Ok(())
    }

    fn select_where(&self, predicate: &str) -> Result<Vec<TableProgress>> {
        let conn = self.lock_conn()?;
        let sql = format!(
            "SELECT table_name, total_rows, migrated_rows, last_pk, status, \
             start_time, last_update_time, complete_time, error_message \
             FROM migration_progress WHERE {predicate} ORDER BY table_name"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], map_progress_row)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row??);
        }
        Ok(records)
    }
}

type RowResult = std::result::Result<Result<TableProgress>, rusqlite::Error>;

fn map_progress_row(row: &rusqlite::Row<'_>) -> RowResult {
    let table_name: String = row.get(0)?;
    let total_rows: i64 = row.get(1)?;
    let migrated_rows: i64 = row.get(2)?;
    let last_pk: Option<String> = row.get(3)?;
    let status: String = row.get(4)?;
    let start_time: String = row.get(5)?;
    let last_update_time: String = row.get(6)?;
    let complete_time: Option<String> = row.get(7)?;
    let error_message: Option<String> = row.get(8)?;

    Ok((|| {
        Ok(TableProgress {
            table_name,
            total_rows: total_rows as u64,
            migrated_rows: migrated_rows as u64,
            last_pk,
            status: TableStatus::parse(&status)?,
            start_time: parse_time(&start_time)?,
            last_update_time: parse_time(&last_update_time)?,
            complete_time: complete_time.as_deref().map(parse_time).transpose()?,
            error_message,
        })
    })())
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("bad timestamp in progress store: {raw}"))?
        .with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_creates_pending_record() {
        let store = ProgressStore::in_memory().unwrap();
        let progress = store.start("users", 5).unwrap();
        assert_eq!(progress.status, TableStatus::Pending);
        assert_eq!(progress.total_rows, 5);
        assert_eq!(progress.migrated_rows, 0);
        assert!(progress.last_pk.is_none());
    }

    #[test]
    fn update_keeps_status_and_advances_cursor() {
        let store = ProgressStore::in_memory().unwrap();
        store.start("users", 5).unwrap();
        store.update("users", 3, Some("3")).unwrap();

        let progress = store.get("users").unwrap().unwrap();
        assert_eq!(progress.migrated_rows, 3);
        assert_eq!(progress.last_pk.as_deref(), Some("3"));
        assert_eq!(progress.status, TableStatus::Pending);
    }

    #[test]
    fn update_without_cursor_keeps_previous_cursor() {
        let store = ProgressStore::in_memory().unwrap();
        store.start("users", 5).unwrap();
        store.update("users", 3, Some("3")).unwrap();
        store.update("users", 4, None).unwrap();

        let progress = store.get("users").unwrap().unwrap();
        assert_eq!(progress.last_pk.as_deref(), Some("3"));
    }

    #[test]
    fn start_resumes_incomplete_copy() {
        let store = ProgressStore::in_memory().unwrap();
        store.start("users", 5).unwrap();
        store.update("users", 3, Some("3")).unwrap();

        // A second start (e.g. after a crash) keeps the cursor.
        let resumed = store.start("users", 5).unwrap();
        assert_eq!(resumed.status, TableStatus::InProgress);
        assert_eq!(resumed.migrated_rows, 3);
        assert_eq!(resumed.last_pk.as_deref(), Some("3"));
    }

    #[test]
    fn start_resets_completed_copy() {
        let store = ProgressStore::in_memory().unwrap();
        store.start("users", 5).unwrap();
        store.update("users", 5, Some("5")).unwrap();
        store.complete("users").unwrap();

        let restarted = store.start("users", 6).unwrap();
        assert_eq!(restarted.status, TableStatus::Pending);
        assert_eq!(restarted.migrated_rows, 0);
        assert!(restarted.last_pk.is_none());
        assert_eq!(restarted.total_rows, 6);
    }

    #[test]
    fn complete_sets_status_and_time() {
        let store = ProgressStore::in_memory().unwrap();
        store.start("users", 2).unwrap();
        store.complete("users").unwrap();

        let progress = store.get("users").unwrap().unwrap();
        assert_eq!(progress.status, TableStatus::Completed);
        assert!(progress.complete_time.is_some());
    }

    #[test]
    fn fail_records_error_and_reset_clears_it() {
        let store = ProgressStore::in_memory().unwrap();
        store.start("users", 2).unwrap();
        store.fail("users", "duplicate entry").unwrap();

        let failed = store.get("users").unwrap().unwrap();
        assert_eq!(failed.status, TableStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("duplicate entry"));

        store.reset("users").unwrap();
        let reset = store.get("users").unwrap().unwrap();
        assert_eq!(reset.status, TableStatus::Pending);
        assert!(reset.error_message.is_none());
        assert!(reset.last_pk.is_none());
    }

    #[test]
    fn incomplete_excludes_completed() {
        let store = ProgressStore::in_memory().unwrap();
        store.start("users", 2).unwrap();
        store.start("orders", 1).unwrap();
        store.complete("users").unwrap();

        let incomplete = store.get_incomplete().unwrap();
        assert_eq!(incomplete.len(), 1);
        assert_eq!(incomplete[0].table_name, "orders");
        assert!(store.has_incomplete().unwrap());
    }

    #[test]
    fn clear_all_and_delete() {
        let store = ProgressStore::in_memory().unwrap();
        store.start("users", 2).unwrap();
        store.start("orders", 1).unwrap();
        store.delete("users").unwrap();
        assert!(store.get("users").unwrap().is_none());
        store.clear_all().unwrap();
        assert!(store.get_all().unwrap().is_empty());
    }

    #[test]
    fn update_unknown_table_is_an_error() {
        let store = ProgressStore::in_memory().unwrap();
        assert!(store.update("ghost", 1, None).is_err());
    }
}
