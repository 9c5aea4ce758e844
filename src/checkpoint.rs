//! Durable binlog checkpoint.
//!
//! A single-row SQLite store holding the most recent binlog position past
//! which all events have been durably applied to the target. The record is
//! written once before the first snapshot read (the snapshot start position)
//! and then advanced by the replayer after successful batches.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use mysql_async::prelude::*;
use mysql_async::Row;
use rusqlite::Connection;
use tracing::{info, warn};

use crate::position::BinlogPosition;

const CREATE_TABLES: &str = "
CREATE TABLE IF NOT EXISTS checkpoint (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    filename TEXT NOT NULL,
    position INTEGER NOT NULL,
    gtid TEXT,
    timestamp INTEGER NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);
";

/// SQLite-backed single-row checkpoint store.
pub struct CheckpointStore {
    conn: Mutex<Connection>,
}

impl CheckpointStore {
    /// Open or create the checkpoint database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("cannot open checkpoint database {}", path.display()))?;
        conn.execute_batch(CREATE_TABLES)?;
        info!("checkpoint store ready at {}", path.display());
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
            .map_err(|_| anyhow!("checkpoint store lock poisoned"))
    }

    /// Overwrite the checkpoint. Durable before this returns.
    pub fn save(&self, position: &BinlogPosition) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO checkpoint (id, filename, position, gtid, timestamp) \
             VALUES (1, ?1, ?2, ?3, ?4) \
             ON CONFLICT(id) DO UPDATE SET \
             filename = ?1, position = ?2, gtid = ?3, timestamp = ?4",
            rusqlite::params![
                position.filename,
                position.position as i64,
                position.gtid,
                position.timestamp
            ],
        )?;
        info!("checkpoint saved: {position}");
        Ok(())
    }

    /// The stored checkpoint, if one has ever been written.
    pub fn load(&self) -> Result<Option<BinlogPosition>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            "SELECT filename, position, gtid, timestamp FROM checkpoint WHERE id = 1",
            [],
            |row| {
                Ok(BinlogPosition {
                    filename: row.get(0)?,
                    position: row.get::<_, i64>(1)? as u64,
                    gtid: row.get(2)?,
                    timestamp: row.get(3)?,
                })
            },
        );
        match result {
            Ok(position) => Ok(Some(position)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Read the source's current binlog position and executed GTID set.
///
/// Called before the first snapshot row is read so that every change made
/// during the snapshot window is replayed afterwards. The GTID query fails on
/// servers without GTID mode; that is tolerated with a warning.
pub async fn current_source_position(conn: &mut mysql_async::Conn) -> Result<BinlogPosition> {
    let row: Option<Row> = conn.query_first("SHOW MASTER STATUS").await?;
    let row = row.ok_or_else(|| {
        anyhow!("SHOW MASTER STATUS returned nothing; is binary logging enabled on the source?")
    })?;
    let filename: String = row
        .get("File")
        .ok_or_else(|| anyhow!("SHOW MASTER STATUS has no File column"))?;
    let position: u64 = row
        .get("Position")
        .ok_or_else(|| anyhow!("SHOW MASTER STATUS has no Position column"))?;

    let gtid = match conn
        .query_first::<String, _>("SELECT @@global.gtid_executed")
        .await
    {
        Ok(gtid) => gtid.filter(|g| !g.is_empty()),
        Err(e) => {
            warn!("could not read gtid_executed (GTID mode likely off): {e}");
            None
        }
    };

    let position = BinlogPosition {
        filename,
        position,
        gtid,
        timestamp: Utc::now().timestamp_millis(),
    };
    info!("source binlog position: {position}");
    Ok(position)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_before_save_is_none() {
        let store = CheckpointStore::in_memory().unwrap();
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn save_then_load_round_trips() {
        let store = CheckpointStore::in_memory().unwrap();
        let position = BinlogPosition::new("binlog.000011", 1042)
            .with_gtid(Some("3e11fa47-71ca-11e1-9e33-c80aa9429562:1-5".into()));
        store.save(&position).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded, position);
        assert_eq!(loaded.gtid, position.gtid);
        assert_eq!(loaded.timestamp, position.timestamp);
    }

    #[test]
    fn save_overwrites_single_row() {
        let store = CheckpointStore::in_memory().unwrap();
        store.save(&BinlogPosition::new("bin.000001", 100)).unwrap();
        store.save(&BinlogPosition::new("bin.000002", 4)).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.filename, "bin.000002");
        assert_eq!(loaded.position, 4);
        assert!(loaded.gtid.is_none());
    }

    #[test]
    fn file_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.db");
        {
            let store = CheckpointStore::open(&path).unwrap();
            store.save(&BinlogPosition::new("bin.000007", 77)).unwrap();
        }
        let reopened = CheckpointStore::open(&path).unwrap();
        let loaded = reopened.load().unwrap().unwrap();
        assert_eq!(loaded, BinlogPosition::new("bin.000007", 77));
    }
}
