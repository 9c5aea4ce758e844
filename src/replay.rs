//! Checkpoint-gated journal replay.
//!
//! The replayer scans the journal directory on a timer, reads the new tail
//! of each file, and executes exactly the entries whose binlog position lies
//! strictly after the durable checkpoint. A per-entry fingerprint guards
//! against double-apply across scans; the checkpoint is advanced every 100
//! successful applies, at the end of each batch and on shutdown.

use std::collections::{HashMap, HashSet};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use mysql_async::prelude::*;
use mysql_async::Pool;
use tracing::{debug, error, info};

use crate::checkpoint::CheckpointStore;
use crate::journal::{journal_files, parse_entries, SqlEntry};
use crate::position::BinlogPosition;

/// How many successful applies between periodic checkpoint saves.
const CHECKPOINT_EVERY: u64 = 100;

/// Applies journaled SQL to the target, gated by the checkpoint store.
pub struct Replayer {
    target: Pool,
    checkpoints: CheckpointStore,
    directory: PathBuf,
    scan_interval: Duration,
    running: Arc<AtomicBool>,
    /// Byte offset already consumed per journal file name.
    read_offsets: HashMap<String, u64>,
    /// Fingerprints of entries applied (or skipped as already-applied)
    /// during this process's lifetime.
    fingerprints: HashSet<String>,
}

impl Replayer {
    pub fn new(
        target: Pool,
        checkpoints: CheckpointStore,
        directory: impl Into<PathBuf>,
        scan_interval: Duration,
    ) -> Self {
        Self {
            target,
            checkpoints,
            directory: directory.into(),
            scan_interval,
            running: Arc::new(AtomicBool::new(false)),
            read_offsets: HashMap::new(),
            fingerprints: HashSet::new(),
        }
    }

    /// Flag the loop can be stopped through from another task.
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Scan-and-apply loop. Exits within one scan interval of the running
    /// flag dropping to false, saving the checkpoint on the way out.
    pub async fn run(&mut self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        info!(
            "replayer watching {} every {:?}",
            self.directory.display(),
            self.scan_interval
        );

        let mut last_applied: Option<BinlogPosition> = None;
        while self.running.load(Ordering::SeqCst) {
            match self.scan_once().await {
                Ok(applied) => {
                    if let Some(position) = applied {
                        last_applied = Some(position);
                    }
                }
                Err(e) => error!("journal scan failed: {e:#}"),
            }
            tokio::time::sleep(self.scan_interval).await;
        }

        if let Some(position) = last_applied {
            self.checkpoints.save(&position)?;
        }
        info!("replayer stopped");
        Ok(())
    }

    /// Stop the loop at the next interval boundary.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// One pass over the journal directory. Returns the last position
    /// applied during this pass, if any.
    pub async fn scan_once(&mut self) -> Result<Option<BinlogPosition>> {
        let checkpoint = self.checkpoints.load()?;
        let files = journal_files(&self.directory)?;
        let mut last_applied = None;

        for path in files {
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(String::from) else {
                continue;
            };

            let offset = self.read_offsets.get(&name).copied().unwrap_or(0);
            let size = std::fs::metadata(&path)?.len();
            if size <= offset {
                continue;
            }

            debug!("reading {} from byte {offset} (size {size})", name);
            let (content, consumed) = read_tail(&path, offset)?;
            self.read_offsets.insert(name, consumed);

            let entries = parse_entries(&content);
            if entries.is_empty() {
                continue;
            }
            if let Some(position) = self.execute_entries(&entries, checkpoint.as_ref()).await? {
                last_applied = Some(position);
            }
        }

        if let Some(ref position) = last_applied {
            self.checkpoints.save(position)?;
        }
        Ok(last_applied)
    }

    async fn execute_entries(
        &mut self,
        entries: &[SqlEntry],
        checkpoint: Option<&BinlogPosition>,
    ) -> Result<Option<BinlogPosition>> {
        let mut conn = self.target.get_conn().await?;
        let mut applied: u64 = 0;
        let mut last_applied: Option<BinlogPosition> = None;

        for entry in entries {
            let fingerprint = entry.fingerprint();
            if self.fingerprints.contains(&fingerprint) {
                debug!(
                    "skipping already-applied entry {}:{}",
                    entry.filename, entry.position
                );
                continue;
            }

            let position = entry.to_position();
            let gated_out = match checkpoint {
                Some(checkpoint) => !position.is_after(checkpoint),
                None => false,
            };
            if gated_out {
                // At or before the checkpoint: applied in a previous run.
                self.fingerprints.insert(fingerprint);
                continue;
            }

            match conn.query_drop(entry.sql.as_str()).await {
                Ok(()) => {
                    self.fingerprints.insert(fingerprint);
                    applied += 1;
                    info!("applied {}:{}", entry.filename, entry.position);
                    last_applied = Some(position);
                    if applied % CHECKPOINT_EVERY == 0 {
                        if let Some(ref position) = last_applied {
                            self.checkpoints.save(position)?;
                        }
                    }
                }
                Err(e) => {
                    // Not fingerprinted, so the entry is retried next scan.
                    error!(
                        "failed to apply {}:{}: {e}; will retry on next scan",
                        entry.filename, entry.position
                    );
                }
            }
        }

        if applied > 0 {
            info!("applied {applied} journal entries");
        }
        Ok(last_applied)
    }
}

/// Decide which of `entries` the replayer would execute, given the current
/// checkpoint and the set of already-applied fingerprints. Pure counterpart
/// of the apply loop, shared with tests.
pub fn plan_entries<'e>(
    entries: &'e [SqlEntry],
    checkpoint: Option<&BinlogPosition>,
    fingerprints: &HashSet<String>,
) -> Vec<&'e SqlEntry> {
    entries
        .iter()
        .filter(|entry| !fingerprints.contains(&entry.fingerprint()))
        .filter(|entry| match checkpoint {
            Some(checkpoint) => entry.to_position().is_after(checkpoint),
            None => true,
        })
        .collect()
}

/// Read a file's content from `offset` to EOF. Returns the content and the
/// new offset.
fn read_tail(path: &Path, offset: u64) -> Result<(String, u64)> {
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("cannot open journal file {}", path.display()))?;
    file.seek(SeekFrom::Start(offset))?;
    let mut buffer = Vec::new();
    file.read_to_end(&mut buffer)?;
    let consumed = offset + buffer.len() as u64;
    Ok((String::from_utf8_lossy(&buffer).into_owned(), consumed))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(filename: &str, position: u64, sql: &str) -> SqlEntry {
        SqlEntry {
            filename: filename.into(),
            position,
            gtid: None,
            sql: sql.into(),
        }
    }

    #[test]
    fn plan_applies_everything_without_checkpoint() {
        let entries = vec![entry("bin.000001", 100, "SELECT 1;")];
        let planned = plan_entries(&entries, None, &HashSet::new());
        assert_eq!(planned.len(), 1);
    }

    #[test]
    fn plan_gates_on_strictly_after() {
        let entries = vec![
            entry("bin.000001", 499, "SELECT 'before';"),
            entry("bin.000001", 500, "SELECT 'at';"),
            entry("bin.000001", 501, "SELECT 'after';"),
        ];

        let at_499 = BinlogPosition::new("bin.000001", 499);
        let planned = plan_entries(&entries, Some(&at_499), &HashSet::new());
        let positions: Vec<u64> = planned.iter().map(|e| e.position).collect();
        assert_eq!(positions, vec![500, 501]);

        let at_500 = BinlogPosition::new("bin.000001", 500);
        let planned = plan_entries(&entries, Some(&at_500), &HashSet::new());
        let positions: Vec<u64> = planned.iter().map(|e| e.position).collect();
        assert_eq!(positions, vec![501]);
    }

    #[test]
    fn plan_skips_fingerprinted_entries() {
        let entries = vec![
            entry("bin.000001", 100, "SELECT 1;"),
            entry("bin.000001", 200, "SELECT 2;"),
        ];
        let mut applied = HashSet::new();
        applied.insert(entries[0].fingerprint());

        let planned = plan_entries(&entries, None, &applied);
        assert_eq!(planned.len(), 1);
        assert_eq!(planned[0].position, 200);
    }

    #[test]
    fn plan_orders_by_gtid_when_available() {
        let mut early = entry("bin.000009", 10, "SELECT 'old txn';");
        early.gtid = Some("3e11fa47-71ca-11e1-9e33-c80aa9429562:4".into());
        let mut late = entry("bin.000001", 10, "SELECT 'new txn';");
        late.gtid = Some("3e11fa47-71ca-11e1-9e33-c80aa9429562:9".into());

        let checkpoint = BinlogPosition::new("bin.000005", 1)
            .with_gtid(Some("3e11fa47-71ca-11e1-9e33-c80aa9429562:5".into()));
        let entries = vec![early, late];
        let planned = plan_entries(&entries, Some(&checkpoint), &HashSet::new());
        assert_eq!(planned.len(), 1);
        assert_eq!(planned[0].sql, "SELECT 'new txn';");
    }

    #[test]
    fn read_tail_resumes_from_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.sql");
        std::fs::write(&path, "hello world").unwrap();

        let (all, consumed) = read_tail(&path, 0).unwrap();
        assert_eq!(all, "hello world");
        assert_eq!(consumed, 11);

        std::fs::write(&path, "hello world, again").unwrap();
        let (tail, consumed) = read_tail(&path, consumed).unwrap();
        assert_eq!(tail, ", again");
        assert_eq!(consumed, 18);
    }
}
