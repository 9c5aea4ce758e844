//! SQL journal files.
//!
//! The journal sink serializes decoded binlog events into append-only SQL
//! files that a separate replayer consumes. Each entry carries the binlog
//! position of the event that produced it:
//!
//! ```text
//! -- Binlog SQL Export
//! -- Generated at: 2026-03-01T10:50:12
//! -- File: binlog_sql_20260301_105012_0001.sql
//!
//! [POSITION] binlog.000011:1042
//! [GTID] 3e11fa47-71ca-11e1-9e33-c80aa9429562:1-5
//! INSERT INTO shop.users (id, name) VALUES (1, 'test');
//!
//! [POSITION] binlog.000011:1250
//! [GTID]
//! UPDATE shop.users SET name = 'updated' WHERE id = 1;
//! ```
//!
//! Files roll over after 10,000 statements and are flushed after every write
//! so a crash loses at most the statement being written.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use tracing::{debug, info, warn};

use crate::position::BinlogPosition;

const MAX_STATEMENTS_PER_FILE: usize = 10_000;
const FILE_PREFIX: &str = "binlog_sql_";
const FILE_SUFFIX: &str = ".sql";

/// Appends position-annotated SQL statements to a rolling file journal.
pub struct JournalWriter {
    dir: PathBuf,
    file_seq: u32,
    statements_in_file: usize,
    total_statements: u64,
    writer: Option<BufWriter<File>>,
    current_name: String,
}

impl JournalWriter {
    /// Create the journal directory if needed and open the first file.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("cannot create journal directory {}", dir.display()))?;
        let mut journal = Self {
            dir,
            file_seq: 0,
            statements_in_file: 0,
            total_statements: 0,
            writer: None,
            current_name: String::new(),
        };
        journal.roll_over()?;
        Ok(journal)
    }

    /// Name of the file currently being written.
    pub fn current_file(&self) -> &str {
        &self.current_name
    }

    /// Total statements written over the journal's lifetime.
    pub fn total_statements(&self) -> u64 {
        self.total_statements
    }

    /// Append one statement with its position header. Flushes before
    /// returning so the entry is visible to the replayer immediately.
    pub fn write(&mut self, sql: &str, position: &BinlogPosition) -> Result<()> {
        let sql = sql.trim();
        if sql.is_empty() {
            warn!("skipping empty SQL statement for journal");
            return Ok(());
        }

        if self.statements_in_file >= MAX_STATEMENTS_PER_FILE {
            self.roll_over()?;
        }

        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("journal writer is closed"))?;

        writeln!(
            writer,
            "[POSITION] {}:{}",
            position.filename, position.position
        )?;
        writeln!(writer, "[GTID] {}", position.gtid.as_deref().unwrap_or(""))?;
        if sql.ends_with(';') {
            writeln!(writer, "{sql}")?;
        } else {
            writeln!(writer, "{sql};")?;
        }
        writeln!(writer)?;
        writer.flush()?;

        self.statements_in_file += 1;
        self.total_statements += 1;
        debug!(
            "journaled statement {} into {}",
            self.statements_in_file, self.current_name
        );
        Ok(())
    }

    fn roll_over(&mut self) -> Result<()> {
        self.close_current()?;

        self.file_seq += 1;
        let now = Local::now();
        self.current_name = format!(
            "{FILE_PREFIX}{}_{:04}{FILE_SUFFIX}",
            now.format("%Y%m%d_%H%M%S"),
            self.file_seq
        );
        let path = self.dir.join(&self.current_name);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("cannot open journal file {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "-- Binlog SQL Export")?;
        writeln!(writer, "-- Generated at: {}", now.format("%Y-%m-%dT%H:%M:%S"))?;
        writeln!(writer, "-- File: {}", self.current_name)?;
        writeln!(
            writer,
            "-- Format: [POSITION] filename:position, [GTID] gtid_value, SQL statement"
        )?;
        writeln!(writer)?;
        writer.flush()?;

        self.writer = Some(writer);
        self.statements_in_file = 0;
        info!("opened journal file {}", path.display());
        Ok(())
    }

    fn close_current(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            info!(
                "closed journal file {} ({} statements)",
                self.current_name, self.statements_in_file
            );
        }
        Ok(())
    }

    /// Flush and close the current file.
    pub fn close(&mut self) -> Result<()> {
        self.close_current()?;
        info!(
            "journal closed: {} statements across {} files",
            self.total_statements, self.file_seq
        );
        Ok(())
    }
}

impl Drop for JournalWriter {
    fn drop(&mut self) {
        if let Err(e) = self.close_current() {
            warn!("failed to close journal file on drop: {e}");
        }
    }
}

/// One parsed journal entry.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlEntry {
    /// Binlog filename from the `[POSITION]` header.
    pub filename: String,
    /// Binlog byte offset from the `[POSITION]` header.
    pub position: u64,
    /// GTID from the `[GTID]` header; an empty header means absent.
    pub gtid: Option<String>,
    /// The SQL statement, accumulated across lines.
    pub sql: String,
}

impl SqlEntry {
    pub fn to_position(&self) -> BinlogPosition {
        BinlogPosition::new(self.filename.clone(), self.position).with_gtid(self.gtid.clone())
    }

    /// Dedup key for the replayer: binlog file, offset and a hash of the SQL.
    pub fn fingerprint(&self) -> String {
        use std::hash::{DefaultHasher, Hash, Hasher};
        let mut hasher = DefaultHasher::new();
        self.sql.hash(&mut hasher);
        format!("{}:{}:{:x}", self.filename, self.position, hasher.finish())
    }
}

/// Parse journal content into entries.
///
/// Blank lines and `--` comments are ignored. A `[POSITION]` line starts a
/// new entry, flushing any SQL accumulated for the previous one; SQL lines
/// between headers are joined with spaces.
pub fn parse_entries(content: &str) -> Vec<SqlEntry> {
    let mut entries = Vec::new();
    let mut filename: Option<String> = None;
    let mut position: u64 = 0;
    let mut gtid: Option<String> = None;
    let mut sql = String::new();

    let mut flush = |filename: &Option<String>, position: u64, gtid: &Option<String>, sql: &mut String| {
        if let Some(filename) = filename {
            if !sql.trim().is_empty() {
                entries.push(SqlEntry {
                    filename: filename.clone(),
                    position,
                    gtid: gtid.clone(),
                    sql: sql.trim().to_string(),
                });
            }
        }
        sql.clear();
    };

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("--") {
            continue;
        }

        if let Some(rest) = line.strip_prefix("[POSITION]") {
            flush(&filename, position, &gtid, &mut sql);
            filename = None;
            gtid = None;
            if let Some((file, pos)) = rest.trim().rsplit_once(':') {
                match pos.parse() {
                    Ok(parsed) => {
                        filename = Some(file.to_string());
                        position = parsed;
                    }
                    Err(_) => warn!("unparseable position header: {line}"),
                }
            } else {
                warn!("unparseable position header: {line}");
            }
            continue;
        }

        if let Some(rest) = line.strip_prefix("[GTID]") {
            let value = rest.trim();
            gtid = (!value.is_empty()).then(|| value.to_string());
            continue;
        }

        sql.push_str(line);
        sql.push(' ');
    }

    flush(&filename, position, &gtid, &mut sql);
    entries
}

/// Parse a whole journal file.
pub fn parse_file(path: impl AsRef<Path>) -> Result<Vec<SqlEntry>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read journal file {}", path.display()))?;
    let entries = parse_entries(&content);
    debug!("parsed {} entries from {}", entries.len(), path.display());
    Ok(entries)
}

/// Journal files in a directory, sorted by filename so scan order matches
/// write order.
pub fn journal_files(dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| ext == "sql")
                .unwrap_or(false)
        })
        .collect();
    files.sort();
    Ok(files)
}
