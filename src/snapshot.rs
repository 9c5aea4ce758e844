//! Full snapshot: schema apply and batched, resumable row copy.

use anyhow::{anyhow, Context, Result};
use mysql_async::prelude::*;
use mysql_async::{Params, Pool, Row, Value};
use tracing::{debug, error, info, warn};

use crate::config::MigrationConfig;
use crate::metadata::{normalize_create_sql, MetadataReader, TableMeta};
use crate::progress::ProgressStore;
use crate::value::cursor_string;

/// Outcome of one table's data copy.
#[derive(Debug, Default, Clone)]
pub struct TableCopyResult {
    pub copied_rows: u64,
    pub failed_rows: u64,
}

/// Outcome of a snapshot run.
#[derive(Debug, Default, Clone)]
pub struct SnapshotSummary {
    pub tables: usize,
    pub copied_rows: u64,
    pub failed_rows: u64,
    pub failed_tables: usize,
}

/// Copies schema and data from the source to the target, table by table in
/// discovery order, persisting per-table cursors so an interrupted copy
/// resumes from the last committed primary-key value.
pub struct SnapshotEngine<'a> {
    source: Pool,
    target: Pool,
    config: &'a MigrationConfig,
    progress: Option<&'a ProgressStore>,
}

impl<'a> SnapshotEngine<'a> {
    pub fn new(
        source: Pool,
        target: Pool,
        config: &'a MigrationConfig,
        progress: Option<&'a ProgressStore>,
    ) -> Self {
        Self {
            source,
            target,
            config,
            progress,
        }
    }

    /// Apply each table's normalized CREATE statement to the target.
    ///
    /// A per-table failure is logged and the phase continues; a previously
    /// migrated target routinely rejects CREATEs when `drop_tables` is off.
    /// Only a phase where every table fails is an error.
    pub async fn migrate_schema(&self, tables: &[TableMeta]) -> Result<()> {
        info!("migrating schema for {} tables", tables.len());
        let mut conn = self.target.get_conn().await?;
        let mut failures = 0usize;

        for table in tables {
            if self.config.drop_tables {
                if let Err(e) = conn
                    .query_drop(format!("DROP TABLE IF EXISTS `{}`", table.name))
                    .await
                {
                    error!("failed to drop table {}: {e}", table.name);
                }
            }

            let create_sql = normalize_create_sql(&table.create_sql);
            match conn.query_drop(&create_sql).await {
                Ok(()) => debug!("created table {}", table.name),
                Err(e) => {
                    failures += 1;
                    error!("failed to create table {}: {e}", table.name);
                }
            }
        }

        if !tables.is_empty() && failures == tables.len() {
            return Err(anyhow!("schema migration failed for every table"));
        }
        info!(
            "schema migration done: {} ok, {} failed",
            tables.len() - failures,
            failures
        );
        Ok(())
    }

    /// Copy data for all tables sequentially in discovery order.
    pub async fn migrate_data(
        &self,
        reader: &MetadataReader,
        tables: &[TableMeta],
    ) -> Result<SnapshotSummary> {
        let mut summary = SnapshotSummary {
            tables: tables.len(),
            ..Default::default()
        };

        for table in tables {
            match self.copy_table(reader, table).await {
                Ok(result) => {
                    summary.copied_rows += result.copied_rows;
                    summary.failed_rows += result.failed_rows;
                    info!(
                        "table {} copied: {} rows ({} failed)",
                        table.name, result.copied_rows, result.failed_rows
                    );
                }
                Err(e) => {
                    summary.failed_tables += 1;
                    error!("table {} copy failed: {e:#}", table.name);
                    if !self.config.continue_on_error {
                        return Err(e);
                    }
                }
            }
        }

        info!(
            "data migration done: {} rows copied, {} failed, {} tables failed",
            summary.copied_rows, summary.failed_rows, summary.failed_tables
        );
        Ok(summary)
    }

    /// Copy one table, resuming from the stored cursor when possible.
    pub async fn copy_table(
        &self,
        reader: &MetadataReader,
        table: &TableMeta,
    ) -> Result<TableCopyResult> {
        let total_rows = reader.row_count(&table.name).await?;
        info!("copying table {} ({total_rows} rows)", table.name);

        // Resume only with a single-column primary key; composite or missing
        // keys restart the read from the beginning on every run.
        let resumable = self.config.enable_resume && table.primary_key.is_some();
        let mut cursor: Option<String> = None;
        let mut migrated: u64 = 0;

        if let Some(progress) = self.progress {
            let record = progress.start(&table.name, total_rows)?;
            if resumable {
                cursor = record.last_pk.clone();
                migrated = record.migrated_rows;
            }
        }

        if total_rows == 0 && cursor.is_none() {
            if let Some(progress) = self.progress {
                progress.complete(&table.name)?;
            }
            info!("table {} is empty; nothing to copy", table.name);
            return Ok(TableCopyResult::default());
        }

        let result = match table.primary_key_index() {
            Some(pk_index) => self.copy_with_cursor(table, pk_index, cursor, migrated).await,
            None => self.copy_full_scan(table).await,
        };

        match result {
            Ok(result) => {
                if let Some(progress) = self.progress {
                    progress.complete(&table.name)?;
                }
                Ok(result)
            }
            Err(e) => {
                if let Some(progress) = self.progress {
                    progress.fail(&table.name, &format!("{e:#}"))?;
                }
                Err(e)
            }
        }
    }

    /// Seek-paginated copy in primary-key-ascending order. Each batch is one
    /// `WHERE pk > ? ORDER BY pk LIMIT n` read followed by one multi-row
    /// insert; the cursor is persisted after every applied batch.
    async fn copy_with_cursor(
        &self,
        table: &TableMeta,
        pk_index: usize,
        mut cursor: Option<String>,
        mut migrated: u64,
    ) -> Result<TableCopyResult> {
        let pk = table
            .primary_key
            .as_deref()
            .ok_or_else(|| anyhow!("cursor copy without a primary key"))?;
        let columns = table.quoted_column_list();
        let batch_size = self.config.batch_size.max(1);

        let first_sql = format!(
            "SELECT {columns} FROM `{}` ORDER BY `{pk}` LIMIT {batch_size}",
            table.name
        );
        let seek_sql = format!(
            "SELECT {columns} FROM `{}` WHERE `{pk}` > ? ORDER BY `{pk}` LIMIT {batch_size}",
            table.name
        );

        if let Some(ref cursor) = cursor {
            info!(
                "resuming table {} from cursor {cursor} ({migrated} rows already copied)",
                table.name
            );
        }

        let mut source = self.source.get_conn().await?;
        let mut target = self.target.get_conn().await?;
        let mut result = TableCopyResult::default();

        loop {
            let rows: Vec<Row> = match &cursor {
                Some(last_pk) => source.exec(&seek_sql, (last_pk.as_str(),)).await?,
                None => source.exec(&first_sql, ()).await?,
            };
            if rows.is_empty() {
                break;
            }

            let batch_len = rows.len();
            let batch_cursor = rows
                .last()
                .and_then(|row| row.as_ref(pk_index))
                .and_then(cursor_string)
                .ok_or_else(|| anyhow!("primary key value missing in batch for {}", table.name))?;

            match self.insert_batch(&mut target, table, rows).await {
                Ok(()) => {
                    migrated += batch_len as u64;
                    result.copied_rows += batch_len as u64;
                }
                Err(e) if self.config.continue_on_error => {
                    // Advance past the failed batch so identical rows are not
                    // re-read forever; the cursor still moves.
                    result.failed_rows += batch_len as u64;
                    warn!(
                        "batch insert failed for {} ({batch_len} rows skipped): {e:#}",
                        table.name
                    );
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("batch insert into {}", table.name));
                }
            }

            if let Some(progress) = self.progress {
                progress.update(&table.name, migrated, Some(&batch_cursor))?;
            }
            cursor = Some(batch_cursor);

            if migrated % 10_000 < batch_size as u64 {
                debug!("table {}: {migrated} rows copied", table.name);
            }
            if batch_len < batch_size {
                break;
            }
        }

        Ok(result)
    }

    /// Full-scan copy for tables without a usable primary key. The whole
    /// result set is read up front and applied in batches; there is no
    /// resumable cursor, so a failure restarts the table from scratch.
    async fn copy_full_scan(&self, table: &TableMeta) -> Result<TableCopyResult> {
        let columns = table.quoted_column_list();
        let batch_size = self.config.batch_size.max(1);

        let mut source = self.source.get_conn().await?;
        let rows: Vec<Row> = source
            .query(format!("SELECT {columns} FROM `{}`", table.name))
            .await?;

        let mut target = self.target.get_conn().await?;
        let mut result = TableCopyResult::default();
        let mut migrated: u64 = 0;

        let mut pending = rows.into_iter().peekable();
        while pending.peek().is_some() {
            let batch: Vec<Row> = pending.by_ref().take(batch_size).collect();
            let batch_len = batch.len();

            match self.insert_batch(&mut target, table, batch).await {
                Ok(()) => {
                    migrated += batch_len as u64;
                    result.copied_rows += batch_len as u64;
                }
                Err(e) if self.config.continue_on_error => {
                    result.failed_rows += batch_len as u64;
                    warn!(
                        "batch insert failed for {} ({batch_len} rows skipped): {e:#}",
                        table.name
                    );
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("batch insert into {}", table.name));
                }
            }

            if let Some(progress) = self.progress {
                progress.update(&table.name, migrated, None)?;
            }
        }

        Ok(result)
    }

    /// One multi-row parameterized insert.
    async fn insert_batch(
        &self,
        target: &mut mysql_async::Conn,
        table: &TableMeta,
        rows: Vec<Row>,
    ) -> Result<()> {
        let column_count = table.columns.len();
        let row_placeholder = format!(
            "({})",
            std::iter::repeat("?")
                .take(column_count)
                .collect::<Vec<_>>()
                .join(", ")
        );
        let placeholders = std::iter::repeat(row_placeholder.as_str())
            .take(rows.len())
            .collect::<Vec<_>>()
            .join(", ");
        let stmt = format!(
            "INSERT INTO `{}` ({}) VALUES {placeholders}",
            table.name,
            table.quoted_column_list()
        );

        let mut params: Vec<Value> = Vec::with_capacity(rows.len() * column_count);
        for row in rows {
            params.extend(row.unwrap());
        }

        target.exec_drop(stmt, Params::Positional(params)).await?;
        Ok(())
    }
}
