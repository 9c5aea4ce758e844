//! Raw binlog event decoding.
//!
//! Converts the driver's raw replication events into [`BinlogEvent`]s. Row
//! events in the binlog carry values but no column names, so the decoder
//! maintains a table map cache keyed by the binlog's table id and resolves
//! names out-of-band from `information_schema.COLUMNS` on first observation
//! of each `(database, table)` pair. When resolution fails the decoder falls
//! back to positional `column_N` names with a loud warning, since SQL
//! rendered from such events will only work if the operator fixes access.

use std::collections::HashMap;

use anyhow::Result;
use mysql_async::binlog::events::{Event, EventData, RowsEventData};
use mysql_async::binlog::row::BinlogRow;
use mysql_async::binlog::value::BinlogValue;
use mysql_async::consts::ColumnType;
use mysql_async::prelude::*;
use mysql_async::{BinlogStream, Pool};
use tracing::{debug, warn};

use super::event::{BinlogEvent, EventKind, RowImage};
use crate::position::BinlogPosition;
use crate::value::SqlValue;

/// Cached identity of a table id seen in a TableMap event.
#[derive(Debug, Clone)]
struct TableMapEntry {
    database: String,
    table: String,
    columns: Vec<String>,
    column_types: Vec<Option<ColumnType>>,
}

/// Stateful decoder for a single binlog stream.
///
/// Owned by the tail task; all mutation happens on that task, so no locking
/// is needed.
pub struct EventDecoder {
    /// Pool for information_schema lookups on the source.
    metadata: Pool,
    /// table id → identity. Overwritten on each new TableMap for the id.
    table_maps: HashMap<u64, TableMapEntry>,
    /// (database, table) → resolved column names, so each pair is queried
    /// only once.
    column_names: HashMap<(String, String), Vec<String>>,
    current_file: String,
    current_gtid: Option<String>,
}

impl EventDecoder {
    pub fn new(metadata: Pool, start_file: impl Into<String>) -> Self {
        Self {
            metadata,
            table_maps: HashMap::new(),
            column_names: HashMap::new(),
            current_file: start_file.into(),
            current_gtid: None,
        }
    }

    /// The binlog file currently being read, tracked from Rotate events.
    pub fn current_file(&self) -> &str {
        &self.current_file
    }

    /// Decode one raw event. Returns `None` for events that are consumed
    /// internally (rotate, GTID, table map) or not replicated (commit
    /// markers, heartbeats).
    pub async fn decode(
        &mut self,
        event: &Event,
        stream: &BinlogStream,
    ) -> Result<Option<BinlogEvent>> {
        let header = event.header();
        let log_pos = u64::from(header.log_pos());

        let Some(data) = event.read_data()? else {
            return Ok(None);
        };

        match data {
            EventData::RotateEvent(rotate) => {
                self.current_file = rotate.name().into_owned();
                debug!("rotated to binlog file {}", self.current_file);
                Ok(None)
            }
            EventData::GtidEvent(gtid) => {
                let sid = uuid::Uuid::from_bytes(gtid.sid());
                self.current_gtid = Some(format!("{sid}:{}", gtid.gno()));
                Ok(None)
            }
            EventData::TableMapEvent(table_map) => {
                let table_id = table_map.table_id();
                let database = table_map.database_name().into_owned();
                let table = table_map.table_name().into_owned();
                let column_count = table_map.columns_count() as usize;

                let mut column_types = Vec::with_capacity(column_count);
                for index in 0..column_count {
                    column_types.push(table_map.get_column_type(index).ok().flatten());
                }

                let columns = self.resolve_columns(&database, &table, column_count).await;
                self.table_maps.insert(
                    table_id,
                    TableMapEntry {
                        database,
                        table,
                        columns,
                        column_types,
                    },
                );
                Ok(None)
            }
            EventData::QueryEvent(query) => {
                let sql = query.query().into_owned();
                let database = query.schema().into_owned();
                Ok(Some(BinlogEvent {
                    position: self.position_at(log_pos),
                    kind: EventKind::Ddl { database, sql },
                }))
            }
            EventData::RowsEvent(rows) => self.decode_rows(&rows, stream, log_pos),
            _ => Ok(None),
        }
    }

    fn decode_rows(
        &self,
        rows: &RowsEventData<'_>,
        stream: &BinlogStream,
        log_pos: u64,
    ) -> Result<Option<BinlogEvent>> {
        let table_id = rows.table_id();
        let Some(entry) = self.table_maps.get(&table_id) else {
            warn!("row event for unknown table id {table_id}; dropping");
            return Ok(None);
        };
        let Some(tme) = stream.get_tme(table_id) else {
            warn!("no table map event tracked for table id {table_id}; dropping");
            return Ok(None);
        };

        let mut before_rows = Vec::new();
        let mut after_rows = Vec::new();
        for row in rows.rows(tme) {
            let (before, after) = row?;
            if let Some(before) = before {
                before_rows.push(row_image(entry, &before));
            }
            if let Some(after) = after {
                after_rows.push(row_image(entry, &after));
            }
        }

        let database = entry.database.clone();
        let table = entry.table.clone();
        let kind = match rows {
            RowsEventData::WriteRowsEvent(_) | RowsEventData::WriteRowsEventV1(_) => {
                EventKind::Insert {
                    database,
                    table,
                    rows: after_rows,
                }
            }
            RowsEventData::UpdateRowsEvent(_)
            | RowsEventData::UpdateRowsEventV1(_)
            | RowsEventData::PartialUpdateRowsEvent(_) => {
                if before_rows.len() != after_rows.len() {
                    warn!(
                        "update event for {database}.{table} has {} before and {} after images; dropping",
                        before_rows.len(),
                        after_rows.len()
                    );
                    return Ok(None);
                }
                EventKind::Update {
                    database,
                    table,
                    rows: before_rows.into_iter().zip(after_rows).collect(),
                }
            }
            RowsEventData::DeleteRowsEvent(_) | RowsEventData::DeleteRowsEventV1(_) => {
                EventKind::Delete {
                    database,
                    table,
                    rows: before_rows,
                }
            }
            _ => return Ok(None),
        };

        Ok(Some(BinlogEvent {
            position: self.position_at(log_pos),
            kind,
        }))
    }

    fn position_at(&self, log_pos: u64) -> BinlogPosition {
        BinlogPosition::new(self.current_file.clone(), log_pos)
            .with_gtid(self.current_gtid.clone())
    }

    /// Column names for a table, from the cache or information_schema.
    ///
    /// A failed or short resolution leaves the event usable via `column_N`
    /// fallback names, but downstream SQL will not match the real schema, so
    /// the warning here is deliberately prominent.
    async fn resolve_columns(
        &mut self,
        database: &str,
        table: &str,
        expected: usize,
    ) -> Vec<String> {
        let key = (database.to_string(), table.to_string());
        if let Some(columns) = self.column_names.get(&key) {
            return columns.clone();
        }

        let columns = match self.query_columns(database, table).await {
            Ok(columns) => columns,
            Err(e) => {
                warn!(
                    "failed to resolve column names for {database}.{table}: {e}; \
                     falling back to positional column_N names"
                );
                Vec::new()
            }
        };
        if !columns.is_empty() && columns.len() != expected {
            warn!(
                "column count mismatch for {database}.{table}: information_schema has {} \
                 but the table map declares {expected}; extra columns get positional names",
                columns.len()
            );
        }
        debug!(
            "cached {} column names for {database}.{table}",
            columns.len()
        );
        self.column_names.insert(key, columns.clone());
        columns
    }

    async fn query_columns(&self, database: &str, table: &str) -> Result<Vec<String>> {
        let mut conn = self.metadata.get_conn().await?;
        let columns: Vec<String> = conn
            .exec(
                "SELECT COLUMN_NAME FROM information_schema.COLUMNS \
                 WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? \
                 ORDER BY ORDINAL_POSITION",
                (database, table),
            )
            .await?;
        Ok(columns)
    }
}

/// Name for the column at `index`, falling back to `column_N` when the
/// resolved list is missing or too short.
fn column_name(columns: &[String], index: usize) -> String {
    columns
        .get(index)
        .cloned()
        .unwrap_or_else(|| format!("column_{index}"))
}

fn row_image(entry: &TableMapEntry, row: &BinlogRow) -> RowImage {
    let mut image = Vec::with_capacity(row.len());
    for index in 0..row.len() {
        let value = match row.as_ref(index) {
            Some(BinlogValue::Value(value)) => {
                SqlValue::from_mysql(value, entry.column_types.get(index).copied().flatten())
            }
            Some(other) => {
                warn!(
                    "unsupported binlog value for {}.{} column {index}: {other:?}; substituting NULL",
                    entry.database, entry.table
                );
                SqlValue::Null
            }
            // Column absent from a minimal row image.
            None => continue,
        };
        image.push((column_name(&entry.columns, index), value));
    }
    image
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_name_prefers_resolved_names() {
        let columns = vec!["id".to_string(), "name".to_string()];
        assert_eq!(column_name(&columns, 0), "id");
        assert_eq!(column_name(&columns, 1), "name");
    }

    #[test]
    fn column_name_falls_back_positionally() {
        let columns = vec!["id".to_string()];
        assert_eq!(column_name(&columns, 1), "column_1");
        assert_eq!(column_name(&[], 0), "column_0");
    }
}
