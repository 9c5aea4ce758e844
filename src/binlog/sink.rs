//! Event sinks.
//!
//! The tail engine hands every decoded, filtered event to an [`EventSink`].
//! Two interchangeable strategies exist: apply the change to the target
//! right away with parameterized statements, or serialize it into the SQL
//! journal for the asynchronous replayer.

use anyhow::Result;
use async_trait::async_trait;
use mysql_async::{Pool, Value};
use mysql_async::prelude::*;
use tracing::{debug, info};

use super::event::{BinlogEvent, EventKind, RowImage};
use crate::journal::JournalWriter;
use crate::position::BinlogPosition;

/// Consumer of decoded binlog events.
#[async_trait]
pub trait EventSink: Send {
    /// Apply or record one event. Errors are reported to the tail engine,
    /// which logs and drops the event; the tail itself never stops for a
    /// sink failure.
    async fn apply(&mut self, event: &BinlogEvent) -> Result<()>;

    /// Flush any buffered state on shutdown.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Executes each event against the target immediately.
pub struct DirectApplySink {
    pool: Pool,
}

impl DirectApplySink {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventSink for DirectApplySink {
    async fn apply(&mut self, event: &BinlogEvent) -> Result<()> {
        let mut conn = self.pool.get_conn().await?;
        match &event.kind {
            EventKind::Ddl { sql, .. } => {
                conn.query_drop(sql).await?;
                info!("applied DDL at {}: {sql}", event.position);
            }
            EventKind::Insert {
                database,
                table,
                rows,
            } => {
                for row in rows {
                    let (stmt, params) = insert_statement(database, table, row);
                    conn.exec_drop(stmt, params).await?;
                }
                debug!(
                    "applied INSERT of {} rows into {database}.{table}",
                    rows.len()
                );
            }
            EventKind::Update {
                database,
                table,
                rows,
            } => {
                for (before, after) in rows {
                    let (stmt, params) = update_statement(database, table, before, after);
                    conn.exec_drop(stmt, params).await?;
                }
                debug!("applied UPDATE of {} rows in {database}.{table}", rows.len());
            }
            EventKind::Delete {
                database,
                table,
                rows,
            } => {
                for row in rows {
                    let (stmt, params) = delete_statement(database, table, row);
                    conn.exec_drop(stmt, params).await?;
                }
                debug!(
                    "applied DELETE of {} rows from {database}.{table}",
                    rows.len()
                );
            }
        }
        Ok(())
    }
}

/// Serializes each event into the rolling SQL journal.
pub struct JournalSink {
    journal: JournalWriter,
}

impl JournalSink {
    pub fn new(journal: JournalWriter) -> Self {
        Self { journal }
    }
}

#[async_trait]
impl EventSink for JournalSink {
    async fn apply(&mut self, event: &BinlogEvent) -> Result<()> {
        for sql in render_statements(&event.kind) {
            self.journal.write(&sql, &event.position)?;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.journal.close()
    }
}

/// Render an event as literal SQL statements, one per row, for the journal.
pub fn render_statements(kind: &EventKind) -> Vec<String> {
    match kind {
        EventKind::Ddl { sql, .. } => vec![sql.clone()],
        EventKind::Insert {
            database,
            table,
            rows,
        } => rows
            .iter()
            .map(|row| render_insert(database, table, row))
            .collect(),
        EventKind::Update {
            database,
            table,
            rows,
        } => rows
            .iter()
            .map(|(before, after)| render_update(database, table, before, after))
            .collect(),
        EventKind::Delete {
            database,
            table,
            rows,
        } => rows
            .iter()
            .map(|row| render_delete(database, table, row))
            .collect(),
    }
}

fn render_insert(database: &str, table: &str, row: &RowImage) -> String {
    let columns: Vec<&str> = row.iter().map(|(name, _)| name.as_str()).collect();
    let values: Vec<String> = row.iter().map(|(_, value)| value.to_literal()).collect();
    format!(
        "INSERT INTO {database}.{table} ({}) VALUES ({})",
        columns.join(", "),
        values.join(", ")
    )
}

fn render_update(database: &str, table: &str, before: &RowImage, after: &RowImage) -> String {
    let set: Vec<String> = after
        .iter()
        .map(|(name, value)| format!("{name} = {}", value.to_literal()))
        .collect();
    let predicate: Vec<String> = before
        .iter()
        .map(|(name, value)| format!("{name} = {}", value.to_literal()))
        .collect();
    format!(
        "UPDATE {database}.{table} SET {} WHERE {}",
        set.join(", "),
        predicate.join(" AND ")
    )
}

fn render_delete(database: &str, table: &str, row: &RowImage) -> String {
    let predicate: Vec<String> = row
        .iter()
        .map(|(name, value)| format!("{name} = {}", value.to_literal()))
        .collect();
    format!(
        "DELETE FROM {database}.{table} WHERE {}",
        predicate.join(" AND ")
    )
}

fn insert_statement(database: &str, table: &str, row: &RowImage) -> (String, Vec<Value>) {
    let columns: Vec<String> = row.iter().map(|(name, _)| format!("`{name}`")).collect();
    let placeholders: Vec<&str> = row.iter().map(|_| "?").collect();
    let stmt = format!(
        "INSERT INTO `{database}`.`{table}` ({}) VALUES ({})",
        columns.join(", "),
        placeholders.join(", ")
    );
    let params = row.iter().map(|(_, value)| value.to_mysql()).collect();
    (stmt, params)
}

fn update_statement(
    database: &str,
    table: &str,
    before: &RowImage,
    after: &RowImage,
) -> (String, Vec<Value>) {
    let set: Vec<String> = after
        .iter()
        .map(|(name, _)| format!("`{name}` = ?"))
        .collect();
    let predicate: Vec<String> = before
        .iter()
        .map(|(name, _)| format!("`{name}` = ?"))
        .collect();
    let stmt = format!(
        "UPDATE `{database}`.`{table}` SET {} WHERE {}",
        set.join(", "),
        predicate.join(" AND ")
    );
    let params = after
        .iter()
        .chain(before.iter())
        .map(|(_, value)| value.to_mysql())
        .collect();
    (stmt, params)
}

fn delete_statement(database: &str, table: &str, row: &RowImage) -> (String, Vec<Value>) {
    let predicate: Vec<String> = row
        .iter()
        .map(|(name, _)| format!("`{name}` = ?"))
        .collect();
    let stmt = format!(
        "DELETE FROM `{database}`.`{table}` WHERE {}",
        predicate.join(" AND ")
    );
    let params = row.iter().map(|(_, value)| value.to_mysql()).collect();
    (stmt, params)
}

/// A journal sink paired with a position is exercised end to end in the
/// journal module's tests; the renderers are covered here.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::SqlValue;

    fn row(pairs: &[(&str, SqlValue)]) -> RowImage {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn renders_insert_literals() {
        let kind = EventKind::Insert {
            database: "shop".into(),
            table: "users".into(),
            rows: vec![row(&[
                ("id", SqlValue::Int(1)),
                ("name", SqlValue::Text("a".into())),
            ])],
        };
        assert_eq!(
            render_statements(&kind),
            vec!["INSERT INTO shop.users (id, name) VALUES (1, 'a')"]
        );
    }

    #[test]
    fn renders_update_with_before_image_predicate() {
        let kind = EventKind::Update {
            database: "shop".into(),
            table: "users".into(),
            rows: vec![(
                row(&[("id", SqlValue::Int(2)), ("name", SqlValue::Text("b".into()))]),
                row(&[("id", SqlValue::Int(2)), ("name", SqlValue::Text("c".into()))]),
            )],
        };
        assert_eq!(
            render_statements(&kind),
            vec!["UPDATE shop.users SET id = 2, name = 'c' WHERE id = 2 AND name = 'b'"]
        );
    }

    #[test]
    fn renders_delete_with_all_columns() {
        let kind = EventKind::Delete {
            database: "shop".into(),
            table: "users".into(),
            rows: vec![row(&[
                ("id", SqlValue::Int(3)),
                ("name", SqlValue::Null),
            ])],
        };
        assert_eq!(
            render_statements(&kind),
            vec!["DELETE FROM shop.users WHERE id = 3 AND name = NULL"]
        );
    }

    #[test]
    fn renders_one_statement_per_row() {
        let kind = EventKind::Insert {
            database: "shop".into(),
            table: "users".into(),
            rows: vec![
                row(&[("id", SqlValue::Int(1))]),
                row(&[("id", SqlValue::Int(2))]),
            ],
        };
        assert_eq!(render_statements(&kind).len(), 2);
    }

    #[test]
    fn ddl_rendered_verbatim() {
        let kind = EventKind::Ddl {
            database: "shop".into(),
            sql: "ALTER TABLE users ADD COLUMN age INT".into(),
        };
        assert_eq!(
            render_statements(&kind),
            vec!["ALTER TABLE users ADD COLUMN age INT"]
        );
    }

    #[test]
    fn parameterized_insert_matches_row_order() {
        let image = row(&[("id", SqlValue::Int(1)), ("name", SqlValue::Text("a".into()))]);
        let (stmt, params) = insert_statement("shop", "users", &image);
        assert_eq!(
            stmt,
            "INSERT INTO `shop`.`users` (`id`, `name`) VALUES (?, ?)"
        );
        assert_eq!(params, vec![Value::Int(1), Value::Bytes(b"a".to_vec())]);
    }

    #[test]
    fn parameterized_update_binds_after_then_before() {
        let before = row(&[("id", SqlValue::Int(2)), ("name", SqlValue::Text("b".into()))]);
        let after = row(&[("id", SqlValue::Int(2)), ("name", SqlValue::Text("c".into()))]);
        let (stmt, params) = update_statement("shop", "users", &before, &after);
        assert_eq!(
            stmt,
            "UPDATE `shop`.`users` SET `id` = ?, `name` = ? WHERE `id` = ? AND `name` = ?"
        );
        assert_eq!(
            params,
            vec![
                Value::Int(2),
                Value::Bytes(b"c".to_vec()),
                Value::Int(2),
                Value::Bytes(b"b".to_vec()),
            ]
        );
    }

    #[test]
    fn parameterized_delete_uses_before_image() {
        let image = row(&[("id", SqlValue::Int(3))]);
        let (stmt, params) = delete_statement("shop", "users", &image);
        assert_eq!(stmt, "DELETE FROM `shop`.`users` WHERE `id` = ?");
        assert_eq!(params, vec![Value::Int(3)]);
    }
}
