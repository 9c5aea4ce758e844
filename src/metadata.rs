//! Source database metadata.
//!
//! Reads the table inventory the snapshot engine works from: table names in
//! discovery order, column lists, the single-column primary key when one
//! exists, exact row counts and the original CREATE statement (normalized
//! before it is applied to the target).

use anyhow::{anyhow, Context, Result};
use mysql_async::prelude::*;
use mysql_async::{Pool, Row};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

/// One column of a source table.
#[derive(Debug, Clone)]
pub struct ColumnMeta {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub default: Option<String>,
    pub auto_increment: bool,
}

/// Descriptor of a source table, immutable for the duration of a snapshot.
#[derive(Debug, Clone)]
pub struct TableMeta {
    pub name: String,
    pub columns: Vec<ColumnMeta>,
    /// Single-column primary key. Composite primary keys degrade to `None`:
    /// the table is still copied but cannot carry a resumable cursor.
    pub primary_key: Option<String>,
    pub create_sql: String,
}

impl TableMeta {
    /// Ordered column names, back-quoted for use in statements.
    pub fn quoted_column_list(&self) -> String {
        self.columns
            .iter()
            .map(|c| format!("`{}`", c.name))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Index of the primary-key column within the column list.
    pub fn primary_key_index(&self) -> Option<usize> {
        let pk = self.primary_key.as_deref()?;
        self.columns.iter().position(|c| c.name == pk)
    }
}

/// Reads table metadata from the source database.
pub struct MetadataReader {
    pool: Pool,
    database: String,
}

impl MetadataReader {
    pub fn new(pool: Pool, database: impl Into<String>) -> Self {
        Self {
            pool,
            database: database.into(),
        }
    }

    /// Base tables of the source database, ordered by name. This ordering is
    /// the discovery order used by both snapshot phases.
    pub async fn list_tables(&self) -> Result<Vec<String>> {
        let mut conn = self.pool.get_conn().await?;
        let tables: Vec<String> = conn
            .exec(
                "SELECT TABLE_NAME FROM information_schema.TABLES \
                 WHERE TABLE_SCHEMA = ? AND TABLE_TYPE = 'BASE TABLE' \
                 ORDER BY TABLE_NAME",
                (&self.database,),
            )
            .await?;
        debug!("found {} tables in {}", tables.len(), self.database);
        Ok(tables)
    }

    /// Full descriptor for one table.
    pub async fn table_meta(&self, table: &str) -> Result<TableMeta> {
        let mut conn = self.pool.get_conn().await?;

        let rows: Vec<Row> = conn
            .exec(
                "SELECT COLUMN_NAME, COLUMN_TYPE, IS_NULLABLE, COLUMN_DEFAULT, EXTRA \
                 FROM information_schema.COLUMNS \
                 WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? \
                 ORDER BY ORDINAL_POSITION",
                (&self.database, table),
            )
            .await?;
        if rows.is_empty() {
            return Err(anyhow!("table {table} has no columns in information_schema"));
        }

        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row
                .get(0)
                .ok_or_else(|| anyhow!("missing column name for {table}"))?;
            let data_type: String = row.get(1).unwrap_or_default();
            let nullable: String = row.get(2).unwrap_or_default();
            let default: Option<String> = row.get(3).unwrap_or(None);
            let extra: String = row.get(4).unwrap_or_default();
            columns.push(ColumnMeta {
                name,
                data_type,
                nullable: nullable.eq_ignore_ascii_case("YES"),
                default,
                auto_increment: extra.to_lowercase().contains("auto_increment"),
            });
        }

        let pk_columns: Vec<String> = conn
            .exec(
                "SELECT COLUMN_NAME FROM information_schema.KEY_COLUMN_USAGE \
                 WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? AND CONSTRAINT_NAME = 'PRIMARY' \
                 ORDER BY ORDINAL_POSITION",
                (&self.database, table),
            )
            .await?;
        let primary_key = match pk_columns.len() {
            1 => Some(pk_columns.into_iter().next().unwrap_or_default()),
            0 => {
                warn!("table {table} has no primary key; resume disabled for it");
                None
            }
            n => {
                warn!("table {table} has a composite primary key ({n} columns); resume disabled for it");
                None
            }
        };

        let create_sql = self.create_table_sql(&mut conn, table).await?;

        Ok(TableMeta {
            name: table.to_string(),
            columns,
            primary_key,
            create_sql,
        })
    }

    async fn create_table_sql(&self, conn: &mut mysql_async::Conn, table: &str) -> Result<String> {
        let row: Option<Row> = conn
            .query_first(format!("SHOW CREATE TABLE `{table}`"))
            .await
            .with_context(|| format!("SHOW CREATE TABLE failed for {table}"))?;
        row.and_then(|r| r.get::<String, _>(1))
            .ok_or_else(|| anyhow!("no CREATE statement returned for {table}"))
    }

    /// Exact row count of a table at the time of the call.
    pub async fn row_count(&self, table: &str) -> Result<u64> {
        let mut conn = self.pool.get_conn().await?;
        let count: Option<u64> = conn
            .query_first(format!("SELECT COUNT(*) FROM `{table}`"))
            .await?;
        Ok(count.unwrap_or(0))
    }

    /// Ordered column names of any table, used by the binlog decoder to
    /// enrich row events (the binlog format does not carry column names).
    pub async fn column_names(&self, database: &str, table: &str) -> Result<Vec<String>> {
        let mut conn = self.pool.get_conn().await?;
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

static SCHEMA_QUALIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"`[^`]+`\.`").expect("schema qualifier pattern"));
static AUTO_INCREMENT_VALUE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"AUTO_INCREMENT=\d+").expect("auto_increment pattern"));

/// Normalize a CREATE statement before applying it to the target.
///
/// Strips any `` `db`.`table` `` schema qualifier so the statement is
/// database-neutral, and rewrites `AUTO_INCREMENT=<n>` to `AUTO_INCREMENT=1`.
/// Both rewrites leave back-ticked identifiers containing dots intact.
pub fn normalize_create_sql(create_sql: &str) -> String {
    let stripped = SCHEMA_QUALIFIER.replace_all(create_sql, "`");
    AUTO_INCREMENT_VALUE
        .replace_all(&stripped, "AUTO_INCREMENT=1")
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_schema_qualifier() {
        let sql = "CREATE TABLE `shop`.`users` (`id` int NOT NULL)";
        assert_eq!(
            normalize_create_sql(sql),
            "CREATE TABLE `users` (`id` int NOT NULL)"
        );
    }

    #[test]
    fn rewrites_auto_increment() {
        let sql = "CREATE TABLE `users` (`id` int) ENGINE=InnoDB AUTO_INCREMENT=4242 DEFAULT CHARSET=utf8mb4";
        assert_eq!(
            normalize_create_sql(sql),
            "CREATE TABLE `users` (`id` int) ENGINE=InnoDB AUTO_INCREMENT=1 DEFAULT CHARSET=utf8mb4"
        );
    }

    #[test]
    fn dotted_identifier_survives() {
        // A back-ticked identifier containing a dot is not a qualifier.
        let sql = "CREATE TABLE `weird.name` (`a.b` int)";
        assert_eq!(normalize_create_sql(sql), sql);
    }

    #[test]
    fn qualifier_and_auto_increment_together() {
        let sql = "CREATE TABLE `db`.`t` (`id` int) AUTO_INCREMENT=77";
        assert_eq!(
            normalize_create_sql(sql),
            "CREATE TABLE `t` (`id` int) AUTO_INCREMENT=1"
        );
    }

    #[test]
    fn quoted_column_list_and_pk_index() {
        let meta = TableMeta {
            name: "users".into(),
            columns: vec![
                ColumnMeta {
                    name: "id".into(),
                    data_type: "int".into(),
                    nullable: false,
                    default: None,
                    auto_increment: true,
                },
                ColumnMeta {
                    name: "name".into(),
                    data_type: "varchar(64)".into(),
                    nullable: true,
                    default: None,
                    auto_increment: false,
                },
            ],
            primary_key: Some("id".into()),
            create_sql: String::new(),
        };
        assert_eq!(meta.quoted_column_list(), "`id`, `name`");
        assert_eq!(meta.primary_key_index(), Some(0));
    }
}
