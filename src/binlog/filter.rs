//! Event filtering by database/table allow-lists.

use std::collections::HashSet;

use super::event::EventKind;

/// Databases whose DDL is never forwarded.
const SYSTEM_SCHEMAS: &[&str] = &["mysql.", "information_schema.", "performance_schema."];

/// Configurable allow-list predicate over decoded events.
///
/// An empty include-set admits everything. A table entry matches either as
/// `db.table` or as a bare `table` name.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    included_databases: HashSet<String>,
    included_tables: HashSet<String>,
}

impl EventFilter {
    pub fn new(included_databases: HashSet<String>, included_tables: HashSet<String>) -> Self {
        Self {
            included_databases,
            included_tables,
        }
    }

    /// Should a DML event for `db`.`table` be processed?
    pub fn should_process(&self, database: &str, table: &str) -> bool {
        self.database_included(database) && self.table_included(database, table)
    }

    /// Should the whole event be processed?
    ///
    /// DML events are matched against the allow-lists. DDL events carry only
    /// a database; they pass iff the database is included, the statement is
    /// not transaction control, and it does not touch a system schema.
    pub fn should_process_event(&self, kind: &EventKind) -> bool {
        match kind {
            EventKind::Ddl { database, sql } => {
                self.database_included(database) && !is_skippable_ddl(sql)
            }
            _ => match kind.table() {
                Some(table) => self.should_process(kind.database(), table),
                None => false,
            },
        }
    }

    fn database_included(&self, database: &str) -> bool {
        if database.is_empty() {
            return false;
        }
        self.included_databases.is_empty() || self.included_databases.contains(database)
    }

    fn table_included(&self, database: &str, table: &str) -> bool {
        if table.is_empty() {
            return false;
        }
        if self.included_tables.is_empty() {
            return true;
        }
        self.included_tables.contains(table)
            || self.included_tables.contains(&format!("{database}.{table}"))
    }
}

/// Transaction-control statements and system-schema DDL are always dropped.
fn is_skippable_ddl(sql: &str) -> bool {
    let upper = sql.trim().to_uppercase();
    if upper.is_empty() {
        return true;
    }
    if upper == "BEGIN" || upper == "COMMIT" || upper == "ROLLBACK" {
        return true;
    }
    SYSTEM_SCHEMAS
        .iter()
        .any(|schema| upper.contains(&schema.to_uppercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> HashSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn ddl(database: &str, sql: &str) -> EventKind {
        EventKind::Ddl {
            database: database.into(),
            sql: sql.into(),
        }
    }

    fn insert(database: &str, table: &str) -> EventKind {
        EventKind::Insert {
            database: database.into(),
            table: table.into(),
            rows: Vec::new(),
        }
    }

    #[test]
    fn empty_filter_admits_everything() {
        let filter = EventFilter::default();
        assert!(filter.should_process("shop", "users"));
        assert!(filter.should_process_event(&insert("any", "thing")));
    }

    #[test]
    fn database_allow_list() {
        let filter = EventFilter::new(set(&["shop"]), HashSet::new());
        assert!(filter.should_process("shop", "users"));
        assert!(!filter.should_process("crm", "users"));
    }

    #[test]
    fn table_matches_bare_or_qualified() {
        let filter = EventFilter::new(HashSet::new(), set(&["users", "shop.orders"]));
        assert!(filter.should_process("shop", "users"));
        assert!(filter.should_process("crm", "users"));
        assert!(filter.should_process("shop", "orders"));
        assert!(!filter.should_process("crm", "orders"));
        assert!(!filter.should_process("shop", "payments"));
    }

    #[test]
    fn excluded_table_event_dropped() {
        let filter = EventFilter::new(HashSet::new(), set(&["users"]));
        assert!(!filter.should_process_event(&insert("shop", "orders")));
        assert!(filter.should_process_event(&insert("shop", "users")));
    }

    #[test]
    fn ddl_passes_on_database_only() {
        let filter = EventFilter::new(set(&["shop"]), set(&["users"]));
        assert!(filter.should_process_event(&ddl("shop", "ALTER TABLE users ADD COLUMN age INT")));
        assert!(!filter.should_process_event(&ddl("crm", "ALTER TABLE users ADD COLUMN age INT")));
    }

    #[test]
    fn transaction_control_always_dropped() {
        let filter = EventFilter::default();
        assert!(!filter.should_process_event(&ddl("shop", "BEGIN")));
        assert!(!filter.should_process_event(&ddl("shop", "commit")));
        assert!(!filter.should_process_event(&ddl("shop", "ROLLBACK")));
    }

    #[test]
    fn system_schema_ddl_always_dropped() {
        let filter = EventFilter::default();
        assert!(!filter.should_process_event(&ddl("mysql", "UPDATE mysql.user SET x = 1")));
        assert!(!filter
            .should_process_event(&ddl("shop", "DROP TABLE information_schema.tables")));
    }

    #[test]
    fn empty_database_never_passes() {
        let filter = EventFilter::default();
        assert!(!filter.should_process("", "users"));
        assert!(!filter.should_process_event(&ddl("", "CREATE TABLE t (id INT)")));
    }
}
