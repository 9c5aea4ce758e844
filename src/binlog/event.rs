//! Decoded binlog events.

use crate::position::BinlogPosition;
use crate::value::SqlValue;

/// One row image: ordered `(column name, value)` pairs.
pub type RowImage = Vec<(String, SqlValue)>;

/// A decoded binlog event, carrying the position of its event header.
#[derive(Debug, Clone)]
pub struct BinlogEvent {
    pub position: BinlogPosition,
    pub kind: EventKind,
}

/// The statement reconstructed from a binlog event.
///
/// Table-map events are consumed by the decoder to enrich later row events
/// and are never emitted downstream.
#[derive(Debug, Clone)]
pub enum EventKind {
    /// A DDL statement, forwarded verbatim. Carries only a database.
    Ddl { database: String, sql: String },
    Insert {
        database: String,
        table: String,
        rows: Vec<RowImage>,
    },
    Update {
        database: String,
        table: String,
        /// `(before, after)` image pairs, in source order.
        rows: Vec<(RowImage, RowImage)>,
    },
    Delete {
        database: String,
        table: String,
        rows: Vec<RowImage>,
    },
}

impl EventKind {
    /// The database the event belongs to.
    pub fn database(&self) -> &str {
        match self {
            EventKind::Ddl { database, .. }
            | EventKind::Insert { database, .. }
            | EventKind::Update { database, .. }
            | EventKind::Delete { database, .. } => database,
        }
    }

    /// The table the event targets; DDL events carry none.
    pub fn table(&self) -> Option<&str> {
        match self {
            EventKind::Ddl { .. } => None,
            EventKind::Insert { table, .. }
            | EventKind::Update { table, .. }
            | EventKind::Delete { table, .. } => Some(table),
        }
    }

    pub fn is_ddl(&self) -> bool {
        matches!(self, EventKind::Ddl { .. })
    }
}
