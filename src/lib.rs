//! mysql-sync
//!
//! A tool for replicating one MySQL database into another: a resumable full
//! snapshot followed by continuous change capture from the source's row-based
//! binary log.
//!
//! # Features
//!
//! - Full snapshot: schema and data copied table by table, in batches
//! - Resumable copies: per-table progress cursors survive restarts
//! - Incremental sync: binlog tailing decodes INSERT/UPDATE/DELETE/DDL
//! - Checkpoint gating: a durable binlog position guarantees the replayer
//!   never applies an event at or before the recorded checkpoint
//! - Two sink modes: apply changes directly, or journal them as SQL files
//!   for an asynchronous replayer
//!
//! # Pipeline
//!
//! ```text
//! source MySQL ──snapshot──▶ target MySQL
//!      │
//!      └──binlog──▶ decoder ──filter──▶ sink ──journal──▶ replayer ──▶ target
//!                                        │
//!                                        └──(direct apply)──▶ target
//! ```
//!
//! The snapshot start position is recorded in the checkpoint store *before*
//! the first row is read, so every change that happens during the snapshot is
//! replayed afterwards in binlog order.
//!
//! # CLI Usage
//!
//! ```bash
//! # Full snapshot (schema + data), recording the snapshot start position
//! mysql-sync snapshot --config config.properties
//!
//! # Tail the source binlog into a SQL journal directory
//! mysql-sync tail --config config.properties
//!
//! # Replay journaled SQL against the target, gated by the checkpoint
//! mysql-sync replay --config config.properties
//! ```

pub mod binlog;
pub mod checkpoint;
pub mod config;
pub mod journal;
pub mod metadata;
pub mod position;
pub mod progress;
pub mod replay;
pub mod snapshot;
pub mod value;

pub use binlog::{BinlogEngine, BinlogEvent, EngineState, EventFilter, EventKind, EventSink};
pub use checkpoint::CheckpointStore;
pub use config::{DatabaseConfig, MigrationConfig};
pub use journal::{JournalWriter, SqlEntry};
pub use metadata::{ColumnMeta, MetadataReader, TableMeta};
pub use position::BinlogPosition;
pub use progress::{ProgressStore, TableProgress, TableStatus};
pub use replay::Replayer;
pub use snapshot::SnapshotEngine;
pub use value::SqlValue;
