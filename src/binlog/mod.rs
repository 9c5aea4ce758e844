//! Binlog engine: client → decoder → filter → sink.
//!
//! The [`BinlogEngine`] connects to the source as a replica and streams raw
//! replication events. The [`EventDecoder`] turns them into [`BinlogEvent`]s
//! enriched with column names, the [`EventFilter`] applies the configured
//! database/table allow-lists, and an [`EventSink`] either applies each
//! event to the target directly or journals it for the replayer.

mod client;
mod decoder;
mod event;
mod filter;
mod sink;

pub use client::{BinlogEngine, EngineState, TailerConfig};
pub use decoder::EventDecoder;
pub use event::{BinlogEvent, EventKind, RowImage};
pub use filter::EventFilter;
pub use sink::{render_statements, DirectApplySink, EventSink, JournalSink};
