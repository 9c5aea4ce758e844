//! Binlog tail engine.
//!
//! Connects to the source as a replica and consumes its binary log on a
//! dedicated task, pushing decoded events through the filter into the sink.
//!
//! State machine:
//!
//! ```text
//! STOPPED ──start()──▶ CONNECTING ──▶ STREAMING ──stop()──▶ STOPPED
//!                                        │
//!                                        └─(disconnect / comm failure)──▶ DISCONNECTED
//! ```
//!
//! `start` is idempotent while streaming (a warning is logged); `stop` is
//! idempotent while stopped. Reconnection after DISCONNECTED is the caller's
//! responsibility.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use mysql_async::{BinlogStreamRequest, Conn, Pool};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::decoder::EventDecoder;
use super::filter::EventFilter;
use super::sink::EventSink;
use crate::checkpoint::current_source_position;
use crate::config::DatabaseConfig;
use crate::position::BinlogPosition;

/// Lifecycle state of the tail engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EngineState {
    Stopped = 0,
    Connecting = 1,
    Streaming = 2,
    Disconnected = 3,
}

impl EngineState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => EngineState::Connecting,
            2 => EngineState::Streaming,
            3 => EngineState::Disconnected,
            _ => EngineState::Stopped,
        }
    }
}

/// Connection settings for the tail engine.
#[derive(Debug, Clone)]
pub struct TailerConfig {
    pub source: DatabaseConfig,
    /// Replica server id; must be unique among the source's replicas.
    pub server_id: u32,
    /// Where to start reading. `None` starts at the source's current
    /// position.
    pub start_position: Option<BinlogPosition>,
}

impl TailerConfig {
    pub fn new(source: DatabaseConfig, start_position: Option<BinlogPosition>) -> Self {
        Self {
            source,
            // Random id in the 1M-2M range to avoid colliding with real
            // replicas or concurrent runs.
            server_id: rand::random::<u32>() % 1_000_000 + 1_000_000,
            start_position,
        }
    }
}

/// The binlog tail engine: client → decoder → filter → sink.
pub struct BinlogEngine {
    config: TailerConfig,
    filter: EventFilter,
    state: Arc<AtomicU8>,
    shutdown: Arc<Notify>,
    handle: Option<JoinHandle<()>>,
}

impl BinlogEngine {
    pub fn new(config: TailerConfig, filter: EventFilter) -> Self {
        Self {
            config,
            filter,
            state: Arc::new(AtomicU8::new(EngineState::Stopped as u8)),
            shutdown: Arc::new(Notify::new()),
            handle: None,
        }
    }

    pub fn state(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Connecting | EngineState::Streaming)
    }

    /// Start tailing into `sink` on a background task.
    ///
    /// Idempotent while already streaming: logs a warning and returns.
    pub fn start(&mut self, sink: Box<dyn EventSink>) -> Result<()> {
        if self.is_running() {
            warn!("binlog engine already running; ignoring start");
            return Ok(());
        }
        self.state
            .store(EngineState::Connecting as u8, Ordering::SeqCst);

        let config = self.config.clone();
        let filter = self.filter.clone();
        let state = Arc::clone(&self.state);
        let shutdown = Arc::clone(&self.shutdown);

        self.handle = Some(tokio::spawn(async move {
            match run_tail_loop(config, filter, sink, Arc::clone(&state), shutdown).await {
                Ok(()) => {
                    state.store(EngineState::Stopped as u8, Ordering::SeqCst);
                    info!("binlog engine stopped");
                }
                Err(e) => {
                    state.store(EngineState::Disconnected as u8, Ordering::SeqCst);
                    error!("binlog engine disconnected: {e:#}");
                }
            }
        }));
        Ok(())
    }

    /// Stop tailing and wait for the task to exit.
    ///
    /// Idempotent while stopped.
    pub async fn stop(&mut self) {
        if self.state() == EngineState::Stopped && self.handle.is_none() {
            return;
        }
        // notify_one stores a permit, so a stop that races the loop's first
        // select is not lost.
        self.shutdown.notify_one();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!("tail task join failed: {e}");
            }
        }
        // From DISCONNECTED the only in-process transition is to STOPPED.
        self.state
            .store(EngineState::Stopped as u8, Ordering::SeqCst);
    }
}

async fn run_tail_loop(
    config: TailerConfig,
    filter: EventFilter,
    mut sink: Box<dyn EventSink>,
    state: Arc<AtomicU8>,
    shutdown: Arc<Notify>,
) -> Result<()> {
    // Separate pool for information_schema lookups; the replication
    // connection itself cannot run queries once the dump starts.
    let metadata = Pool::new(config.source.opts_no_db());

    let start = match config.start_position {
        Some(position) => position,
        None => {
            let mut conn = metadata.get_conn().await?;
            current_source_position(&mut conn).await?
        }
    };
    info!(
        "connecting to binlog of {}:{} as server id {} from {start}",
        config.source.host, config.source.port, config.server_id
    );

    let conn = Conn::new(config.source.opts_no_db())
        .await
        .context("cannot connect to source for replication")?;
    let mut stream = conn
        .get_binlog_stream(
            BinlogStreamRequest::new(config.server_id)
                .with_filename(start.filename.as_bytes())
                .with_pos(start.position),
        )
        .await
        .context("cannot start binlog stream")?;

    state.store(EngineState::Streaming as u8, Ordering::SeqCst);
    info!("binlog stream established");

    let mut decoder = EventDecoder::new(metadata.clone(), start.filename.clone());
    let result = loop {
        let event = tokio::select! {
            _ = shutdown.notified() => {
                info!("binlog engine received stop signal");
                break Ok(());
            }
            event = stream.next() => event,
        };

        let raw = match event {
            Some(Ok(raw)) => raw,
            Some(Err(e)) => {
                break Err(anyhow::anyhow!("binlog communication failure: {e}"));
            }
            None => {
                break Err(anyhow::anyhow!("binlog stream closed by the source"));
            }
        };

        // Deserialization failures drop the event and keep tailing.
        let decoded = match decoder.decode(&raw, &stream).await {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("failed to decode binlog event: {e:#}; skipping");
                continue;
            }
        };
        let Some(event) = decoded else { continue };

        if !filter.should_process_event(&event.kind) {
            continue;
        }

        // Sink failures drop the event; the tail never blocks on the target.
        if let Err(e) = sink.apply(&event).await {
            error!("sink failed at {}: {e:#}; event dropped", event.position);
        }
    };

    if let Err(e) = sink.close().await {
        warn!("failed to close sink: {e:#}");
    }
    metadata.disconnect().await.ok();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_u8() {
        for state in [
            EngineState::Stopped,
            EngineState::Connecting,
            EngineState::Streaming,
            EngineState::Disconnected,
        ] {
            assert_eq!(EngineState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn server_id_lands_in_replica_range() {
        for _ in 0..100 {
            let config = TailerConfig::new(
                DatabaseConfig {
                    host: "localhost".into(),
                    port: 3306,
                    database: "shop".into(),
                    username: "repl".into(),
                    password: String::new(),
                },
                None,
            );
            assert!((1_000_000..2_000_000).contains(&config.server_id));
        }
    }

    #[tokio::test]
    async fn stop_is_idempotent_when_never_started() {
        let config = TailerConfig::new(
            DatabaseConfig {
                host: "localhost".into(),
                port: 3306,
                database: "shop".into(),
                username: "repl".into(),
                password: String::new(),
            },
            None,
        );
        let mut engine = BinlogEngine::new(config, EventFilter::default());
        assert_eq!(engine.state(), EngineState::Stopped);
        engine.stop().await;
        engine.stop().await;
        assert_eq!(engine.state(), EngineState::Stopped);
    }
}
