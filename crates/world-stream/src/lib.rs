//! Append-only chunked byte streams with ordered, live delivery
//!
//! Producers append chunks and eventually an EOF marker; readers get every
//! chunk in `chunk_id` order, exactly once, then termination. PostgreSQL
//! delivers live chunks over LISTEN/NOTIFY; MySQL and SQLite poll the
//! table. Either way the in-process hub is what fans chunks out to the
//! readers attached in this process.

pub mod hub;
pub mod polling;
pub mod postgres;
mod reader;

use std::time::Duration;

use async_trait::async_trait;
use tokio_stream::wrappers::ReceiverStream;

use world_core::{Result, StreamChunk};

pub use hub::StreamHub;
pub use polling::PollingStreamer;
pub use postgres::PgStreamer;

/// Ordered, finite, non-restartable chunk delivery. Dropping the stream
/// cancels the reader and releases its resources.
pub type ChunkStream = ReceiverStream<Result<StreamChunk>>;

/// Byte-stream store with live delivery
#[async_trait]
pub trait Streamer: Send + Sync {
    /// Append a chunk of bytes to the stream
    async fn write(&self, stream_id: &str, data: &[u8]) -> Result<StreamChunk>;

    /// Append the EOF marker; readers terminate when they reach it
    async fn close(&self, stream_id: &str) -> Result<StreamChunk>;

    /// Read the stream from the beginning, skipping the first
    /// `start_index` logical chunks. Existing chunks are delivered first,
    /// then live ones, until EOF.
    async fn read(&self, stream_id: &str, start_index: Option<usize>) -> Result<ChunkStream>;
}

/// Streamer timing knobs
#[derive(Debug, Clone)]
pub struct StreamerConfig {
    /// Poll tick for back-ends without a notification primitive
    pub poll_interval: Duration,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
        }
    }
}

impl StreamerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}
