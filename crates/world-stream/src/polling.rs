//! Polling streamer for MySQL and SQLite
//!
//! There is no cross-process notification primitive on these back-ends, so
//! each stream with at least one local reader gets its own poll task: every
//! tick it loads chunks past the last one it saw and publishes them to the
//! hub. The task stops at EOF or when the last reader detaches. Polling is
//! also what bridges writers in other processes, at up to one tick of
//! latency.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use sqlx::{MySqlPool, SqlitePool};
use tracing::{debug, error, instrument};

use world_core::{ids, Result, StreamChunk};
use world_storage::model::ChunkRow;

use crate::hub::StreamHub;
use crate::reader::{spawn_reader, ChunkFetcher, BACKFILL_PAGE};
use crate::{ChunkStream, Streamer, StreamerConfig};

const INSERT_SQL: &str = r#"
    INSERT INTO workflow_stream_chunks (stream_id, chunk_id, chunk_data, eof, created_at)
    VALUES (?, ?, ?, ?, ?)
"#;

const FETCH_AFTER_SQL: &str = r#"
    SELECT stream_id, chunk_id, chunk_data, eof, created_at
    FROM workflow_stream_chunks
    WHERE stream_id = ?
      AND (? IS NULL OR chunk_id > ?)
    ORDER BY chunk_id ASC
    LIMIT ?
"#;

#[derive(Clone)]
enum PollPool {
    MySql(MySqlPool),
    Sqlite(SqlitePool),
}

/// Polling streamer over MySQL or SQLite
pub struct PollingStreamer {
    fetcher: Arc<PollChunkFetcher>,
    hub: StreamHub,
    config: StreamerConfig,
    pollers: Arc<DashMap<String, tokio::task::JoinHandle<()>>>,
}

impl PollingStreamer {
    pub fn mysql(pool: MySqlPool, config: StreamerConfig) -> Self {
        Self::new(PollPool::MySql(pool), config)
    }

    pub fn sqlite(pool: SqlitePool, config: StreamerConfig) -> Self {
        Self::new(PollPool::Sqlite(pool), config)
    }

    fn new(pool: PollPool, config: StreamerConfig) -> Self {
        Self {
            fetcher: Arc::new(PollChunkFetcher { pool }),
            hub: StreamHub::new(),
            config,
            pollers: Arc::new(DashMap::new()),
        }
    }

    async fn append(&self, stream_id: &str, data: &[u8], eof: bool) -> Result<StreamChunk> {
        let chunk_id = ids::new_chunk_id();
        let created_at = Utc::now();

        match &self.fetcher.pool {
            PollPool::MySql(pool) => {
                sqlx::query(INSERT_SQL)
                    .bind(stream_id)
                    .bind(&chunk_id)
                    .bind(data)
                    .bind(eof)
                    .bind(created_at)
                    .execute(pool)
                    .await?;
            }
            PollPool::Sqlite(pool) => {
                sqlx::query(INSERT_SQL)
                    .bind(stream_id)
                    .bind(&chunk_id)
                    .bind(data)
                    .bind(eof)
                    .bind(created_at)
                    .execute(pool)
                    .await?;
            }
        }

        debug!(stream = %stream_id, chunk = %chunk_id, eof, "appended chunk");
        Ok(StreamChunk {
            stream_id: stream_id.to_string(),
            chunk_id,
            chunk_data: data.to_vec(),
            eof,
            created_at,
        })
    }

    /// Spawn the stream's poll task unless one is already running
    fn ensure_poller(&self, stream_id: &str) {
        use dashmap::mapref::entry::Entry;

        // Reap a finished poller so a re-read of the stream starts a new one.
        if let Some(existing) = self.pollers.get(stream_id) {
            if !existing.is_finished() {
                return;
            }
        }
        self.pollers.remove_if(stream_id, |_, h| h.is_finished());

        match self.pollers.entry(stream_id.to_string()) {
            Entry::Occupied(_) => {}
            Entry::Vacant(entry) => {
                let handle = tokio::spawn(poll_stream(
                    Arc::clone(&self.fetcher),
                    self.hub.clone(),
                    Arc::clone(&self.pollers),
                    stream_id.to_string(),
                    self.config.poll_interval,
                ));
                entry.insert(handle);
            }
        }
    }
}

#[async_trait]
impl Streamer for PollingStreamer {
    #[instrument(skip(self, data))]
    async fn write(&self, stream_id: &str, data: &[u8]) -> Result<StreamChunk> {
        self.append(stream_id, data, false).await
    }

    #[instrument(skip(self))]
    async fn close(&self, stream_id: &str) -> Result<StreamChunk> {
        self.append(stream_id, &[], true).await
    }

    #[instrument(skip(self))]
    async fn read(&self, stream_id: &str, start_index: Option<usize>) -> Result<ChunkStream> {
        // The reader subscribes synchronously inside spawn_reader, so the
        // poll task started right after always has at least one listener.
        let stream = spawn_reader(
            self.hub.clone(),
            self.fetcher.clone(),
            stream_id.to_string(),
            start_index.unwrap_or(0),
        );
        self.ensure_poller(stream_id);
        Ok(stream)
    }
}

async fn poll_stream(
    fetcher: Arc<PollChunkFetcher>,
    hub: StreamHub,
    pollers: Arc<DashMap<String, tokio::task::JoinHandle<()>>>,
    stream_id: String,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last: Option<String> = None;

    loop {
        ticker.tick().await;

        if hub.subscriber_count(&stream_id) == 0 {
            debug!(stream = %stream_id, "last listener detached, stopping poll");
            break;
        }

        match fetcher
            .fetch_after(&stream_id, last.as_deref(), BACKFILL_PAGE)
            .await
        {
            Ok(chunks) => {
                let mut saw_eof = false;
                for chunk in chunks {
                    last = Some(chunk.chunk_id.clone());
                    saw_eof |= chunk.eof;
                    hub.publish(&chunk);
                }
                if saw_eof {
                    debug!(stream = %stream_id, "eof reached, stopping poll");
                    break;
                }
            }
            // Keep the loop alive across transient errors.
            Err(e) => error!(stream = %stream_id, "stream poll failed: {e}"),
        }
    }

    pollers.remove(&stream_id);
}

struct PollChunkFetcher {
    pool: PollPool,
}

#[async_trait]
impl ChunkFetcher for PollChunkFetcher {
    async fn fetch_after(
        &self,
        stream_id: &str,
        after: Option<&str>,
        limit: i64,
    ) -> Result<Vec<StreamChunk>> {
        let rows = match &self.pool {
            PollPool::MySql(pool) => {
                sqlx::query_as::<_, ChunkRow>(FETCH_AFTER_SQL)
                    .bind(stream_id)
                    .bind(after)
                    .bind(after)
                    .bind(limit)
                    .fetch_all(pool)
                    .await?
            }
            PollPool::Sqlite(pool) => {
                sqlx::query_as::<_, ChunkRow>(FETCH_AFTER_SQL)
                    .bind(stream_id)
                    .bind(after)
                    .bind(after)
                    .bind(limit)
                    .fetch_all(pool)
                    .await?
            }
        };
        Ok(rows.into_iter().map(StreamChunk::from).collect())
    }
}
