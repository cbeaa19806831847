//! PostgreSQL streamer
//!
//! Writes INSERT the chunk and fire `pg_notify` on a single well-known
//! channel with a `<stream_id>:<chunk_id>` payload. One dedicated LISTEN
//! connection per process receives every chunk notification, loads the row
//! and dispatches it to the per-stream subscribers in the hub.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tracing::{debug, error, instrument};

use world_core::{ids, Result, StreamChunk};
use world_storage::model::ChunkRow;

use crate::hub::StreamHub;
use crate::reader::{spawn_reader, ChunkFetcher};
use crate::{ChunkStream, Streamer};

/// NOTIFY channel shared by every stream
pub const CHUNK_CHANNEL: &str = "workflow_event_chunk";

/// LISTEN/NOTIFY streamer for PostgreSQL
pub struct PgStreamer {
    pool: PgPool,
    hub: StreamHub,
    fetcher: Arc<PgChunkFetcher>,
    listener_started: AtomicBool,
}

impl PgStreamer {
    pub fn new(pool: PgPool) -> Self {
        let fetcher = Arc::new(PgChunkFetcher { pool: pool.clone() });
        Self {
            pool,
            hub: StreamHub::new(),
            fetcher,
            listener_started: AtomicBool::new(false),
        }
    }

    async fn append(&self, stream_id: &str, data: &[u8], eof: bool) -> Result<StreamChunk> {
        let chunk_id = ids::new_chunk_id();

        let row = sqlx::query_as::<_, ChunkRow>(
            r#"
            INSERT INTO workflow_stream_chunks (stream_id, chunk_id, chunk_data, eof, created_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING stream_id, chunk_id, chunk_data, eof, created_at
            "#,
        )
        .bind(stream_id)
        .bind(&chunk_id)
        .bind(data)
        .bind(eof)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        // After the insert committed, so a LISTENer always finds the row.
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(CHUNK_CHANNEL)
            .bind(format!("{stream_id}:{chunk_id}"))
            .execute(&self.pool)
            .await?;

        debug!(stream = %stream_id, chunk = %chunk_id, eof, "appended chunk");
        Ok(row.into())
    }

    /// Start the shared LISTEN task on first use
    fn ensure_listener(&self) {
        if self.listener_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let pool = self.pool.clone();
        let hub = self.hub.clone();
        tokio::spawn(async move {
            let mut listener = match PgListener::connect_with(&pool).await {
                Ok(listener) => listener,
                Err(e) => {
                    error!("chunk listener failed to connect: {e}");
                    return;
                }
            };
            if let Err(e) = listener.listen(CHUNK_CHANNEL).await {
                error!("chunk listener failed to LISTEN: {e}");
                return;
            }

            loop {
                match listener.recv().await {
                    Ok(notification) => {
                        let Some((stream_id, chunk_id)) = notification.payload().split_once(':')
                        else {
                            continue;
                        };
                        if hub.subscriber_count(stream_id) == 0 {
                            continue;
                        }
                        match fetch_chunk(&pool, stream_id, chunk_id).await {
                            Ok(Some(chunk)) => {
                                hub.publish(&chunk);
                            }
                            Ok(None) => {}
                            Err(e) => error!(stream = %stream_id, "chunk load failed: {e}"),
                        }
                    }
                    Err(e) => {
                        if pool.is_closed() {
                            break;
                        }
                        // PgListener reconnects on its own; wait out the blip.
                        error!("chunk listener error: {e}");
                        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                    }
                }
            }
            debug!("chunk listener exited");
        });
    }
}

#[async_trait]
impl Streamer for PgStreamer {
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
        self.ensure_listener();
        Ok(spawn_reader(
            self.hub.clone(),
            self.fetcher.clone(),
            stream_id.to_string(),
            start_index.unwrap_or(0),
        ))
    }
}

async fn fetch_chunk(
    pool: &PgPool,
    stream_id: &str,
    chunk_id: &str,
) -> Result<Option<StreamChunk>> {
    let row = sqlx::query_as::<_, ChunkRow>(
        r#"
        SELECT stream_id, chunk_id, chunk_data, eof, created_at
        FROM workflow_stream_chunks
        WHERE stream_id = $1 AND chunk_id = $2
        "#,
    )
    .bind(stream_id)
    .bind(chunk_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(StreamChunk::from))
}

struct PgChunkFetcher {
    pool: PgPool,
}

#[async_trait]
impl ChunkFetcher for PgChunkFetcher {
    async fn fetch_after(
        &self,
        stream_id: &str,
        after: Option<&str>,
        limit: i64,
    ) -> Result<Vec<StreamChunk>> {
        let rows = sqlx::query_as::<_, ChunkRow>(
            r#"
            SELECT stream_id, chunk_id, chunk_data, eof, created_at
            FROM workflow_stream_chunks
            WHERE stream_id = $1
              AND ($2::text IS NULL OR chunk_id > $2)
            ORDER BY chunk_id ASC
            LIMIT $3
            "#,
        )
        .bind(stream_id)
        .bind(after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(StreamChunk::from).collect())
    }
}
