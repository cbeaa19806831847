//! Shared reader pump
//!
//! A reader subscribes to the hub first, then pages through the chunks
//! already in the table, then follows live notifications, deduplicating by
//! the last emitted `chunk_id` the whole way. The pump runs in its own
//! task and feeds a bounded channel; when the consumer drops the stream
//! the next send fails and the pump unwinds, dropping its subscription.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use world_core::{Result, StreamChunk};

use crate::hub::StreamHub;
use crate::ChunkStream;

pub(crate) const BACKFILL_PAGE: i64 = 100;

/// Back-end access the pump needs: chunks after a cursor, in id order
#[async_trait]
pub(crate) trait ChunkFetcher: Send + Sync + 'static {
    async fn fetch_after(
        &self,
        stream_id: &str,
        after: Option<&str>,
        limit: i64,
    ) -> Result<Vec<StreamChunk>>;
}

/// Dedup/skip state threaded through backfill and live delivery
struct ReaderState {
    last: Option<String>,
    skip: usize,
}

enum Admit {
    /// New data chunk to deliver
    Emit(StreamChunk),
    /// New chunk consumed by the start_index skip window
    Skip,
    /// Already seen (id not greater than the last emitted)
    Stale,
    /// EOF marker: terminate without delivering it
    Eof,
}

impl ReaderState {
    fn new(skip: usize) -> Self {
        Self { last: None, skip }
    }

    fn admit(&mut self, chunk: StreamChunk) -> Admit {
        if let Some(last) = &self.last {
            if chunk.chunk_id.as_str() <= last.as_str() {
                return Admit::Stale;
            }
        }
        self.last = Some(chunk.chunk_id.clone());
        if chunk.eof {
            return Admit::Eof;
        }
        if self.skip > 0 {
            self.skip -= 1;
            return Admit::Skip;
        }
        Admit::Emit(chunk)
    }
}

enum Pump {
    Continue,
    Stop,
}

/// Start a reader task and hand back its output stream
pub(crate) fn spawn_reader(
    hub: StreamHub,
    fetcher: Arc<dyn ChunkFetcher>,
    stream_id: String,
    start_index: usize,
) -> ChunkStream {
    let (tx, rx) = mpsc::channel::<Result<StreamChunk>>(64);
    // Subscribe before the backfill SELECT; anything written in between
    // shows up on both paths and the dedup drops the second copy.
    let mut live = hub.subscribe(&stream_id);

    tokio::spawn(async move {
        let mut state = ReaderState::new(start_index);

        if let Pump::Stop = drain_table(&*fetcher, &stream_id, &mut state, &tx).await {
            return;
        }

        loop {
            match live.recv().await {
                Ok(chunk) => match state.admit(chunk) {
                    Admit::Emit(chunk) => {
                        if tx.send(Ok(chunk)).await.is_err() {
                            return;
                        }
                    }
                    Admit::Skip | Admit::Stale => {}
                    Admit::Eof => return,
                },
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    // Catch up from the table; the dedup keeps the overlap
                    // from double-delivering.
                    debug!(stream = %stream_id, missed, "reader lagged, refetching");
                    if let Pump::Stop = drain_table(&*fetcher, &stream_id, &mut state, &tx).await {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    });

    ReceiverStream::new(rx)
}

/// Page through stored chunks from the current cursor. Stops the pump on
/// EOF, on a dropped consumer, or on a fetch error (which is forwarded).
async fn drain_table(
    fetcher: &dyn ChunkFetcher,
    stream_id: &str,
    state: &mut ReaderState,
    tx: &mpsc::Sender<Result<StreamChunk>>,
) -> Pump {
    loop {
        let page = match fetcher
            .fetch_after(stream_id, state.last.as_deref(), BACKFILL_PAGE)
            .await
        {
            Ok(page) => page,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return Pump::Stop;
            }
        };
        let fetched = page.len();

        for chunk in page {
            match state.admit(chunk) {
                Admit::Emit(chunk) => {
                    if tx.send(Ok(chunk)).await.is_err() {
                        return Pump::Stop;
                    }
                }
                Admit::Skip | Admit::Stale => {}
                Admit::Eof => return Pump::Stop,
            }
        }

        if fetched < BACKFILL_PAGE as usize {
            return Pump::Continue;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn chunk(chunk_id: &str, eof: bool) -> StreamChunk {
        StreamChunk {
            stream_id: "s".to_string(),
            chunk_id: chunk_id.to_string(),
            chunk_data: vec![1],
            eof,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_admit_orders_and_dedups() {
        let mut state = ReaderState::new(0);

        assert!(matches!(state.admit(chunk("chnk_02", false)), Admit::Emit(_)));
        // Same id again, and an older one: both stale.
        assert!(matches!(state.admit(chunk("chnk_02", false)), Admit::Stale));
        assert!(matches!(state.admit(chunk("chnk_01", false)), Admit::Stale));
        assert!(matches!(state.admit(chunk("chnk_03", false)), Admit::Emit(_)));
    }

    #[test]
    fn test_admit_skips_start_index_chunks() {
        let mut state = ReaderState::new(2);

        assert!(matches!(state.admit(chunk("chnk_01", false)), Admit::Skip));
        assert!(matches!(state.admit(chunk("chnk_02", false)), Admit::Skip));
        assert!(matches!(state.admit(chunk("chnk_03", false)), Admit::Emit(_)));
    }

    #[test]
    fn test_admit_eof_terminates_even_inside_skip_window() {
        let mut state = ReaderState::new(5);
        assert!(matches!(state.admit(chunk("chnk_01", true)), Admit::Eof));
    }

    #[test]
    fn test_admit_stale_eof_is_not_replayed() {
        let mut state = ReaderState::new(0);
        assert!(matches!(state.admit(chunk("chnk_05", false)), Admit::Emit(_)));
        assert!(matches!(state.admit(chunk("chnk_04", true)), Admit::Stale));
    }
}
