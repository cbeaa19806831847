//! Process-local chunk notifier
//!
//! One broadcast channel per stream id, created on first subscribe and
//! removed once the last receiver is gone. Only the streamer publishes;
//! readers subscribe before their backfill SELECT so nothing written in
//! between is lost.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;

use world_core::StreamChunk;

const CHANNEL_CAPACITY: usize = 256;

/// Fan-out registry keyed by stream id
#[derive(Clone, Default)]
pub struct StreamHub {
    channels: Arc<DashMap<String, broadcast::Sender<StreamChunk>>>,
}

impl StreamHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to live chunks for a stream
    pub fn subscribe(&self, stream_id: &str) -> broadcast::Receiver<StreamChunk> {
        self.channels
            .entry(stream_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Deliver a chunk to the stream's subscribers; returns how many
    /// received it
    pub fn publish(&self, chunk: &StreamChunk) -> usize {
        let Some(sender) = self.channels.get(&chunk.stream_id) else {
            return 0;
        };
        match sender.send(chunk.clone()) {
            Ok(count) => count,
            Err(_) => {
                // Last receiver is gone; drop the entry.
                let stream_id = chunk.stream_id.clone();
                drop(sender);
                self.channels
                    .remove_if(&stream_id, |_, s| s.receiver_count() == 0);
                0
            }
        }
    }

    /// Number of live subscribers for a stream
    pub fn subscriber_count(&self, stream_id: &str) -> usize {
        self.channels
            .get(stream_id)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn chunk(stream_id: &str, chunk_id: &str) -> StreamChunk {
        StreamChunk {
            stream_id: stream_id.to_string(),
            chunk_id: chunk_id.to_string(),
            chunk_data: b"data".to_vec(),
            eof: false,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_subscribe_then_publish() {
        let hub = StreamHub::new();
        let mut rx = hub.subscribe("s1");

        assert_eq!(hub.publish(&chunk("s1", "chnk_1")), 1);
        let received = rx.recv().await.unwrap();
        assert_eq!(received.chunk_id, "chnk_1");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let hub = StreamHub::new();
        assert_eq!(hub.publish(&chunk("nobody", "chnk_1")), 0);
        assert_eq!(hub.subscriber_count("nobody"), 0);
    }

    #[tokio::test]
    async fn test_streams_are_isolated() {
        let hub = StreamHub::new();
        let mut rx_a = hub.subscribe("a");
        let _rx_b = hub.subscribe("b");

        hub.publish(&chunk("b", "chnk_1"));
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_entry_removed_after_last_receiver_drops() {
        let hub = StreamHub::new();
        let rx = hub.subscribe("s1");
        assert_eq!(hub.subscriber_count("s1"), 1);

        drop(rx);
        hub.publish(&chunk("s1", "chnk_1"));
        assert_eq!(hub.subscriber_count("s1"), 0);
    }
}
