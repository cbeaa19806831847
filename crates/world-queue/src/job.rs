// Job row shared by both queue implementations

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use world_core::Result;

use crate::message::MessageData;

#[derive(Debug, Clone, FromRow)]
pub struct JobRow {
    pub id: String,
    pub queue_name: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub attempts: i32,
    pub max_attempts: i32,
    pub locked_until: Option<DateTime<Utc>>,
    pub scheduled_for: DateTime<Utc>,
    pub idempotency_key: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRow {
    /// Decode the payload envelope
    pub fn message(&self) -> Result<MessageData> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}
