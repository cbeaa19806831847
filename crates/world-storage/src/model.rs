// Row types shared by the three back-ends. JSON columns decode to
// serde_json::Value (JSONB/JSON/TEXT), timestamps to chrono, statuses as
// text parsed at the edge.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use world_core::{
    Event, Hook, Result, Run, RunStatus, Step, StepStatus, StreamChunk,
};

#[derive(Debug, Clone, FromRow)]
pub struct RunRow {
    pub run_id: String,
    pub deployment_id: String,
    pub workflow_name: String,
    pub status: String,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub execution_context: Option<serde_json::Value>,
    pub error: Option<String>,
    pub error_code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunRow {
    pub fn into_run(self) -> Result<Run> {
        Ok(Run {
            status: RunStatus::parse(&self.status)?,
            run_id: self.run_id,
            deployment_id: self.deployment_id,
            workflow_name: self.workflow_name,
            input: self.input,
            output: self.output,
            execution_context: self.execution_context,
            error: self.error,
            error_code: self.error_code,
            created_at: self.created_at,
            updated_at: self.updated_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct StepRow {
    pub step_id: String,
    pub run_id: String,
    pub step_name: String,
    pub status: String,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub error_code: Option<String>,
    pub attempt: i32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StepRow {
    pub fn into_step(self) -> Result<Step> {
        Ok(Step {
            status: StepStatus::parse(&self.status)?,
            step_id: self.step_id,
            run_id: self.run_id,
            step_name: self.step_name,
            input: self.input,
            output: self.output,
            error: self.error,
            error_code: self.error_code,
            attempt: self.attempt,
            started_at: self.started_at,
            completed_at: self.completed_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct EventRow {
    pub event_id: String,
    pub run_id: String,
    pub event_type: String,
    pub correlation_id: Option<String>,
    pub event_data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl From<EventRow> for Event {
    fn from(row: EventRow) -> Self {
        Event {
            event_id: row.event_id,
            run_id: row.run_id,
            event_type: row.event_type,
            correlation_id: row.correlation_id,
            event_data: row.event_data,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct HookRow {
    pub hook_id: String,
    pub run_id: String,
    pub token: String,
    pub owner_id: String,
    pub project_id: String,
    pub environment: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl From<HookRow> for Hook {
    fn from(row: HookRow) -> Self {
        Hook {
            hook_id: row.hook_id,
            run_id: row.run_id,
            token: row.token,
            owner_id: row.owner_id,
            project_id: row.project_id,
            environment: row.environment,
            metadata: row.metadata,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct ChunkRow {
    pub stream_id: String,
    pub chunk_id: String,
    pub chunk_data: Vec<u8>,
    pub eof: bool,
    pub created_at: DateTime<Utc>,
}

impl From<ChunkRow> for StreamChunk {
    fn from(row: ChunkRow) -> Self {
        StreamChunk {
            stream_id: row.stream_id,
            chunk_id: row.chunk_id,
            chunk_data: row.chunk_data,
            eof: row.eof,
            created_at: row.created_at,
        }
    }
}
