//! Entity types stored by the substrate
//!
//! Runs own their steps, events and hooks logically by `run_id`; there are
//! no database-level foreign keys and rows are never deleted (hooks being
//! the one disposable exception).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, WorldError};

// =============================================================================
// Statuses
// =============================================================================

/// Lifecycle status of a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Terminal states can never be left; `completed_at` is stamped on entry
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(WorldError::Decode(format!("unknown run status: {other}"))),
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a step attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(WorldError::Decode(format!("unknown step status: {other}"))),
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a queued job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(WorldError::Decode(format!("unknown job status: {other}"))),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Entities
// =============================================================================

/// An execution of a named workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub deployment_id: String,
    pub workflow_name: String,
    pub status: RunStatus,
    /// Workflow arguments (JSON array)
    pub input: serde_json::Value,
    /// Workflow result (JSON array), present once the run completed
    pub output: Option<serde_json::Value>,
    pub execution_context: Option<serde_json::Value>,
    pub error: Option<String>,
    pub error_code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Stamped exactly once, on the first transition to running
    pub started_at: Option<DateTime<Utc>>,
    /// Stamped on the first transition to a terminal state, never cleared
    pub completed_at: Option<DateTime<Utc>>,
}

/// One attempt of a named step inside a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub run_id: String,
    pub step_id: String,
    pub step_name: String,
    pub status: StepStatus,
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

/// An append-only log entry used for deterministic replay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub run_id: String,
    pub event_type: String,
    pub correlation_id: Option<String>,
    pub event_data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A persisted external-callback registration, addressed by an opaque token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hook {
    pub hook_id: String,
    pub run_id: String,
    pub token: String,
    pub owner_id: String,
    pub project_id: String,
    pub environment: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// One segment of an append-only byte stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub stream_id: String,
    pub chunk_id: String,
    pub chunk_data: Vec<u8>,
    pub eof: bool,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Create / update parameters
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct CreateRun {
    pub deployment_id: String,
    pub workflow_name: String,
    pub input: serde_json::Value,
    pub execution_context: Option<serde_json::Value>,
}

/// Patch applied by `RunStore::update`; unset fields keep their value
#[derive(Debug, Clone, Default)]
pub struct UpdateRun {
    pub status: Option<RunStatus>,
    pub output: Option<serde_json::Value>,
    pub execution_context: Option<serde_json::Value>,
    pub error: Option<String>,
    pub error_code: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CreateStep {
    pub run_id: String,
    /// Caller-supplied for deterministic replay; minted when absent
    pub step_id: Option<String>,
    pub step_name: String,
    pub input: serde_json::Value,
    pub attempt: Option<i32>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateStep {
    pub status: Option<StepStatus>,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub error_code: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CreateEvent {
    pub run_id: String,
    pub event_type: String,
    pub correlation_id: Option<String>,
    pub event_data: serde_json::Value,
}

#[derive(Debug, Clone, Default)]
pub struct CreateHook {
    /// Caller-supplied hook id; minted when absent
    pub hook_id: Option<String>,
    pub run_id: String,
    pub token: String,
    pub owner_id: String,
    pub project_id: String,
    pub environment: String,
    pub metadata: Option<serde_json::Value>,
}

// =============================================================================
// Pagination
// =============================================================================

/// Sort direction for listings; ids are time-prefixed so this is
/// chronological order as well
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Cursor pagination over an id-ordered listing
#[derive(Debug, Clone, Default)]
pub struct ListParams {
    pub limit: Option<u32>,
    /// Last id seen on the previous page
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ListRunsParams {
    pub workflow_name: Option<String>,
    pub status: Option<RunStatus>,
    pub limit: Option<u32>,
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ListEventsParams {
    pub limit: Option<u32>,
    pub cursor: Option<String>,
    pub sort_order: SortOrder,
}

pub const DEFAULT_PAGE_LIMIT: u32 = 100;

/// One page of an id-ordered listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Pass back as the next request's cursor; `None` on the last page
    pub cursor: Option<String>,
    pub has_more: bool,
}

impl<T> Page<T> {
    /// Build a page from `limit + 1` fetched rows, extracting the cursor
    /// from the last retained row
    pub fn from_rows(mut rows: Vec<T>, limit: usize, id_of: impl Fn(&T) -> String) -> Self {
        let has_more = rows.len() > limit;
        rows.truncate(limit);
        let cursor = if has_more {
            rows.last().map(&id_of)
        } else {
            None
        };
        Page {
            items: rows,
            cursor,
            has_more,
        }
    }
}

// =============================================================================
// Tenant identity
// =============================================================================

/// Tenant identity resolved by the auth provider and stamped onto hooks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthContext {
    pub environment: String,
    pub owner_id: String,
    pub project_id: String,
}

impl Default for AuthContext {
    fn default() -> Self {
        Self {
            environment: "default".to_string(),
            owner_id: String::new(),
            project_id: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_roundtrip() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Paused,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            assert_eq!(RunStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(RunStatus::parse("bogus").is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Paused.is_terminal());
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }

    #[test]
    fn test_step_status_roundtrip() {
        for status in [
            StepStatus::Pending,
            StepStatus::Running,
            StepStatus::Completed,
            StepStatus::Failed,
        ] {
            assert_eq!(StepStatus::parse(status.as_str()).unwrap(), status);
        }
    }

    #[test]
    fn test_page_from_rows_with_more() {
        let rows: Vec<String> = (0..11).map(|i| format!("id_{i:02}")).collect();
        let page = Page::from_rows(rows, 10, |r| r.clone());
        assert_eq!(page.items.len(), 10);
        assert!(page.has_more);
        assert_eq!(page.cursor.as_deref(), Some("id_09"));
    }

    #[test]
    fn test_page_from_rows_last_page() {
        let rows: Vec<String> = (0..5).map(|i| format!("id_{i}")).collect();
        let page = Page::from_rows(rows, 10, |r| r.clone());
        assert_eq!(page.items.len(), 5);
        assert!(!page.has_more);
        assert!(page.cursor.is_none());
    }

    #[test]
    fn test_status_serde_snake_case() {
        let json = serde_json::to_string(&RunStatus::Cancelled).unwrap();
        assert_eq!(json, "\"cancelled\"");
        let back: RunStatus = serde_json::from_str("\"running\"").unwrap();
        assert_eq!(back, RunStatus::Running);
    }
}
