//! Store traits for the four persisted entities
//!
//! One implementation per back-end; the facade picks the implementation
//! once at construction and hands out trait objects. Every write returns
//! the post-write row. Missing rows surface as `NotFound`, duplicate
//! primary keys as `Conflict`, and driver errors pass through unchanged.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use world_core::{
    CreateEvent, CreateHook, CreateRun, CreateStep, Event, Hook, ListEventsParams, ListParams,
    ListRunsParams, Page, Result, Run, RunStatus, Step, StepStatus, UpdateRun, UpdateStep,
    DEFAULT_PAGE_LIMIT,
};

/// CRUD over workflow runs, with the run state machine enforced on update
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Insert a new run with status `pending`
    async fn create(&self, data: CreateRun) -> Result<Run>;

    async fn get(&self, run_id: &str) -> Result<Run>;

    /// Apply a patch; stamps `started_at` on the first transition to
    /// running and `completed_at` on the first terminal transition
    async fn update(&self, run_id: &str, patch: UpdateRun) -> Result<Run>;

    /// Cancel from any non-terminal state; a no-op on already-terminal runs
    async fn cancel(&self, run_id: &str) -> Result<Run>;

    /// Pause a running run; pausing an already-paused run is a no-op
    async fn pause(&self, run_id: &str) -> Result<Run>;

    /// Resume a paused run; any other state is "paused run not found"
    async fn resume(&self, run_id: &str) -> Result<Run>;

    /// Page descending by `run_id` (newest first)
    async fn list(&self, params: ListRunsParams) -> Result<Page<Run>>;
}

/// CRUD over step attempts
#[async_trait]
pub trait StepStore: Send + Sync {
    /// Idempotent by `step_id`: re-creating an existing step returns it
    async fn create(&self, data: CreateStep) -> Result<Step>;

    async fn get(&self, step_id: &str) -> Result<Step>;

    /// Same `started_at`/`completed_at` stamping rules as runs
    async fn update(&self, step_id: &str, patch: UpdateStep) -> Result<Step>;

    /// Page a run's steps ascending by `step_id`
    async fn list(&self, run_id: &str, params: ListParams) -> Result<Page<Step>>;
}

/// Append-only event log
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn create(&self, data: CreateEvent) -> Result<Event>;

    async fn list(&self, run_id: &str, params: ListEventsParams) -> Result<Page<Event>>;

    async fn list_by_correlation_id(
        &self,
        correlation_id: &str,
        params: ListEventsParams,
    ) -> Result<Page<Event>>;
}

/// External-callback registrations addressed by an opaque token
#[async_trait]
pub trait HookStore: Send + Sync {
    async fn create(&self, data: CreateHook) -> Result<Hook>;

    async fn get(&self, hook_id: &str) -> Result<Hook>;

    async fn get_by_token(&self, token: &str) -> Result<Hook>;

    /// Remove the hook and return the prior row
    async fn dispose(&self, hook_id: &str) -> Result<Hook>;
}

// =============================================================================
// Shared helpers
// =============================================================================

/// Timestamps to stamp alongside a status patch. `None` leaves the stored
/// value untouched (bound through COALESCE), so both are set at most once
/// over a row's lifetime.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct TransitionTimes {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

pub(crate) fn run_transition_times(
    current_started_at: Option<DateTime<Utc>>,
    current_completed_at: Option<DateTime<Utc>>,
    new_status: Option<RunStatus>,
    now: DateTime<Utc>,
) -> TransitionTimes {
    let mut times = TransitionTimes::default();
    if let Some(status) = new_status {
        if status == RunStatus::Running && current_started_at.is_none() {
            times.started_at = Some(now);
        }
        if status.is_terminal() && current_completed_at.is_none() {
            times.completed_at = Some(now);
        }
    }
    times
}

pub(crate) fn step_transition_times(
    current_started_at: Option<DateTime<Utc>>,
    current_completed_at: Option<DateTime<Utc>>,
    new_status: Option<StepStatus>,
    now: DateTime<Utc>,
) -> TransitionTimes {
    let mut times = TransitionTimes::default();
    if let Some(status) = new_status {
        if status == StepStatus::Running && current_started_at.is_none() {
            times.started_at = Some(now);
        }
        if status.is_terminal() && current_completed_at.is_none() {
            times.completed_at = Some(now);
        }
    }
    times
}

/// Effective page size: requested limit or the default, floored at 1
pub(crate) fn effective_limit(limit: Option<u32>) -> usize {
    limit.unwrap_or(DEFAULT_PAGE_LIMIT).max(1) as usize
}
