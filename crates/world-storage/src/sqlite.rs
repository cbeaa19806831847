//! SQLite storage
//!
//! SQLite has supported `RETURNING` since 3.35, so writes follow the same
//! single-statement shape as postgres. Numbered `?N` parameters let one
//! bind feed both sides of the null-guard filters.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use tracing::{debug, instrument};

use world_core::{
    ids, CreateEvent, CreateHook, CreateRun, CreateStep, Event, Hook, ListEventsParams,
    ListParams, ListRunsParams, Page, Result, Run, SortOrder, Step, UpdateRun, UpdateStep,
    WorldError,
};

use crate::model::{EventRow, HookRow, RunRow, StepRow};
use crate::store::{
    effective_limit, run_transition_times, step_transition_times, EventStore, HookStore,
    RunStore, StepStore,
};

/// SQLite implementation of the four entity stores
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn fetch_run(&self, run_id: &str) -> Result<Option<RunRow>> {
        let row = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT run_id, deployment_id, workflow_name, status, input, output,
                   execution_context, error, error_code, created_at, updated_at,
                   started_at, completed_at
            FROM workflow_runs
            WHERE run_id = ?1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn fetch_step(&self, step_id: &str) -> Result<Option<StepRow>> {
        let row = sqlx::query_as::<_, StepRow>(
            r#"
            SELECT step_id, run_id, step_name, status, input, output, error,
                   error_code, attempt, started_at, completed_at, created_at, updated_at
            FROM workflow_steps
            WHERE step_id = ?1
            "#,
        )
        .bind(step_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}

#[async_trait]
impl RunStore for SqliteStorage {
    #[instrument(skip(self, data), fields(workflow_name = %data.workflow_name))]
    async fn create(&self, data: CreateRun) -> Result<Run> {
        let run_id = ids::new_run_id();
        let now = Utc::now();

        let row = sqlx::query_as::<_, RunRow>(
            r#"
            INSERT INTO workflow_runs
                (run_id, deployment_id, workflow_name, status, input, execution_context,
                 created_at, updated_at)
            VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?6, ?6)
            RETURNING run_id, deployment_id, workflow_name, status, input, output,
                      execution_context, error, error_code, created_at, updated_at,
                      started_at, completed_at
            "#,
        )
        .bind(&run_id)
        .bind(&data.deployment_id)
        .bind(&data.workflow_name)
        .bind(&data.input)
        .bind(&data.execution_context)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_duplicate(e, "run", &run_id))?;

        debug!(%run_id, "created run");
        row.into_run()
    }

    #[instrument(skip(self))]
    async fn get(&self, run_id: &str) -> Result<Run> {
        self.fetch_run(run_id)
            .await?
            .ok_or_else(|| WorldError::not_found("run", run_id))?
            .into_run()
    }

    #[instrument(skip(self, patch))]
    async fn update(&self, run_id: &str, patch: UpdateRun) -> Result<Run> {
        let current = self
            .fetch_run(run_id)
            .await?
            .ok_or_else(|| WorldError::not_found("run", run_id))?;

        let now = Utc::now();
        let times = run_transition_times(current.started_at, current.completed_at, patch.status, now);

        let row = sqlx::query_as::<_, RunRow>(
            r#"
            UPDATE workflow_runs
            SET status = COALESCE(?2, status),
                output = COALESCE(?3, output),
                execution_context = COALESCE(?4, execution_context),
                error = COALESCE(?5, error),
                error_code = COALESCE(?6, error_code),
                started_at = COALESCE(?7, started_at),
                completed_at = COALESCE(?8, completed_at),
                updated_at = ?9
            WHERE run_id = ?1
            RETURNING run_id, deployment_id, workflow_name, status, input, output,
                      execution_context, error, error_code, created_at, updated_at,
                      started_at, completed_at
            "#,
        )
        .bind(run_id)
        .bind(patch.status.map(|s| s.as_str()))
        .bind(&patch.output)
        .bind(&patch.execution_context)
        .bind(&patch.error)
        .bind(&patch.error_code)
        .bind(times.started_at)
        .bind(times.completed_at)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| WorldError::not_found("run", run_id))?;

        debug!(%run_id, status = ?patch.status, "updated run");
        row.into_run()
    }

    #[instrument(skip(self))]
    async fn cancel(&self, run_id: &str) -> Result<Run> {
        let now = Utc::now();
        let row = sqlx::query_as::<_, RunRow>(
            r#"
            UPDATE workflow_runs
            SET status = 'cancelled',
                completed_at = COALESCE(completed_at, ?2),
                updated_at = ?2
            WHERE run_id = ?1
              AND status NOT IN ('completed', 'failed', 'cancelled')
            RETURNING run_id, deployment_id, workflow_name, status, input, output,
                      execution_context, error, error_code, created_at, updated_at,
                      started_at, completed_at
            "#,
        )
        .bind(run_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                debug!(%run_id, "cancelled run");
                row.into_run()
            }
            None => RunStore::get(self, run_id).await,
        }
    }

    #[instrument(skip(self))]
    async fn pause(&self, run_id: &str) -> Result<Run> {
        // Only a running run can pause; pausing a paused run is a no-op
        // update. Everything else never entered the running leg of the
        // state machine and is rejected.
        let row = sqlx::query_as::<_, RunRow>(
            r#"
            UPDATE workflow_runs
            SET status = 'paused', updated_at = ?2
            WHERE run_id = ?1
              AND status IN ('running', 'paused')
            RETURNING run_id, deployment_id, workflow_name, status, input, output,
                      execution_context, error, error_code, created_at, updated_at,
                      started_at, completed_at
            "#,
        )
        .bind(run_id)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.into_run(),
            None => match self.fetch_run(run_id).await? {
                Some(_) => Err(WorldError::not_found("active run", run_id)),
                None => Err(WorldError::not_found("run", run_id)),
            },
        }
    }

    #[instrument(skip(self))]
    async fn resume(&self, run_id: &str) -> Result<Run> {
        let row = sqlx::query_as::<_, RunRow>(
            r#"
            UPDATE workflow_runs
            SET status = 'running', updated_at = ?2
            WHERE run_id = ?1 AND status = 'paused'
            RETURNING run_id, deployment_id, workflow_name, status, input, output,
                      execution_context, error, error_code, created_at, updated_at,
                      started_at, completed_at
            "#,
        )
        .bind(run_id)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| WorldError::not_found("paused run", run_id))?;

        row.into_run()
    }

    #[instrument(skip(self, params))]
    async fn list(&self, params: ListRunsParams) -> Result<Page<Run>> {
        let limit = effective_limit(params.limit);
        let rows = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT run_id, deployment_id, workflow_name, status, input, output,
                   execution_context, error, error_code, created_at, updated_at,
                   started_at, completed_at
            FROM workflow_runs
            WHERE (?1 IS NULL OR workflow_name = ?1)
              AND (?2 IS NULL OR status = ?2)
              AND (?3 IS NULL OR run_id < ?3)
            ORDER BY run_id DESC
            LIMIT ?4
            "#,
        )
        .bind(&params.workflow_name)
        .bind(params.status.map(|s| s.as_str()))
        .bind(&params.cursor)
        .bind((limit + 1) as i64)
        .fetch_all(&self.pool)
        .await?;

        let runs = rows
            .into_iter()
            .map(RunRow::into_run)
            .collect::<Result<Vec<_>>>()?;
        Ok(Page::from_rows(runs, limit, |r| r.run_id.clone()))
    }
}

#[async_trait]
impl StepStore for SqliteStorage {
    #[instrument(skip(self, data), fields(run_id = %data.run_id, step_name = %data.step_name))]
    async fn create(&self, data: CreateStep) -> Result<Step> {
        let step_id = data.step_id.unwrap_or_else(ids::new_step_id);
        let now = Utc::now();

        let row = sqlx::query_as::<_, StepRow>(
            r#"
            INSERT INTO workflow_steps
                (step_id, run_id, step_name, status, input, attempt, created_at, updated_at)
            VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?6, ?6)
            ON CONFLICT (step_id) DO NOTHING
            RETURNING step_id, run_id, step_name, status, input, output, error,
                      error_code, attempt, started_at, completed_at, created_at, updated_at
            "#,
        )
        .bind(&step_id)
        .bind(&data.run_id)
        .bind(&data.step_name)
        .bind(&data.input)
        .bind(data.attempt.unwrap_or(1))
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                debug!(%step_id, "created step");
                row.into_step()
            }
            None => match self.fetch_step(&step_id).await? {
                Some(existing) => existing.into_step(),
                None => Err(WorldError::conflict("step", step_id)),
            },
        }
    }

    #[instrument(skip(self))]
    async fn get(&self, step_id: &str) -> Result<Step> {
        self.fetch_step(step_id)
            .await?
            .ok_or_else(|| WorldError::not_found("step", step_id))?
            .into_step()
    }

    #[instrument(skip(self, patch))]
    async fn update(&self, step_id: &str, patch: UpdateStep) -> Result<Step> {
        let current = self
            .fetch_step(step_id)
            .await?
            .ok_or_else(|| WorldError::not_found("step", step_id))?;

        let now = Utc::now();
        let times =
            step_transition_times(current.started_at, current.completed_at, patch.status, now);

        let row = sqlx::query_as::<_, StepRow>(
            r#"
            UPDATE workflow_steps
            SET status = COALESCE(?2, status),
                output = COALESCE(?3, output),
                error = COALESCE(?4, error),
                error_code = COALESCE(?5, error_code),
                started_at = COALESCE(?6, started_at),
                completed_at = COALESCE(?7, completed_at),
                updated_at = ?8
            WHERE step_id = ?1
            RETURNING step_id, run_id, step_name, status, input, output, error,
                      error_code, attempt, started_at, completed_at, created_at, updated_at
            "#,
        )
        .bind(step_id)
        .bind(patch.status.map(|s| s.as_str()))
        .bind(&patch.output)
        .bind(&patch.error)
        .bind(&patch.error_code)
        .bind(times.started_at)
        .bind(times.completed_at)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| WorldError::not_found("step", step_id))?;

        row.into_step()
    }

    #[instrument(skip(self, params))]
    async fn list(&self, run_id: &str, params: ListParams) -> Result<Page<Step>> {
        let limit = effective_limit(params.limit);
        let rows = sqlx::query_as::<_, StepRow>(
            r#"
            SELECT step_id, run_id, step_name, status, input, output, error,
                   error_code, attempt, started_at, completed_at, created_at, updated_at
            FROM workflow_steps
            WHERE run_id = ?1
              AND (?2 IS NULL OR step_id > ?2)
            ORDER BY step_id ASC
            LIMIT ?3
            "#,
        )
        .bind(run_id)
        .bind(&params.cursor)
        .bind((limit + 1) as i64)
        .fetch_all(&self.pool)
        .await?;

        let steps = rows
            .into_iter()
            .map(StepRow::into_step)
            .collect::<Result<Vec<_>>>()?;
        Ok(Page::from_rows(steps, limit, |s| s.step_id.clone()))
    }
}

#[async_trait]
impl EventStore for SqliteStorage {
    #[instrument(skip(self, data), fields(run_id = %data.run_id, event_type = %data.event_type))]
    async fn create(&self, data: CreateEvent) -> Result<Event> {
        let event_id = ids::new_event_id();

        let row = sqlx::query_as::<_, EventRow>(
            r#"
            INSERT INTO workflow_events
                (event_id, run_id, event_type, correlation_id, event_data, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            RETURNING event_id, run_id, event_type, correlation_id, event_data, created_at
            "#,
        )
        .bind(&event_id)
        .bind(&data.run_id)
        .bind(&data.event_type)
        .bind(&data.correlation_id)
        .bind(&data.event_data)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_duplicate(e, "event", &event_id))?;

        Ok(row.into())
    }

    #[instrument(skip(self, params))]
    async fn list(&self, run_id: &str, params: ListEventsParams) -> Result<Page<Event>> {
        let limit = effective_limit(params.limit);
        let sql = match params.sort_order {
            SortOrder::Asc => {
                r#"
                SELECT event_id, run_id, event_type, correlation_id, event_data, created_at
                FROM workflow_events
                WHERE run_id = ?1 AND (?2 IS NULL OR event_id > ?2)
                ORDER BY event_id ASC
                LIMIT ?3
                "#
            }
            SortOrder::Desc => {
                r#"
                SELECT event_id, run_id, event_type, correlation_id, event_data, created_at
                FROM workflow_events
                WHERE run_id = ?1 AND (?2 IS NULL OR event_id < ?2)
                ORDER BY event_id DESC
                LIMIT ?3
                "#
            }
        };

        let rows = sqlx::query_as::<_, EventRow>(sql)
            .bind(run_id)
            .bind(&params.cursor)
            .bind((limit + 1) as i64)
            .fetch_all(&self.pool)
            .await?;

        let events: Vec<Event> = rows.into_iter().map(Event::from).collect();
        Ok(Page::from_rows(events, limit, |e| e.event_id.clone()))
    }

    #[instrument(skip(self, params))]
    async fn list_by_correlation_id(
        &self,
        correlation_id: &str,
        params: ListEventsParams,
    ) -> Result<Page<Event>> {
        let limit = effective_limit(params.limit);
        let sql = match params.sort_order {
            SortOrder::Asc => {
                r#"
                SELECT event_id, run_id, event_type, correlation_id, event_data, created_at
                FROM workflow_events
                WHERE correlation_id = ?1 AND (?2 IS NULL OR event_id > ?2)
                ORDER BY event_id ASC
                LIMIT ?3
                "#
            }
            SortOrder::Desc => {
                r#"
                SELECT event_id, run_id, event_type, correlation_id, event_data, created_at
                FROM workflow_events
                WHERE correlation_id = ?1 AND (?2 IS NULL OR event_id < ?2)
                ORDER BY event_id DESC
                LIMIT ?3
                "#
            }
        };

        let rows = sqlx::query_as::<_, EventRow>(sql)
            .bind(correlation_id)
            .bind(&params.cursor)
            .bind((limit + 1) as i64)
            .fetch_all(&self.pool)
            .await?;

        let events: Vec<Event> = rows.into_iter().map(Event::from).collect();
        Ok(Page::from_rows(events, limit, |e| e.event_id.clone()))
    }
}

#[async_trait]
impl HookStore for SqliteStorage {
    #[instrument(skip(self, data), fields(run_id = %data.run_id))]
    async fn create(&self, data: CreateHook) -> Result<Hook> {
        let hook_id = data.hook_id.unwrap_or_else(ids::new_hook_id);

        let row = sqlx::query_as::<_, HookRow>(
            r#"
            INSERT INTO workflow_hooks
                (hook_id, run_id, token, owner_id, project_id, environment, metadata, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT (hook_id) DO NOTHING
            RETURNING hook_id, run_id, token, owner_id, project_id, environment,
                      metadata, created_at
            "#,
        )
        .bind(&hook_id)
        .bind(&data.run_id)
        .bind(&data.token)
        .bind(&data.owner_id)
        .bind(&data.project_id)
        .bind(&data.environment)
        .bind(data.metadata.unwrap_or_else(|| serde_json::json!({})))
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| WorldError::conflict("hook", &hook_id))?;

        debug!(%hook_id, "created hook");
        Ok(row.into())
    }

    #[instrument(skip(self))]
    async fn get(&self, hook_id: &str) -> Result<Hook> {
        let row = sqlx::query_as::<_, HookRow>(
            r#"
            SELECT hook_id, run_id, token, owner_id, project_id, environment,
                   metadata, created_at
            FROM workflow_hooks
            WHERE hook_id = ?1
            "#,
        )
        .bind(hook_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| WorldError::not_found("hook", hook_id))?;

        Ok(row.into())
    }

    #[instrument(skip(self, token))]
    async fn get_by_token(&self, token: &str) -> Result<Hook> {
        let row = sqlx::query_as::<_, HookRow>(
            r#"
            SELECT hook_id, run_id, token, owner_id, project_id, environment,
                   metadata, created_at
            FROM workflow_hooks
            WHERE token = ?1
            ORDER BY hook_id
            LIMIT 1
            "#,
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| WorldError::not_found("hook", token))?;

        Ok(row.into())
    }

    #[instrument(skip(self))]
    async fn dispose(&self, hook_id: &str) -> Result<Hook> {
        let row = sqlx::query_as::<_, HookRow>(
            r#"
            DELETE FROM workflow_hooks
            WHERE hook_id = ?1
            RETURNING hook_id, run_id, token, owner_id, project_id, environment,
                      metadata, created_at
            "#,
        )
        .bind(hook_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| WorldError::not_found("hook", hook_id))?;

        debug!(%hook_id, "disposed hook");
        Ok(row.into())
    }
}

fn map_duplicate(err: sqlx::Error, kind: &'static str, id: &str) -> WorldError {
    let is_duplicate = err
        .as_database_error()
        .map(|db| db.is_unique_violation())
        .unwrap_or(false);
    if is_duplicate {
        WorldError::conflict(kind, id)
    } else {
        err.into()
    }
}
