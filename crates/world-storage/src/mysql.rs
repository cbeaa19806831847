//! MySQL storage
//!
//! MySQL has no `RETURNING` and no insert-on-conflict-do-nothing, so every
//! write follows the returning-compat strategy: run the DML, then read the
//! row back by primary key (never by the original WHERE clause, which may
//! reference columns the DML just mutated). Updates and deletes wrap the
//! DML + read-back in one transaction so the returned row is the row the
//! statement produced. Duplicate-key inserts (driver error 1062) degrade
//! to the read-back.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::mysql::MySqlDatabaseError;
use sqlx::{MySql, MySqlPool, Transaction};
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

const RUN_SELECT: &str = r#"
    SELECT run_id, deployment_id, workflow_name, status, input, output,
           execution_context, error, error_code, created_at, updated_at,
           started_at, completed_at
    FROM workflow_runs
    WHERE run_id = ?
"#;

const STEP_SELECT: &str = r#"
    SELECT step_id, run_id, step_name, status, input, output, error,
           error_code, attempt, started_at, completed_at, created_at, updated_at
    FROM workflow_steps
    WHERE step_id = ?
"#;

const HOOK_SELECT: &str = r#"
    SELECT hook_id, run_id, token, owner_id, project_id, environment,
           metadata, created_at
    FROM workflow_hooks
    WHERE hook_id = ?
"#;

/// MySQL implementation of the four entity stores
#[derive(Clone)]
pub struct MySqlStorage {
    pool: MySqlPool,
}

impl MySqlStorage {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }

    async fn fetch_run(&self, run_id: &str) -> Result<Option<RunRow>> {
        let row = sqlx::query_as::<_, RunRow>(RUN_SELECT)
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn fetch_run_tx(
        tx: &mut Transaction<'_, MySql>,
        run_id: &str,
    ) -> Result<Option<RunRow>> {
        let row = sqlx::query_as::<_, RunRow>(RUN_SELECT)
            .bind(run_id)
            .fetch_optional(&mut **tx)
            .await?;
        Ok(row)
    }

    async fn fetch_step(&self, step_id: &str) -> Result<Option<StepRow>> {
        let row = sqlx::query_as::<_, StepRow>(STEP_SELECT)
            .bind(step_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }
}

#[async_trait]
impl RunStore for MySqlStorage {
    #[instrument(skip(self, data), fields(workflow_name = %data.workflow_name))]
    async fn create(&self, data: CreateRun) -> Result<Run> {
        let run_id = ids::new_run_id();
        let now = Utc::now();

        // Pre-check keeps the common duplicate path off the driver error.
        if self.fetch_run(&run_id).await?.is_some() {
            return Err(WorldError::conflict("run", run_id));
        }

        sqlx::query(
            r#"
            INSERT INTO workflow_runs
                (run_id, deployment_id, workflow_name, status, input, execution_context,
                 created_at, updated_at)
            VALUES (?, ?, ?, 'pending', ?, ?, ?, ?)
            "#,
        )
        .bind(&run_id)
        .bind(&data.deployment_id)
        .bind(&data.workflow_name)
        .bind(&data.input)
        .bind(&data.execution_context)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| map_duplicate(e, "run", &run_id))?;

        debug!(%run_id, "created run");
        self.fetch_run(&run_id)
            .await?
            .ok_or_else(|| WorldError::not_found("run", &run_id))?
            .into_run()
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

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = COALESCE(?, status),
                output = COALESCE(?, output),
                execution_context = COALESCE(?, execution_context),
                error = COALESCE(?, error),
                error_code = COALESCE(?, error_code),
                started_at = COALESCE(?, started_at),
                completed_at = COALESCE(?, completed_at),
                updated_at = ?
            WHERE run_id = ?
            "#,
        )
        .bind(patch.status.map(|s| s.as_str()))
        .bind(&patch.output)
        .bind(&patch.execution_context)
        .bind(&patch.error)
        .bind(&patch.error_code)
        .bind(times.started_at)
        .bind(times.completed_at)
        .bind(now)
        .bind(run_id)
        .execute(&mut *tx)
        .await?;

        let row = Self::fetch_run_tx(&mut tx, run_id)
            .await?
            .ok_or_else(|| WorldError::not_found("run", run_id))?;
        tx.commit().await?;

        debug!(%run_id, status = ?patch.status, "updated run");
        row.into_run()
    }

    #[instrument(skip(self))]
    async fn cancel(&self, run_id: &str) -> Result<Run> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = 'cancelled',
                completed_at = COALESCE(completed_at, ?),
                updated_at = ?
            WHERE run_id = ?
              AND status NOT IN ('completed', 'failed', 'cancelled')
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(run_id)
        .execute(&mut *tx)
        .await?;

        // Read back by primary key: covers both the freshly-cancelled row
        // and the idempotent already-terminal case.
        let row = Self::fetch_run_tx(&mut tx, run_id)
            .await?
            .ok_or_else(|| WorldError::not_found("run", run_id))?;
        tx.commit().await?;

        debug!(%run_id, "cancelled run");
        row.into_run()
    }

    #[instrument(skip(self))]
    async fn pause(&self, run_id: &str) -> Result<Run> {
        // Only a running run can pause; pausing a paused run is a no-op
        // update. Everything else never entered the running leg of the
        // state machine and is rejected.
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = 'paused', updated_at = ?
            WHERE run_id = ?
              AND status IN ('running', 'paused')
            "#,
        )
        .bind(Utc::now())
        .bind(run_id)
        .execute(&mut *tx)
        .await?;

        let row = Self::fetch_run_tx(&mut tx, run_id).await?;
        tx.commit().await?;

        match row {
            Some(row) if result.rows_affected() > 0 => row.into_run(),
            // MySQL reports zero affected rows when the new value equals
            // the old one, so a paused run pausing again lands here too.
            Some(row) if row.status == "paused" => row.into_run(),
            Some(_) => Err(WorldError::not_found("active run", run_id)),
            None => Err(WorldError::not_found("run", run_id)),
        }
    }

    #[instrument(skip(self))]
    async fn resume(&self, run_id: &str) -> Result<Run> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = 'running', updated_at = ?
            WHERE run_id = ? AND status = 'paused'
            "#,
        )
        .bind(Utc::now())
        .bind(run_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(WorldError::not_found("paused run", run_id));
        }

        let row = Self::fetch_run_tx(&mut tx, run_id)
            .await?
            .ok_or_else(|| WorldError::not_found("run", run_id))?;
        tx.commit().await?;

        row.into_run()
    }

    #[instrument(skip(self, params))]
    async fn list(&self, params: ListRunsParams) -> Result<Page<Run>> {
        let limit = effective_limit(params.limit);
        let status = params.status.map(|s| s.as_str());
        let rows = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT run_id, deployment_id, workflow_name, status, input, output,
                   execution_context, error, error_code, created_at, updated_at,
                   started_at, completed_at
            FROM workflow_runs
            WHERE (? IS NULL OR workflow_name = ?)
              AND (? IS NULL OR status = ?)
              AND (? IS NULL OR run_id < ?)
            ORDER BY run_id DESC
            LIMIT ?
            "#,
        )
        .bind(&params.workflow_name)
        .bind(&params.workflow_name)
        .bind(status)
        .bind(status)
        .bind(&params.cursor)
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
impl StepStore for MySqlStorage {
    #[instrument(skip(self, data), fields(run_id = %data.run_id, step_name = %data.step_name))]
    async fn create(&self, data: CreateStep) -> Result<Step> {
        let step_id = data.step_id.unwrap_or_else(ids::new_step_id);
        let now = Utc::now();

        let insert = sqlx::query(
            r#"
            INSERT INTO workflow_steps
                (step_id, run_id, step_name, status, input, attempt, created_at, updated_at)
            VALUES (?, ?, ?, 'pending', ?, ?, ?, ?)
            "#,
        )
        .bind(&step_id)
        .bind(&data.run_id)
        .bind(&data.step_name)
        .bind(&data.input)
        .bind(data.attempt.unwrap_or(1))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await;

        match insert {
            Ok(_) => debug!(%step_id, "created step"),
            // Idempotent create: a duplicate key falls through to the
            // read-back below.
            Err(e) if is_duplicate_key(&e) => {}
            Err(e) => return Err(e.into()),
        }

        match self.fetch_step(&step_id).await? {
            Some(row) => row.into_step(),
            None => Err(WorldError::conflict("step", step_id)),
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

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            UPDATE workflow_steps
            SET status = COALESCE(?, status),
                output = COALESCE(?, output),
                error = COALESCE(?, error),
                error_code = COALESCE(?, error_code),
                started_at = COALESCE(?, started_at),
                completed_at = COALESCE(?, completed_at),
                updated_at = ?
            WHERE step_id = ?
            "#,
        )
        .bind(patch.status.map(|s| s.as_str()))
        .bind(&patch.output)
        .bind(&patch.error)
        .bind(&patch.error_code)
        .bind(times.started_at)
        .bind(times.completed_at)
        .bind(now)
        .bind(step_id)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query_as::<_, StepRow>(STEP_SELECT)
            .bind(step_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| WorldError::not_found("step", step_id))?;
        tx.commit().await?;

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
            WHERE run_id = ?
              AND (? IS NULL OR step_id > ?)
            ORDER BY step_id ASC
            LIMIT ?
            "#,
        )
        .bind(run_id)
        .bind(&params.cursor)
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
impl EventStore for MySqlStorage {
    #[instrument(skip(self, data), fields(run_id = %data.run_id, event_type = %data.event_type))]
    async fn create(&self, data: CreateEvent) -> Result<Event> {
        let event_id = ids::new_event_id();

        sqlx::query(
            r#"
            INSERT INTO workflow_events
                (event_id, run_id, event_type, correlation_id, event_data, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event_id)
        .bind(&data.run_id)
        .bind(&data.event_type)
        .bind(&data.correlation_id)
        .bind(&data.event_data)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| map_duplicate(e, "event", &event_id))?;

        let row = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT event_id, run_id, event_type, correlation_id, event_data, created_at
            FROM workflow_events
            WHERE event_id = ?
            "#,
        )
        .bind(&event_id)
        .fetch_one(&self.pool)
        .await?;

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
                WHERE run_id = ? AND (? IS NULL OR event_id > ?)
                ORDER BY event_id ASC
                LIMIT ?
                "#
            }
            SortOrder::Desc => {
                r#"
                SELECT event_id, run_id, event_type, correlation_id, event_data, created_at
                FROM workflow_events
                WHERE run_id = ? AND (? IS NULL OR event_id < ?)
                ORDER BY event_id DESC
                LIMIT ?
                "#
            }
        };

        let rows = sqlx::query_as::<_, EventRow>(sql)
            .bind(run_id)
            .bind(&params.cursor)
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
                WHERE correlation_id = ? AND (? IS NULL OR event_id > ?)
                ORDER BY event_id ASC
                LIMIT ?
                "#
            }
            SortOrder::Desc => {
                r#"
                SELECT event_id, run_id, event_type, correlation_id, event_data, created_at
                FROM workflow_events
                WHERE correlation_id = ? AND (? IS NULL OR event_id < ?)
                ORDER BY event_id DESC
                LIMIT ?
                "#
            }
        };

        let rows = sqlx::query_as::<_, EventRow>(sql)
            .bind(correlation_id)
            .bind(&params.cursor)
            .bind(&params.cursor)
            .bind((limit + 1) as i64)
            .fetch_all(&self.pool)
            .await?;

        let events: Vec<Event> = rows.into_iter().map(Event::from).collect();
        Ok(Page::from_rows(events, limit, |e| e.event_id.clone()))
    }
}

#[async_trait]
impl HookStore for MySqlStorage {
    #[instrument(skip(self, data), fields(run_id = %data.run_id))]
    async fn create(&self, data: CreateHook) -> Result<Hook> {
        let hook_id = data.hook_id.unwrap_or_else(ids::new_hook_id);

        sqlx::query(
            r#"
            INSERT INTO workflow_hooks
                (hook_id, run_id, token, owner_id, project_id, environment, metadata, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
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
        .execute(&self.pool)
        .await
        .map_err(|e| map_duplicate(e, "hook", &hook_id))?;

        debug!(%hook_id, "created hook");
        let row = sqlx::query_as::<_, HookRow>(HOOK_SELECT)
            .bind(&hook_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.into())
    }

    #[instrument(skip(self))]
    async fn get(&self, hook_id: &str) -> Result<Hook> {
        let row = sqlx::query_as::<_, HookRow>(HOOK_SELECT)
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
            WHERE token = ?
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
        // SELECT-then-DELETE in one transaction approximates DELETE
        // RETURNING for the caller.
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, HookRow>(HOOK_SELECT)
            .bind(hook_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| WorldError::not_found("hook", hook_id))?;

        sqlx::query("DELETE FROM workflow_hooks WHERE hook_id = ?")
            .bind(hook_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        debug!(%hook_id, "disposed hook");
        Ok(row.into())
    }
}

/// MySQL signals a duplicate key as driver error 1062
fn is_duplicate_key(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db
            .try_downcast_ref::<MySqlDatabaseError>()
            .map(|e| e.number() == 1062)
            .unwrap_or_else(|| db.is_unique_violation()),
        _ => false,
    }
}

fn map_duplicate(err: sqlx::Error, kind: &'static str, id: &str) -> WorldError {
    if is_duplicate_key(&err) {
        WorldError::conflict(kind, id)
    } else {
        err.into()
    }
}
