//! Polling queue for MySQL and SQLite
//!
//! Neither back-end has a wakeup primitive, so `worker_concurrency` workers
//! per queue name tick every `poll_interval`, fetch a batch of due jobs and
//! race for them with a conditional-UPDATE lease: the lease is won iff the
//! UPDATE touched exactly one row. A job whose lease expired while still
//! `processing` is stealable by any worker, which is what makes delivery
//! at-least-once and recovers from crashed workers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{MySqlPool, SqlitePool};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument};

use world_core::{ids, Result};

use crate::executor::Executor;
use crate::job::JobRow;
use crate::message::{parse_queue_name, MessageData, QueueKind};
use crate::queue::{EnqueueOptions, EnqueueReceipt, JobQueue, QueueConfig};

// MySQL and SQLite share `?` placeholders, so every statement is written
// once and bound identically on both pools.

const FETCH_DUE_SQL: &str = r#"
    SELECT id FROM workflow_jobs
    WHERE queue_name = ?
      AND scheduled_for <= ?
      AND ((status = 'pending' AND (locked_until IS NULL OR locked_until <= ?))
           OR (status = 'processing' AND locked_until <= ?))
    ORDER BY id
    LIMIT ?
"#;

const TRY_LEASE_SQL: &str = r#"
    UPDATE workflow_jobs
    SET status = 'processing', locked_until = ?, attempts = attempts + 1, updated_at = ?
    WHERE id = ?
      AND ((status = 'pending' AND scheduled_for <= ? AND (locked_until IS NULL OR locked_until <= ?))
           OR (status = 'processing' AND locked_until <= ?))
"#;

const LOAD_SQL: &str = r#"
    SELECT id, queue_name, payload, status, attempts, max_attempts, locked_until,
           scheduled_for, idempotency_key, error, created_at, updated_at
    FROM workflow_jobs
    WHERE id = ?
"#;

const COMPLETE_SQL: &str = r#"
    UPDATE workflow_jobs
    SET status = 'completed', locked_until = NULL, updated_at = ?
    WHERE id = ?
"#;

const RETRY_SQL: &str = r#"
    UPDATE workflow_jobs
    SET status = 'pending', locked_until = NULL, scheduled_for = ?, error = ?, updated_at = ?
    WHERE id = ?
"#;

const FAIL_SQL: &str = r#"
    UPDATE workflow_jobs
    SET status = 'failed', locked_until = NULL, error = ?, updated_at = ?
    WHERE id = ?
"#;

const INSERT_SQL: &str = r#"
    INSERT INTO workflow_jobs
        (id, queue_name, payload, status, attempts, max_attempts, scheduled_for,
         idempotency_key, created_at, updated_at)
    VALUES (?, ?, ?, 'pending', 0, ?, ?, ?, ?, ?)
"#;

const FIND_BY_KEY_SQL: &str = "SELECT id FROM workflow_jobs WHERE idempotency_key = ? LIMIT 1";

/// The two pools this queue runs on
#[derive(Clone)]
pub(crate) enum PollBackend {
    MySql(MySqlPool),
    Sqlite(SqlitePool),
}

impl PollBackend {
    async fn insert(
        &self,
        id: &str,
        queue_name: &str,
        payload: &serde_json::Value,
        max_attempts: i32,
        idempotency_key: Option<&str>,
        now: DateTime<Utc>,
    ) -> std::result::Result<(), sqlx::Error> {
        match self {
            Self::MySql(pool) => {
                sqlx::query(INSERT_SQL)
                    .bind(id)
                    .bind(queue_name)
                    .bind(payload)
                    .bind(max_attempts)
                    .bind(now)
                    .bind(idempotency_key)
                    .bind(now)
                    .bind(now)
                    .execute(pool)
                    .await?;
            }
            Self::Sqlite(pool) => {
                sqlx::query(INSERT_SQL)
                    .bind(id)
                    .bind(queue_name)
                    .bind(payload)
                    .bind(max_attempts)
                    .bind(now)
                    .bind(idempotency_key)
                    .bind(now)
                    .bind(now)
                    .execute(pool)
                    .await?;
            }
        }
        Ok(())
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<String>> {
        let id = match self {
            Self::MySql(pool) => {
                sqlx::query_scalar::<_, String>(FIND_BY_KEY_SQL)
                    .bind(key)
                    .fetch_optional(pool)
                    .await?
            }
            Self::Sqlite(pool) => {
                sqlx::query_scalar::<_, String>(FIND_BY_KEY_SQL)
                    .bind(key)
                    .fetch_optional(pool)
                    .await?
            }
        };
        Ok(id)
    }

    async fn fetch_due(
        &self,
        queue_name: &str,
        now: DateTime<Utc>,
        batch: usize,
    ) -> Result<Vec<String>> {
        let ids = match self {
            Self::MySql(pool) => {
                sqlx::query_scalar::<_, String>(FETCH_DUE_SQL)
                    .bind(queue_name)
                    .bind(now)
                    .bind(now)
                    .bind(now)
                    .bind(batch as i64)
                    .fetch_all(pool)
                    .await?
            }
            Self::Sqlite(pool) => {
                sqlx::query_scalar::<_, String>(FETCH_DUE_SQL)
                    .bind(queue_name)
                    .bind(now)
                    .bind(now)
                    .bind(now)
                    .bind(batch as i64)
                    .fetch_all(pool)
                    .await?
            }
        };
        Ok(ids)
    }

    /// Conditional lease: won iff exactly one row was updated
    async fn try_lease(&self, id: &str, now: DateTime<Utc>, lease: Duration) -> Result<bool> {
        let locked_until = now + chrono::Duration::from_std(lease).unwrap_or_default();
        let affected = match self {
            Self::MySql(pool) => {
                sqlx::query(TRY_LEASE_SQL)
                    .bind(locked_until)
                    .bind(now)
                    .bind(id)
                    .bind(now)
                    .bind(now)
                    .bind(now)
                    .execute(pool)
                    .await?
                    .rows_affected()
            }
            Self::Sqlite(pool) => {
                sqlx::query(TRY_LEASE_SQL)
                    .bind(locked_until)
                    .bind(now)
                    .bind(id)
                    .bind(now)
                    .bind(now)
                    .bind(now)
                    .execute(pool)
                    .await?
                    .rows_affected()
            }
        };
        Ok(affected == 1)
    }

    async fn load(&self, id: &str) -> Result<Option<JobRow>> {
        let row = match self {
            Self::MySql(pool) => {
                sqlx::query_as::<_, JobRow>(LOAD_SQL)
                    .bind(id)
                    .fetch_optional(pool)
                    .await?
            }
            Self::Sqlite(pool) => {
                sqlx::query_as::<_, JobRow>(LOAD_SQL)
                    .bind(id)
                    .fetch_optional(pool)
                    .await?
            }
        };
        Ok(row)
    }

    async fn complete(&self, id: &str, now: DateTime<Utc>) -> Result<()> {
        match self {
            Self::MySql(pool) => {
                sqlx::query(COMPLETE_SQL).bind(now).bind(id).execute(pool).await?;
            }
            Self::Sqlite(pool) => {
                sqlx::query(COMPLETE_SQL).bind(now).bind(id).execute(pool).await?;
            }
        }
        Ok(())
    }

    async fn retry(
        &self,
        id: &str,
        scheduled_for: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        match self {
            Self::MySql(pool) => {
                sqlx::query(RETRY_SQL)
                    .bind(scheduled_for)
                    .bind(error)
                    .bind(now)
                    .bind(id)
                    .execute(pool)
                    .await?;
            }
            Self::Sqlite(pool) => {
                sqlx::query(RETRY_SQL)
                    .bind(scheduled_for)
                    .bind(error)
                    .bind(now)
                    .bind(id)
                    .execute(pool)
                    .await?;
            }
        }
        Ok(())
    }

    async fn fail(&self, id: &str, error: &str, now: DateTime<Utc>) -> Result<()> {
        match self {
            Self::MySql(pool) => {
                sqlx::query(FAIL_SQL).bind(error).bind(now).bind(id).execute(pool).await?;
            }
            Self::Sqlite(pool) => {
                sqlx::query(FAIL_SQL).bind(error).bind(now).bind(id).execute(pool).await?;
            }
        }
        Ok(())
    }
}

/// Polling job queue over MySQL or SQLite
pub struct PollingQueue {
    backend: PollBackend,
    config: QueueConfig,
    executor: Arc<dyn Executor>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    running: AtomicBool,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl PollingQueue {
    pub fn mysql(pool: MySqlPool, config: QueueConfig, executor: Arc<dyn Executor>) -> Self {
        Self::new(PollBackend::MySql(pool), config, executor)
    }

    pub fn sqlite(pool: SqlitePool, config: QueueConfig, executor: Arc<dyn Executor>) -> Self {
        Self::new(PollBackend::Sqlite(pool), config, executor)
    }

    fn new(backend: PollBackend, config: QueueConfig, executor: Arc<dyn Executor>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            backend,
            config,
            executor,
            shutdown_tx,
            shutdown_rx,
            running: AtomicBool::new(false),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub(crate) async fn enqueue_row(
        backend: &PollBackend,
        config: &QueueConfig,
        queue_name: &str,
        message: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<EnqueueReceipt> {
        let parsed = parse_queue_name(queue_name)?;
        let job_queue = parsed.kind.job_queue_name(&config.job_prefix);

        if let Some(key) = &options.idempotency_key {
            if let Some(existing) = backend.find_by_idempotency_key(key).await? {
                debug!(key, message_id = %existing, "deduplicated enqueue");
                return Ok(EnqueueReceipt {
                    message_id: existing,
                });
            }
        }

        let message_id = ids::new_message_id();
        let envelope = MessageData {
            id: parsed.queue_id,
            data: message,
            attempt: 1,
            message_id: message_id.clone(),
            idempotency_key: options.idempotency_key.clone(),
        };
        let payload = serde_json::to_value(&envelope)?;
        let now = Utc::now();

        let insert = backend
            .insert(
                &message_id,
                &job_queue,
                &payload,
                config.max_attempts,
                options.idempotency_key.as_deref(),
                now,
            )
            .await;

        match insert {
            Ok(()) => {
                debug!(%message_id, queue = %job_queue, "enqueued job");
                Ok(EnqueueReceipt { message_id })
            }
            // A concurrent enqueue with the same idempotency key won the
            // unique index; its row is the answer.
            Err(e) if is_unique_violation(&e) && options.idempotency_key.is_some() => {
                let key = options.idempotency_key.as_deref().unwrap_or_default();
                match backend.find_by_idempotency_key(key).await? {
                    Some(existing) => Ok(EnqueueReceipt {
                        message_id: existing,
                    }),
                    None => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl JobQueue for PollingQueue {
    #[instrument(skip(self, message, options))]
    async fn enqueue(
        &self,
        queue_name: &str,
        message: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<EnqueueReceipt> {
        Self::enqueue_row(&self.backend, &self.config, queue_name, message, options).await
    }

    async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.shutdown_tx.send(false);

        let mut handles = self.handles.lock().unwrap();
        for kind in QueueKind::ALL {
            let queue_name = kind.job_queue_name(&self.config.job_prefix);
            for worker in 0..self.config.worker_concurrency {
                handles.push(tokio::spawn(worker_loop(
                    self.backend.clone(),
                    self.config.clone(),
                    Arc::clone(&self.executor),
                    kind,
                    queue_name.clone(),
                    worker,
                    self.shutdown_rx.clone(),
                )));
            }
        }

        debug!(
            workers = self.config.worker_concurrency,
            "started polling queue"
        );
        Ok(())
    }

    async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<JoinHandle<()>> = self.handles.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        debug!("stopped polling queue");
    }
}

async fn worker_loop(
    backend: PollBackend,
    config: QueueConfig,
    executor: Arc<dyn Executor>,
    kind: QueueKind,
    queue_name: String,
    worker: usize,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(config.poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown_rx.changed() => {
                // A closed channel means the queue itself is gone.
                if changed.is_err() {
                    break;
                }
            }
        }
        if *shutdown_rx.borrow() {
            break;
        }

        if let Err(e) = poll_once(&backend, &config, executor.as_ref(), kind, &queue_name).await {
            error!(queue = %queue_name, worker, "poll failed: {e}");
        }

        if *shutdown_rx.borrow() {
            break;
        }
    }

    debug!(queue = %queue_name, worker, "worker exited");
}

async fn poll_once(
    backend: &PollBackend,
    config: &QueueConfig,
    executor: &dyn Executor,
    kind: QueueKind,
    queue_name: &str,
) -> Result<usize> {
    let candidates = backend
        .fetch_due(queue_name, Utc::now(), config.batch_size)
        .await?;

    let mut processed = 0;
    for id in candidates {
        // Another worker may have won the lease since the fetch.
        if !backend.try_lease(&id, Utc::now(), config.lease_duration).await? {
            continue;
        }
        let Some(job) = backend.load(&id).await? else {
            continue;
        };
        process_job(backend, config, executor, kind, job).await?;
        processed += 1;
    }
    Ok(processed)
}

async fn process_job(
    backend: &PollBackend,
    config: &QueueConfig,
    executor: &dyn Executor,
    kind: QueueKind,
    job: JobRow,
) -> Result<()> {
    let mut message = match job.message() {
        Ok(message) => message,
        Err(e) => {
            // An undecodable payload will not improve with retries.
            error!(job_id = %job.id, "dropping undecodable payload: {e}");
            return backend
                .fail(&job.id, &format!("undecodable payload: {e}"), Utc::now())
                .await;
        }
    };
    message.attempt = job.attempts.max(1) as u32;

    let inner_queue = format!("{}{}", kind.caller_prefix(), message.id);

    match executor.call(&inner_queue, message).await {
        Ok(()) => {
            debug!(job_id = %job.id, attempts = job.attempts, "job completed");
            backend.complete(&job.id, Utc::now()).await
        }
        Err(handler_error) => {
            if job.attempts < job.max_attempts {
                let delay = config.retry.delay_after(job.attempts);
                let now = Utc::now();
                let scheduled_for = now + chrono::Duration::from_std(delay).unwrap_or_default();
                debug!(
                    job_id = %job.id,
                    attempts = job.attempts,
                    delay_ms = delay.as_millis() as u64,
                    "job failed, will retry"
                );
                backend.retry(&job.id, scheduled_for, &handler_error, now).await
            } else {
                debug!(job_id = %job.id, attempts = job.attempts, "job exhausted retries");
                backend.fail(&job.id, &handler_error, Utc::now()).await
            }
        }
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .map(|db| db.is_unique_violation())
        .unwrap_or(false)
}
