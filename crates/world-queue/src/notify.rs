//! PostgreSQL queue
//!
//! Same job table and row lifecycle as the polling queue, but enqueue also
//! fires `pg_notify` so dispatch latency is near-zero: a dedicated LISTEN
//! connection wakes the matching workers as soon as a job lands. The
//! periodic tick stays as the fallback for missed notifications and for
//! retries whose `scheduled_for` lies in the future. Claiming uses a
//! single CTE UPDATE with `FOR UPDATE SKIP LOCKED`, so concurrent workers
//! never contend on the same rows.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument};

use world_core::{ids, Result};

use crate::executor::Executor;
use crate::job::JobRow;
use crate::message::{parse_queue_name, MessageData, QueueKind};
use crate::queue::{EnqueueOptions, EnqueueReceipt, JobQueue, QueueConfig};

const CLAIM_SQL: &str = r#"
    WITH claimable AS (
        SELECT id
        FROM workflow_jobs
        WHERE queue_name = $1
          AND scheduled_for <= $2
          AND ((status = 'pending' AND (locked_until IS NULL OR locked_until <= $2))
               OR (status = 'processing' AND locked_until <= $2))
        ORDER BY id
        LIMIT $3
        FOR UPDATE SKIP LOCKED
    )
    UPDATE workflow_jobs j
    SET status = 'processing',
        locked_until = $4,
        attempts = j.attempts + 1,
        updated_at = $2
    FROM claimable c
    WHERE j.id = c.id
    RETURNING j.id, j.queue_name, j.payload, j.status, j.attempts, j.max_attempts,
              j.locked_until, j.scheduled_for, j.idempotency_key, j.error,
              j.created_at, j.updated_at
"#;

/// LISTEN/NOTIFY-assisted job queue for PostgreSQL
pub struct NotifyQueue {
    pool: PgPool,
    config: QueueConfig,
    executor: Arc<dyn Executor>,
    channel: String,
    wakers: HashMap<String, Arc<Notify>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    running: AtomicBool,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl NotifyQueue {
    pub fn new(pool: PgPool, config: QueueConfig, executor: Arc<dyn Executor>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let channel = format!("{}jobs", config.job_prefix);
        let wakers = QueueKind::ALL
            .iter()
            .map(|kind| (kind.job_queue_name(&config.job_prefix), Arc::new(Notify::new())))
            .collect();

        Self {
            pool,
            config,
            executor,
            channel,
            wakers,
            shutdown_tx,
            shutdown_rx,
            running: AtomicBool::new(false),
            handles: Mutex::new(Vec::new()),
        }
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<String>> {
        let id = sqlx::query_scalar::<_, String>(
            "SELECT id FROM workflow_jobs WHERE idempotency_key = $1 LIMIT 1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }
}

#[async_trait]
impl JobQueue for NotifyQueue {
    #[instrument(skip(self, message, options))]
    async fn enqueue(
        &self,
        queue_name: &str,
        message: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<EnqueueReceipt> {
        let parsed = parse_queue_name(queue_name)?;
        let job_queue = parsed.kind.job_queue_name(&self.config.job_prefix);

        if let Some(key) = &options.idempotency_key {
            if let Some(existing) = self.find_by_idempotency_key(key).await? {
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

        let insert = sqlx::query(
            r#"
            INSERT INTO workflow_jobs
                (id, queue_name, payload, status, attempts, max_attempts, scheduled_for,
                 idempotency_key, created_at, updated_at)
            VALUES ($1, $2, $3, 'pending', 0, $4, $5, $6, $5, $5)
            "#,
        )
        .bind(&message_id)
        .bind(&job_queue)
        .bind(&payload)
        .bind(self.config.max_attempts)
        .bind(now)
        .bind(&options.idempotency_key)
        .execute(&self.pool)
        .await;

        match insert {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) && options.idempotency_key.is_some() => {
                let key = options.idempotency_key.as_deref().unwrap_or_default();
                return match self.find_by_idempotency_key(key).await? {
                    Some(existing) => Ok(EnqueueReceipt {
                        message_id: existing,
                    }),
                    None => Err(e.into()),
                };
            }
            Err(e) => return Err(e.into()),
        }

        // Fire the wakeup after the insert committed so listeners cannot
        // observe the notification before the row.
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&self.channel)
            .bind(&job_queue)
            .execute(&self.pool)
            .await?;

        debug!(%message_id, queue = %job_queue, "enqueued job");
        Ok(EnqueueReceipt { message_id })
    }

    async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.shutdown_tx.send(false);

        // Dedicated LISTEN connection; workers share the pool.
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(&self.channel).await?;

        let mut handles = self.handles.lock().unwrap();

        let wakers = self.wakers.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    notification = listener.recv() => match notification {
                        Ok(n) => {
                            if let Some(waker) = wakers.get(n.payload()) {
                                waker.notify_one();
                            }
                        }
                        Err(e) => {
                            // The listener reconnects on its own; wait out
                            // the blip instead of spinning.
                            error!("listen error: {e}");
                            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                        }
                    },
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("listener exited");
        }));

        for kind in QueueKind::ALL {
            let queue_name = kind.job_queue_name(&self.config.job_prefix);
            let waker = Arc::clone(&self.wakers[&queue_name]);
            for worker in 0..self.config.worker_concurrency {
                handles.push(tokio::spawn(worker_loop(
                    self.pool.clone(),
                    self.config.clone(),
                    Arc::clone(&self.executor),
                    kind,
                    queue_name.clone(),
                    worker,
                    Arc::clone(&waker),
                    self.shutdown_rx.clone(),
                )));
            }
        }

        debug!(
            workers = self.config.worker_concurrency,
            channel = %self.channel,
            "started notify queue"
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
        debug!("stopped notify queue");
    }
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    pool: PgPool,
    config: QueueConfig,
    executor: Arc<dyn Executor>,
    kind: QueueKind,
    queue_name: String,
    worker: usize,
    waker: Arc<Notify>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(config.poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = waker.notified() => {}
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

        if let Err(e) = claim_and_process(&pool, &config, executor.as_ref(), kind, &queue_name).await
        {
            error!(queue = %queue_name, worker, "claim failed: {e}");
        }

        if *shutdown_rx.borrow() {
            break;
        }
    }

    debug!(queue = %queue_name, worker, "worker exited");
}

async fn claim_and_process(
    pool: &PgPool,
    config: &QueueConfig,
    executor: &dyn Executor,
    kind: QueueKind,
    queue_name: &str,
) -> Result<usize> {
    let now = Utc::now();
    let locked_until = now + chrono::Duration::from_std(config.lease_duration).unwrap_or_default();

    let jobs = sqlx::query_as::<_, JobRow>(CLAIM_SQL)
        .bind(queue_name)
        .bind(now)
        .bind(config.batch_size as i64)
        .bind(locked_until)
        .fetch_all(pool)
        .await?;

    let claimed = jobs.len();
    for job in jobs {
        process_job(pool, config, executor, kind, job).await?;
    }
    Ok(claimed)
}

async fn process_job(
    pool: &PgPool,
    config: &QueueConfig,
    executor: &dyn Executor,
    kind: QueueKind,
    job: JobRow,
) -> Result<()> {
    let mut message = match job.message() {
        Ok(message) => message,
        Err(e) => {
            error!(job_id = %job.id, "dropping undecodable payload: {e}");
            return fail_job(pool, &job.id, &format!("undecodable payload: {e}")).await;
        }
    };
    message.attempt = job.attempts.max(1) as u32;

    let inner_queue = format!("{}{}", kind.caller_prefix(), message.id);

    match executor.call(&inner_queue, message).await {
        Ok(()) => {
            debug!(job_id = %job.id, attempts = job.attempts, "job completed");
            sqlx::query(
                "UPDATE workflow_jobs SET status = 'completed', locked_until = NULL, updated_at = $1 WHERE id = $2",
            )
            .bind(Utc::now())
            .bind(&job.id)
            .execute(pool)
            .await?;
            Ok(())
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
                sqlx::query(
                    "UPDATE workflow_jobs SET status = 'pending', locked_until = NULL, scheduled_for = $1, error = $2, updated_at = $3 WHERE id = $4",
                )
                .bind(scheduled_for)
                .bind(&handler_error)
                .bind(now)
                .bind(&job.id)
                .execute(pool)
                .await?;
                Ok(())
            } else {
                debug!(job_id = %job.id, attempts = job.attempts, "job exhausted retries");
                fail_job(pool, &job.id, &handler_error).await
            }
        }
    }
}

async fn fail_job(pool: &PgPool, job_id: &str, error: &str) -> Result<()> {
    sqlx::query(
        "UPDATE workflow_jobs SET status = 'failed', locked_until = NULL, error = $1, updated_at = $2 WHERE id = $3",
    )
    .bind(error)
    .bind(Utc::now())
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(())
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .map(|db| db.is_unique_violation())
        .unwrap_or(false)
}
