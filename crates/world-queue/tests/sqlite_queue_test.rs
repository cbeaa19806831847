//! Polling-queue integration tests against in-memory SQLite
//!
//! Timing knobs are shrunk so the whole retry ladder fits in a test run;
//! the arithmetic behind the production delays is covered by the retry
//! unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use world_core::WorldError;
use world_queue::{
    executor_fn, EnqueueOptions, JobQueue, JobRow, MessageData, PollingQueue, QueueConfig,
    RetryPolicy,
};
use world_storage::{schema, DatabaseKind, DbPool};

async fn sqlite_pool() -> sqlx::SqlitePool {
    let db = DbPool::connect(DatabaseKind::Sqlite, ":memory:")
        .await
        .expect("open sqlite");
    schema::setup(&db).await.expect("apply schema");
    match db {
        DbPool::Sqlite(pool) => pool,
        _ => unreachable!("requested sqlite"),
    }
}

fn test_config() -> QueueConfig {
    QueueConfig::new()
        .with_worker_concurrency(2)
        .with_poll_interval(Duration::from_millis(20))
        .with_lease_duration(Duration::from_secs(5))
        .with_retry(RetryPolicy::new(
            Duration::from_millis(40),
            Duration::from_millis(500),
        ))
}

async fn load_job(pool: &sqlx::SqlitePool, id: &str) -> JobRow {
    sqlx::query_as::<_, JobRow>(
        r#"
        SELECT id, queue_name, payload, status, attempts, max_attempts, locked_until,
               scheduled_for, idempotency_key, error, created_at, updated_at
        FROM workflow_jobs
        WHERE id = ?
        "#,
    )
    .bind(id)
    .fetch_one(pool)
    .await
    .expect("job row")
}

/// Poll the job row until `predicate` holds or the deadline passes
async fn wait_for_job(
    pool: &sqlx::SqlitePool,
    id: &str,
    predicate: impl Fn(&JobRow) -> bool,
) -> JobRow {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let job = load_job(pool, id).await;
        if predicate(&job) {
            return job;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!(
                "timed out waiting for job {id}: status={} attempts={}",
                job.status, job.attempts
            );
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn test_enqueue_rejects_unknown_prefix() {
    let pool = sqlite_pool().await;
    let executor = Arc::new(executor_fn(|_, _| async { Ok(()) }));
    let queue = PollingQueue::sqlite(pool, test_config(), executor);

    let err = queue
        .enqueue("jobs_abc", json!({}), EnqueueOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, WorldError::InvalidQueueName(_)));
}

#[tokio::test]
async fn test_idempotent_enqueue_returns_same_message_id() {
    let pool = sqlite_pool().await;
    let executor = Arc::new(executor_fn(|_, _| async { Ok(()) }));
    let queue = PollingQueue::sqlite(pool.clone(), test_config(), executor);

    let options = EnqueueOptions {
        idempotency_key: Some("K".into()),
    };
    let first = queue
        .enqueue("__wkf_workflow_abc", json!({"n": 1}), options.clone())
        .await
        .unwrap();
    let second = queue
        .enqueue("__wkf_workflow_abc", json!({"n": 1}), options)
        .await
        .unwrap();

    assert_eq!(first.message_id, second.message_id);

    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM workflow_jobs WHERE idempotency_key = 'K'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn test_dispatch_reconstructs_caller_queue_name() {
    let pool = sqlite_pool().await;
    let seen: Arc<Mutex<Vec<(String, MessageData)>>> = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&seen);
    let executor = Arc::new(executor_fn(move |queue_name, message| {
        let recorder = Arc::clone(&recorder);
        async move {
            recorder.lock().unwrap().push((queue_name, message));
            Ok(())
        }
    }));
    let queue = PollingQueue::sqlite(pool.clone(), test_config(), executor);

    let receipt = queue
        .enqueue("__wkf_workflow_abc", json!({"x": 1}), EnqueueOptions::default())
        .await
        .unwrap();
    assert!(receipt.message_id.starts_with("msg_"));

    queue.start().await.unwrap();
    let job = wait_for_job(&pool, &receipt.message_id, |j| j.status == "completed").await;
    queue.stop().await;

    assert_eq!(job.attempts, 1);
    assert!(job.locked_until.is_none());

    let calls = seen.lock().unwrap();
    assert_eq!(calls.len(), 1);
    let (queue_name, message) = &calls[0];
    assert_eq!(queue_name, "__wkf_workflow_abc");
    assert_eq!(message.id, "abc");
    assert_eq!(message.data, json!({"x": 1}));
    assert_eq!(message.attempt, 1);
    assert_eq!(message.message_id, receipt.message_id);
}

#[tokio::test]
async fn test_failing_handler_exhausts_retries() {
    let pool = sqlite_pool().await;
    let executor = Arc::new(executor_fn(|_, _| async { Err("always broken".to_string()) }));
    let queue = PollingQueue::sqlite(pool.clone(), test_config(), executor);

    let receipt = queue
        .enqueue("__wkf_step_s1", json!([]), EnqueueOptions::default())
        .await
        .unwrap();

    queue.start().await.unwrap();
    let job = wait_for_job(&pool, &receipt.message_id, |j| j.status == "failed").await;
    queue.stop().await;

    assert_eq!(job.attempts, 3);
    assert_eq!(job.error.as_deref(), Some("always broken"));
    assert!(job.locked_until.is_none());
}

#[tokio::test]
async fn test_retry_backoff_pushes_scheduled_for_out() {
    let pool = sqlite_pool().await;
    let executor = Arc::new(executor_fn(|_, _| async { Err("broken".to_string()) }));
    let queue = PollingQueue::sqlite(pool.clone(), test_config(), executor);

    let receipt = queue
        .enqueue("__wkf_workflow_w1", json!([]), EnqueueOptions::default())
        .await
        .unwrap();
    let enqueued_at = load_job(&pool, &receipt.message_id).await.scheduled_for;

    queue.start().await.unwrap();
    // A failure reschedules (pending, pushed out) until the ladder ends in
    // failed; every one of those states has scheduled_for past the
    // original slot.
    let job = wait_for_job(&pool, &receipt.message_id, |j| {
        j.attempts >= 1 && (j.status == "pending" || j.status == "failed")
    })
    .await;
    queue.stop().await;

    assert!(job.scheduled_for > enqueued_at);
    assert_eq!(job.error.as_deref(), Some("broken"));
}

#[tokio::test]
async fn test_handler_succeeding_on_third_attempt_completes() {
    let pool = sqlite_pool().await;
    let failures = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&failures);
    let executor = Arc::new(executor_fn(move |_, _| {
        let counter = Arc::clone(&counter);
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err("flaky".to_string())
            } else {
                Ok(())
            }
        }
    }));
    let queue = PollingQueue::sqlite(pool.clone(), test_config(), executor);

    let receipt = queue
        .enqueue("__wkf_workflow_w1", json!([]), EnqueueOptions::default())
        .await
        .unwrap();

    queue.start().await.unwrap();
    let job = wait_for_job(&pool, &receipt.message_id, |j| j.status == "completed").await;
    queue.stop().await;

    assert_eq!(job.attempts, 3);
    assert_eq!(failures.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_expired_lease_is_stolen_and_completed() {
    let pool = sqlite_pool().await;
    let executor = Arc::new(executor_fn(|_, _| async { Ok(()) }));
    let queue = PollingQueue::sqlite(pool.clone(), test_config(), executor);

    // A job a crashed worker left behind: processing, lease expired.
    let payload = serde_json::to_value(MessageData {
        id: "w1".into(),
        data: json!({}),
        attempt: 1,
        message_id: "msg_stale".into(),
        idempotency_key: None,
    })
    .unwrap();
    let now = Utc::now();
    sqlx::query(
        r#"
        INSERT INTO workflow_jobs
            (id, queue_name, payload, status, attempts, max_attempts, locked_until,
             scheduled_for, created_at, updated_at)
        VALUES ('msg_stale', 'workflow_flows', ?, 'processing', 0, 3, ?, ?, ?, ?)
        "#,
    )
    .bind(&payload)
    .bind(now - chrono::Duration::seconds(1))
    .bind(now - chrono::Duration::seconds(1))
    .bind(now)
    .bind(now)
    .execute(&pool)
    .await
    .unwrap();

    queue.start().await.unwrap();
    let job = wait_for_job(&pool, "msg_stale", |j| j.status == "completed").await;
    queue.stop().await;

    assert_eq!(job.attempts, 1);
}

#[tokio::test]
async fn test_stop_halts_polling() {
    let pool = sqlite_pool().await;
    let executor = Arc::new(executor_fn(|_, _| async { Ok(()) }));
    let queue = PollingQueue::sqlite(pool.clone(), test_config(), executor);

    queue.start().await.unwrap();
    queue.stop().await;

    let receipt = queue
        .enqueue("__wkf_workflow_w1", json!([]), EnqueueOptions::default())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let job = load_job(&pool, &receipt.message_id).await;
    assert_eq!(job.status, "pending");
    assert_eq!(job.attempts, 0);
}

#[tokio::test]
async fn test_start_is_idempotent() {
    let pool = sqlite_pool().await;
    let executor = Arc::new(executor_fn(|_, _| async { Ok(()) }));
    let queue = PollingQueue::sqlite(pool.clone(), test_config(), executor);

    queue.start().await.unwrap();
    queue.start().await.unwrap();

    let receipt = queue
        .enqueue("__wkf_workflow_w1", json!([]), EnqueueOptions::default())
        .await
        .unwrap();
    let job = wait_for_job(&pool, &receipt.message_id, |j| j.status == "completed").await;
    queue.stop().await;

    // Exactly one delivery even with start called twice.
    assert_eq!(job.attempts, 1);
}
