//! End-to-end facade test on in-memory SQLite: one pool shared by the
//! storage layer, the polling queue and the polling streamer.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio_stream::StreamExt;

use world_sql::{
    executor_fn, AuthContext, CreateRun, EnqueueOptions, MessageData, QueueConfig, RetryPolicy,
    RunStatus, StreamerConfig, UpdateRun, World, WorldConfig,
};

async fn test_world(seen: Arc<Mutex<Vec<(String, MessageData)>>>) -> World {
    let executor = Arc::new(executor_fn(move |queue_name, message| {
        let seen = Arc::clone(&seen);
        async move {
            seen.lock().unwrap().push((queue_name, message));
            Ok(())
        }
    }));

    let config = WorldConfig::new()
        .with_connection_string(":memory:")
        .with_auth(AuthContext {
            environment: "test".into(),
            owner_id: "owner-1".into(),
            project_id: "proj-1".into(),
        });
    let queue_config = QueueConfig::new()
        .with_worker_concurrency(2)
        .with_poll_interval(Duration::from_millis(20))
        .with_retry(RetryPolicy::new(
            Duration::from_millis(40),
            Duration::from_millis(500),
        ));
    let streamer_config = StreamerConfig::new().with_poll_interval(Duration::from_millis(20));

    let world = World::with_tuning(config, queue_config, streamer_config, executor)
        .await
        .expect("build world");
    world.setup().await.expect("apply schema");
    world.start().await.expect("start world");
    world
}

#[tokio::test]
async fn test_run_lifecycle_through_the_facade() {
    let world = test_world(Arc::new(Mutex::new(Vec::new()))).await;

    let run = world
        .runs
        .create(CreateRun {
            deployment_id: "d1".into(),
            workflow_name: "w".into(),
            input: json!([{"x": 1}]),
            execution_context: None,
        })
        .await
        .unwrap();
    assert_eq!(world.runs.get(&run.run_id).await.unwrap().status, RunStatus::Pending);

    let running = world
        .runs
        .update(
            &run.run_id,
            UpdateRun {
                status: Some(RunStatus::Running),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(running.started_at.is_some());

    let done = world
        .runs
        .update(
            &run.run_id,
            UpdateRun {
                status: Some(RunStatus::Completed),
                output: Some(json!([{"y": 2}])),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(done.completed_at.is_some());
    assert_eq!(done.output, Some(json!([{"y": 2}])));

    world.stop().await;
}

#[tokio::test]
async fn test_queue_dispatch_and_idempotency_through_the_facade() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let world = test_world(Arc::clone(&seen)).await;

    let options = EnqueueOptions {
        idempotency_key: Some("K".into()),
    };
    let first = world
        .queue("__wkf_workflow_abc", json!({"x": 1}), options.clone())
        .await
        .unwrap();
    let second = world
        .queue("__wkf_workflow_abc", json!({"x": 1}), options)
        .await
        .unwrap();
    assert_eq!(first.message_id, second.message_id);

    // Exactly one delivery, addressed back to the caller-side name.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if !seen.lock().unwrap().is_empty() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "dispatch timed out");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let calls = seen.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "__wkf_workflow_abc");
    assert_eq!(calls[0].1.message_id, first.message_id);
    drop(calls);

    world.stop().await;
}

#[tokio::test]
async fn test_register_hook_stamps_tenant_identity() {
    let world = test_world(Arc::new(Mutex::new(Vec::new()))).await;

    let run = world
        .runs
        .create(CreateRun {
            deployment_id: "d1".into(),
            workflow_name: "w".into(),
            input: json!([]),
            execution_context: None,
        })
        .await
        .unwrap();

    let hook = world
        .register_hook(&run.run_id, "tok-1", Some(json!({"k": "v"})))
        .await
        .unwrap();
    assert_eq!(hook.environment, "test");
    assert_eq!(hook.owner_id, "owner-1");
    assert_eq!(hook.project_id, "proj-1");

    let fetched = world.hooks.get_by_token("tok-1").await.unwrap();
    assert_eq!(fetched.hook_id, hook.hook_id);

    world.stop().await;
}

#[tokio::test]
async fn test_stream_roundtrip_through_the_facade() {
    let world = test_world(Arc::new(Mutex::new(Vec::new()))).await;

    world.streamer.write("s1", b"ab").await.unwrap();
    let mut reader = world.streamer.read("s1", None).await.unwrap();
    world.streamer.write("s1", b"cd").await.unwrap();
    world.streamer.close("s1").await.unwrap();

    let mut collected = Vec::new();
    while let Ok(Some(item)) = tokio::time::timeout(Duration::from_secs(5), reader.next()).await {
        collected.push(item.unwrap().chunk_data);
    }
    assert_eq!(collected, vec![b"ab".to_vec(), b"cd".to_vec()]);

    world.stop().await;
}

#[tokio::test]
async fn test_health_and_idempotent_start() {
    let world = test_world(Arc::new(Mutex::new(Vec::new()))).await;

    // Second start is a no-op.
    world.start().await.unwrap();

    let health = world.health().await;
    assert!(health.healthy);
    assert!(health.database);
    assert!(health.storage);
    assert_eq!(health.auth.environment, "test");

    world.stop().await;
}
