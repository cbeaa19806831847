//! Storage integration tests against in-memory SQLite
//!
//! SQLite exercises the native-RETURNING code path hermetically; the
//! behavior asserted here (state machine, stamping rules, cursors) is
//! shared by all three back-ends.

use serde_json::json;

use world_core::{
    CreateEvent, CreateHook, CreateRun, CreateStep, ListEventsParams, ListParams, ListRunsParams,
    RunStatus, SortOrder, StepStatus, UpdateRun, UpdateStep, WorldError,
};
use world_storage::{
    schema, DatabaseKind, DbPool, EventStore, HookStore, RunStore, SqliteStorage, StepStore,
};

/// One storage struct implements all four stores; the tests talk to it
/// through the per-entity traits, the way the facade hands it out.
struct Stores {
    storage: SqliteStorage,
}

impl Stores {
    fn runs(&self) -> &dyn RunStore {
        &self.storage
    }
    fn steps(&self) -> &dyn StepStore {
        &self.storage
    }
    fn events(&self) -> &dyn EventStore {
        &self.storage
    }
    fn hooks(&self) -> &dyn HookStore {
        &self.storage
    }
}

async fn stores() -> Stores {
    let db = DbPool::connect(DatabaseKind::Sqlite, ":memory:")
        .await
        .expect("open sqlite");
    schema::setup(&db).await.expect("apply schema");
    match db {
        DbPool::Sqlite(pool) => Stores {
            storage: SqliteStorage::new(pool),
        },
        _ => unreachable!("requested sqlite"),
    }
}

fn create_run_data(workflow_name: &str) -> CreateRun {
    CreateRun {
        deployment_id: "d1".into(),
        workflow_name: workflow_name.into(),
        input: json!([{"x": 1}]),
        execution_context: None,
    }
}

// ============================================
// Runs
// ============================================

#[tokio::test]
async fn test_create_and_get_run_roundtrip() {
    let stores = stores().await;
    let runs = stores.runs();

    let run = runs.create(create_run_data("w")).await.unwrap();
    assert!(run.run_id.starts_with("wrun_"));
    assert_eq!(run.status, RunStatus::Pending);
    assert!(run.started_at.is_none());
    assert!(run.completed_at.is_none());

    let fetched = runs.get(&run.run_id).await.unwrap();
    assert_eq!(fetched.deployment_id, "d1");
    assert_eq!(fetched.workflow_name, "w");
    assert_eq!(fetched.input, json!([{"x": 1}]));
    assert_eq!(fetched.status, RunStatus::Pending);
}

#[tokio::test]
async fn test_get_missing_run_is_not_found() {
    let stores = stores().await;
    let err = stores.runs().get("wrun_missing").await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_update_stamps_started_at_exactly_once() {
    let stores = stores().await;
    let runs = stores.runs();
    let run = runs.create(create_run_data("w")).await.unwrap();

    let running = runs
        .update(
            &run.run_id,
            UpdateRun {
                status: Some(RunStatus::Running),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let first_started = running.started_at.expect("started_at set");

    // A second transition to running must not move the stamp.
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let again = runs
        .update(
            &run.run_id,
            UpdateRun {
                status: Some(RunStatus::Running),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(again.started_at, Some(first_started));
}

#[tokio::test]
async fn test_terminal_transition_stamps_completed_at_and_output() {
    let stores = stores().await;
    let runs = stores.runs();
    let run = runs.create(create_run_data("w")).await.unwrap();

    runs.update(
        &run.run_id,
        UpdateRun {
            status: Some(RunStatus::Running),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let completed = runs
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

    assert_eq!(completed.status, RunStatus::Completed);
    assert_eq!(completed.output, Some(json!([{"y": 2}])));
    let stamp = completed.completed_at.expect("completed_at set");

    // Re-asserting the terminal status keeps the original stamp.
    let again = runs
        .update(
            &run.run_id,
            UpdateRun {
                status: Some(RunStatus::Completed),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(again.completed_at, Some(stamp));
}

#[tokio::test]
async fn test_cancel_from_pending_and_idempotent_recancel() {
    let stores = stores().await;
    let runs = stores.runs();
    let run = runs.create(create_run_data("w")).await.unwrap();

    let cancelled = runs.cancel(&run.run_id).await.unwrap();
    assert_eq!(cancelled.status, RunStatus::Cancelled);
    let stamp = cancelled.completed_at.expect("completed_at set");

    let again = runs.cancel(&run.run_id).await.unwrap();
    assert_eq!(again.status, RunStatus::Cancelled);
    assert_eq!(again.completed_at, Some(stamp));

    let err = runs.cancel("wrun_missing").await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_pause_and_resume_cycle() {
    let stores = stores().await;
    let runs = stores.runs();
    let run = runs.create(create_run_data("w")).await.unwrap();

    runs.update(
        &run.run_id,
        UpdateRun {
            status: Some(RunStatus::Running),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let paused = runs.pause(&run.run_id).await.unwrap();
    assert_eq!(paused.status, RunStatus::Paused);

    let resumed = runs.resume(&run.run_id).await.unwrap();
    assert_eq!(resumed.status, RunStatus::Running);

    // Resuming a run that is not paused reads as a missing paused run.
    let err = runs.resume(&run.run_id).await.unwrap_err();
    match err {
        WorldError::NotFound { kind, .. } => assert_eq!(kind, "paused run"),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_pause_pending_run_is_rejected() {
    let stores = stores().await;
    let runs = stores.runs();
    let run = runs.create(create_run_data("w")).await.unwrap();

    // A run that never started has no running leg to pause.
    let err = runs.pause(&run.run_id).await.unwrap_err();
    assert!(err.is_not_found());

    let fetched = runs.get(&run.run_id).await.unwrap();
    assert_eq!(fetched.status, RunStatus::Pending);
    assert!(fetched.started_at.is_none());
}

#[tokio::test]
async fn test_pause_paused_run_is_a_noop() {
    let stores = stores().await;
    let runs = stores.runs();
    let run = runs.create(create_run_data("w")).await.unwrap();

    runs.update(
        &run.run_id,
        UpdateRun {
            status: Some(RunStatus::Running),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    runs.pause(&run.run_id).await.unwrap();

    let again = runs.pause(&run.run_id).await.unwrap();
    assert_eq!(again.status, RunStatus::Paused);
}

#[tokio::test]
async fn test_pause_terminal_run_is_rejected() {
    let stores = stores().await;
    let runs = stores.runs();
    let run = runs.create(create_run_data("w")).await.unwrap();
    runs.cancel(&run.run_id).await.unwrap();

    let err = runs.pause(&run.run_id).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_list_runs_pagination_over_25() {
    let stores = stores().await;
    let runs = stores.runs();
    let mut created = Vec::new();
    for _ in 0..25 {
        created.push(runs.create(create_run_data("w")).await.unwrap());
    }

    let mut collected = Vec::new();
    let mut cursor = None;
    let mut pages = 0;
    loop {
        let page = runs
            .list(ListRunsParams {
                workflow_name: Some("w".into()),
                limit: Some(10),
                cursor: cursor.clone(),
                ..Default::default()
            })
            .await
            .unwrap();
        pages += 1;
        collected.extend(page.items.iter().map(|r| r.run_id.clone()));
        match (page.has_more, page.cursor) {
            (true, Some(next)) => cursor = Some(next),
            (true, None) => panic!("has_more page without a cursor"),
            (false, _) => break,
        }
    }

    assert_eq!(pages, 3);
    assert_eq!(collected.len(), 25);

    // Newest-first, strictly decreasing, no duplicates, same multiset.
    let mut sorted = collected.clone();
    sorted.sort_by(|a, b| b.cmp(a));
    assert_eq!(collected, sorted);
    let mut expected: Vec<String> = created.into_iter().map(|r| r.run_id).collect();
    expected.sort_by(|a, b| b.cmp(a));
    assert_eq!(collected, expected);
}

#[tokio::test]
async fn test_list_runs_filters() {
    let stores = stores().await;
    let runs = stores.runs();
    let run_a = runs.create(create_run_data("alpha")).await.unwrap();
    let _run_b = runs.create(create_run_data("beta")).await.unwrap();
    runs.cancel(&run_a.run_id).await.unwrap();

    let by_name = runs
        .list(ListRunsParams {
            workflow_name: Some("alpha".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(by_name.items.len(), 1);
    assert_eq!(by_name.items[0].run_id, run_a.run_id);

    let by_status = runs
        .list(ListRunsParams {
            status: Some(RunStatus::Cancelled),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(by_status.items.len(), 1);
    assert_eq!(by_status.items[0].run_id, run_a.run_id);
}

// ============================================
// Steps
// ============================================

#[tokio::test]
async fn test_step_create_is_idempotent_by_step_id() {
    let stores = stores().await;
    let run = stores.runs().create(create_run_data("w")).await.unwrap();
    let steps = stores.steps();

    let data = CreateStep {
        run_id: run.run_id.clone(),
        step_id: Some("wstp_fixed".into()),
        step_name: "fetch".into(),
        input: json!([1, 2]),
        attempt: Some(1),
    };

    let first = steps.create(data.clone()).await.unwrap();
    let second = steps.create(data).await.unwrap();

    assert_eq!(first.step_id, "wstp_fixed");
    assert_eq!(second.step_id, "wstp_fixed");
    assert_eq!(second.created_at, first.created_at);

    let page = steps.list(&run.run_id, ListParams::default()).await.unwrap();
    assert_eq!(page.items.len(), 1);
}

#[tokio::test]
async fn test_step_update_stamping_rules() {
    let stores = stores().await;
    let run = stores.runs().create(create_run_data("w")).await.unwrap();
    let steps = stores.steps();

    let step = steps
        .create(CreateStep {
            run_id: run.run_id.clone(),
            step_id: None,
            step_name: "compute".into(),
            input: json!([]),
            attempt: None,
        })
        .await
        .unwrap();
    assert_eq!(step.status, StepStatus::Pending);
    assert_eq!(step.attempt, 1);

    let running = steps
        .update(
            &step.step_id,
            UpdateStep {
                status: Some(StepStatus::Running),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(running.started_at.is_some());
    assert!(running.completed_at.is_none());

    let failed = steps
        .update(
            &step.step_id,
            UpdateStep {
                status: Some(StepStatus::Failed),
                error: Some("boom".into()),
                error_code: Some("E_BOOM".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(failed.status, StepStatus::Failed);
    assert!(failed.completed_at.is_some());
    assert_eq!(failed.error.as_deref(), Some("boom"));
    assert_eq!(failed.error_code.as_deref(), Some("E_BOOM"));
}

#[tokio::test]
async fn test_step_update_missing_is_not_found() {
    let stores = stores().await;
    let err = stores
        .steps()
        .update("wstp_missing", UpdateStep::default())
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

// ============================================
// Events
// ============================================

#[tokio::test]
async fn test_events_append_and_list_both_orders() {
    let stores = stores().await;
    let run = stores.runs().create(create_run_data("w")).await.unwrap();
    let events = stores.events();

    for i in 0..3 {
        events
            .create(CreateEvent {
                run_id: run.run_id.clone(),
                event_type: format!("step.{i}"),
                correlation_id: Some("corr-1".into()),
                event_data: json!({"i": i}),
            })
            .await
            .unwrap();
    }

    let asc = events
        .list(&run.run_id, ListEventsParams::default())
        .await
        .unwrap();
    assert_eq!(asc.items.len(), 3);
    assert!(asc.items.windows(2).all(|w| w[0].event_id < w[1].event_id));
    assert_eq!(asc.items[0].event_type, "step.0");

    let desc = events
        .list(
            &run.run_id,
            ListEventsParams {
                sort_order: SortOrder::Desc,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(desc.items[0].event_type, "step.2");

    let by_correlation = events
        .list_by_correlation_id("corr-1", ListEventsParams::default())
        .await
        .unwrap();
    assert_eq!(by_correlation.items.len(), 3);

    let none = events
        .list_by_correlation_id("corr-unknown", ListEventsParams::default())
        .await
        .unwrap();
    assert!(none.items.is_empty());
    assert!(!none.has_more);
}

#[tokio::test]
async fn test_event_cursor_pagination() {
    let stores = stores().await;
    let run = stores.runs().create(create_run_data("w")).await.unwrap();
    let events = stores.events();

    for i in 0..5 {
        events
            .create(CreateEvent {
                run_id: run.run_id.clone(),
                event_type: format!("e{i}"),
                correlation_id: None,
                event_data: json!({}),
            })
            .await
            .unwrap();
    }

    let first = events
        .list(
            &run.run_id,
            ListEventsParams {
                limit: Some(2),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(first.items.len(), 2);
    assert!(first.has_more);

    let second = events
        .list(
            &run.run_id,
            ListEventsParams {
                limit: Some(2),
                cursor: first.cursor.clone(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(second.items.len(), 2);
    assert!(second.items[0].event_id > first.items[1].event_id);
}

// ============================================
// Hooks
// ============================================

#[tokio::test]
async fn test_hook_lifecycle() {
    let stores = stores().await;
    let run = stores.runs().create(create_run_data("w")).await.unwrap();
    let hooks = stores.hooks();

    let hook = hooks
        .create(CreateHook {
            hook_id: Some("whook_fixed".into()),
            run_id: run.run_id.clone(),
            token: "tok-123".into(),
            owner_id: "owner-1".into(),
            project_id: "proj-1".into(),
            environment: "test".into(),
            metadata: Some(json!({"kind": "callback"})),
        })
        .await
        .unwrap();
    assert_eq!(hook.hook_id, "whook_fixed");
    assert_eq!(hook.environment, "test");

    // Duplicate hook id is a conflict.
    let err = hooks
        .create(CreateHook {
            hook_id: Some("whook_fixed".into()),
            run_id: run.run_id.clone(),
            token: "tok-456".into(),
            owner_id: "owner-1".into(),
            project_id: "proj-1".into(),
            environment: "test".into(),
            metadata: None,
        })
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    let by_token = hooks.get_by_token("tok-123").await.unwrap();
    assert_eq!(by_token.hook_id, "whook_fixed");

    let err = hooks.get_by_token("tok-unknown").await.unwrap_err();
    assert!(err.is_not_found());

    let disposed = hooks.dispose("whook_fixed").await.unwrap();
    assert_eq!(disposed.token, "tok-123");

    let err = hooks.dispose("whook_fixed").await.unwrap_err();
    assert!(err.is_not_found());
}
