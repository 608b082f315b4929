//! Integration tests for the task state machine against a real database.
//!
//! Each test creates a unique temporary database via `mineru-test-utils`,
//! runs migrations, and drops it on completion.

use mineru_core::state::dispatch;
use mineru_core::state::TaskStateMachine;
use mineru_db::models::TaskStatus;
use mineru_db::queries::tasks as db;
use mineru_test_utils::{create_test_db, drop_test_db};

async fn submit_task(pool: &sqlx::PgPool, name: &str, max_retries: i32) -> mineru_db::models::Task {
    db::insert_task(
        pool,
        &db::NewTask {
            owner_user_id: "alice",
            file_name: name,
            file_path: "/tmp/doc.pdf",
            backend: "default",
            options: serde_json::json!({}),
            priority: 0,
            max_retries,
        },
    )
    .await
    .expect("failed to insert test task")
}

#[test]
fn valid_transitions_accepted() {
    let valid = [
        (TaskStatus::Pending, TaskStatus::Processing),
        (TaskStatus::Processing, TaskStatus::Completed),
        (TaskStatus::Processing, TaskStatus::Failed),
        (TaskStatus::Processing, TaskStatus::Cancelled),
        (TaskStatus::Pending, TaskStatus::Cancelled),
        (TaskStatus::Failed, TaskStatus::Pending),
    ];
    for (from, to) in &valid {
        assert!(
            TaskStateMachine::is_valid_transition(*from, *to),
            "expected {from} -> {to} to be valid"
        );
    }
}

#[test]
fn invalid_transitions_rejected() {
    let invalid = [
        (TaskStatus::Pending, TaskStatus::Completed),
        (TaskStatus::Pending, TaskStatus::Failed),
        (TaskStatus::Processing, TaskStatus::Pending),
        (TaskStatus::Completed, TaskStatus::Pending),
        (TaskStatus::Completed, TaskStatus::Failed),
        (TaskStatus::Cancelled, TaskStatus::Pending),
        (TaskStatus::Failed, TaskStatus::Completed),
        (TaskStatus::Failed, TaskStatus::Cancelled),
    ];
    for (from, to) in &invalid {
        assert!(
            !TaskStateMachine::is_valid_transition(*from, *to),
            "expected {from} -> {to} to be invalid"
        );
    }
}

#[tokio::test]
async fn happy_path_full_lifecycle() {
    let (pool, db_name) = create_test_db().await;
    let task = submit_task(&pool, "lifecycle.pdf", 3).await;

    dispatch::start_task(&pool, task.task_id).await.expect("start should succeed");
    let t = db::get_task(&pool, task.task_id).await.unwrap().unwrap();
    assert_eq!(t.status, TaskStatus::Processing);
    assert!(t.started_at.is_some());

    dispatch::complete_task(&pool, task.task_id).await.expect("complete should succeed");
    let t = db::get_task(&pool, task.task_id).await.unwrap().unwrap();
    assert_eq!(t.status, TaskStatus::Completed);
    assert!(t.completed_at.is_some());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn failure_and_retry_lifecycle() {
    let (pool, db_name) = create_test_db().await;
    let task = submit_task(&pool, "retry.pdf", 3).await;

    dispatch::start_task(&pool, task.task_id).await.unwrap();
    dispatch::fail_task(&pool, task.task_id).await.unwrap();

    let t = db::get_task(&pool, task.task_id).await.unwrap().unwrap();
    assert_eq!(t.status, TaskStatus::Failed);
    assert!(t.completed_at.is_some());

    dispatch::retry_task(&pool, task.task_id).await.unwrap();
    let t = db::get_task(&pool, task.task_id).await.unwrap().unwrap();
    assert_eq!(t.status, TaskStatus::Pending);
    assert_eq!(t.retry_count, 1);
    assert!(t.started_at.is_none(), "started_at should be cleared on retry");
    assert!(t.completed_at.is_none(), "completed_at should be cleared on retry");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn invalid_transition_rejected_at_db_level() {
    let (pool, db_name) = create_test_db().await;
    let task = submit_task(&pool, "invalid.pdf", 3).await;

    let result =
        TaskStateMachine::transition(&pool, task.task_id, TaskStatus::Pending, TaskStatus::Completed)
            .await;
    assert!(result.is_err(), "pending -> completed should fail");
    let err_msg = format!("{}", result.unwrap_err());
    assert!(err_msg.contains("invalid state transition"), "{err_msg}");

    let t = db::get_task(&pool, task.task_id).await.unwrap().unwrap();
    assert_eq!(t.status, TaskStatus::Pending);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn optimistic_lock_prevents_double_transition() {
    let (pool, db_name) = create_test_db().await;
    let task = submit_task(&pool, "double.pdf", 3).await;

    dispatch::start_task(&pool, task.task_id).await.unwrap();

    let result = dispatch::start_task(&pool, task.task_id).await;
    assert!(result.is_err(), "double start should fail");
    let err_msg = format!("{}", result.unwrap_err());
    assert!(err_msg.contains("optimistic lock failed"), "{err_msg}");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn retry_respects_max_retries() {
    let (pool, db_name) = create_test_db().await;
    // max_retries = 2 means retry_count 0 and 1 may retry; at 2 it is exhausted.
    let task = submit_task(&pool, "retry-max.pdf", 2).await;

    for expected_retry_count in 1..=2 {
        dispatch::start_task(&pool, task.task_id).await.unwrap();
        dispatch::fail_task(&pool, task.task_id).await.unwrap();
        dispatch::retry_task(&pool, task.task_id).await.unwrap();
        let t = db::get_task(&pool, task.task_id).await.unwrap().unwrap();
        assert_eq!(t.retry_count, expected_retry_count);
    }

    dispatch::start_task(&pool, task.task_id).await.unwrap();
    dispatch::fail_task(&pool, task.task_id).await.unwrap();

    let result = dispatch::retry_task(&pool, task.task_id).await;
    assert!(result.is_err(), "retry beyond max_retries should fail");
    let err_msg = format!("{}", result.unwrap_err());
    assert!(err_msg.contains("max_retries"), "{err_msg}");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn cancel_pending_and_processing_tasks() {
    let (pool, db_name) = create_test_db().await;

    let pending = submit_task(&pool, "cancel-pending.pdf", 3).await;
    dispatch::cancel_pending_task(&pool, pending.task_id).await.unwrap();
    let t = db::get_task(&pool, pending.task_id).await.unwrap().unwrap();
    assert_eq!(t.status, TaskStatus::Cancelled);

    let processing = submit_task(&pool, "cancel-processing.pdf", 3).await;
    dispatch::start_task(&pool, processing.task_id).await.unwrap();
    dispatch::cancel_processing_task(&pool, processing.task_id).await.unwrap();
    let t = db::get_task(&pool, processing.task_id).await.unwrap().unwrap();
    assert_eq!(t.status, TaskStatus::Cancelled);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn concurrent_transitions_handled_safely() {
    let (pool, db_name) = create_test_db().await;
    let task = submit_task(&pool, "concurrent.pdf", 3).await;

    let pool2 = pool.clone();
    let task_id = task.task_id;
    let handle1 = tokio::spawn(async move { dispatch::start_task(&pool2, task_id).await });
    let pool3 = pool.clone();
    let handle2 = tokio::spawn(async move { dispatch::start_task(&pool3, task_id).await });

    let result1 = handle1.await.unwrap();
    let result2 = handle2.await.unwrap();

    let successes = [result1.is_ok(), result2.is_ok()].iter().filter(|x| **x).count();
    assert_eq!(successes, 1, "exactly one concurrent transition should succeed");

    let t = db::get_task(&pool, task.task_id).await.unwrap().unwrap();
    assert_eq!(t.status, TaskStatus::Processing);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn task_not_found_gives_clear_error() {
    let (pool, db_name) = create_test_db().await;

    let fake_id = uuid::Uuid::new_v4();
    let result =
        TaskStateMachine::transition(&pool, fake_id, TaskStatus::Pending, TaskStatus::Processing)
            .await;

    assert!(result.is_err());
    let err_msg = format!("{}", result.unwrap_err());
    assert!(err_msg.contains("not found"), "{err_msg}");

    pool.close().await;
    drop_test_db(&db_name).await;
}
