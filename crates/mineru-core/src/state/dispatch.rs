//! Convenience dispatch helpers that wrap [`super::TaskStateMachine`]
//! transitions with semantic names.

use anyhow::Result;
use mineru_db::models::TaskStatus;
use sqlx::PgPool;
use uuid::Uuid;

use super::TaskStateMachine;

/// Start processing a claimed task: transition `pending -> processing`.
///
/// Claiming itself is done by [`mineru_db::queries::tasks::claim_next`],
/// which already sets the status atomically; this helper exists for
/// callers that already hold a task known to be `pending` (e.g. tests).
pub async fn start_task(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::Pending, TaskStatus::Processing).await
}

/// Mark a task as completed: transition `processing -> completed`.
///
/// Sets `completed_at` to the current timestamp.
pub async fn complete_task(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::Processing, TaskStatus::Completed)
        .await
}

/// Mark a task as failed: transition `processing -> failed`.
///
/// Sets `completed_at` to the current timestamp.
pub async fn fail_task(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::Processing, TaskStatus::Failed).await
}

/// Cancel a task that has not started running yet: `pending -> cancelled`.
pub async fn cancel_pending_task(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::Pending, TaskStatus::Cancelled).await
}

/// Cancel a task that is currently running: `processing -> cancelled`.
pub async fn cancel_processing_task(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::Processing, TaskStatus::Cancelled)
        .await
}

/// Retry a failed task: transition `failed -> pending`.
///
/// Increments `retry_count`. Fails if `retry_count >= max_retries`.
pub async fn retry_task(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::Failed, TaskStatus::Pending).await
}
