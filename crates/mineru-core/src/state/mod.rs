//! Task state machine transitions.
//!
//! Validates and executes state transitions for tasks, enforcing the
//! allowed transition graph, optimistic locking, timestamp management,
//! and retry limits.

pub mod dispatch;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use mineru_db::models::TaskStatus;
use mineru_db::queries::tasks as db;
use sqlx::PgPool;
use uuid::Uuid;

/// The task state machine.
///
/// Enforces the valid transition graph:
///
/// ```text
/// pending    -> processing
/// processing -> completed
/// processing -> failed
/// processing -> cancelled
/// pending    -> cancelled
/// failed     -> pending    (retry, while attempts remain)
/// ```
pub struct TaskStateMachine;

impl TaskStateMachine {
    /// Check whether a transition from `from` to `to` is a valid edge
    /// in the state graph.
    pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
        matches!(
            (from, to),
            (TaskStatus::Pending, TaskStatus::Processing)
                | (TaskStatus::Processing, TaskStatus::Completed)
                | (TaskStatus::Processing, TaskStatus::Failed)
                | (TaskStatus::Processing, TaskStatus::Cancelled)
                | (TaskStatus::Pending, TaskStatus::Cancelled)
                | (TaskStatus::Failed, TaskStatus::Pending)
        )
    }

    /// Execute a state transition with optimistic locking.
    ///
    /// - Validates the transition is legal.
    /// - Sets `completed_at` when transitioning to a terminal state
    ///   (`completed`, `failed`, `cancelled`).
    /// - For `failed -> pending` (retry), delegates to
    ///   [`Self::retry_transition`], which also increments `retry_count`
    ///   and enforces the retry cap.
    ///
    /// Returns an error if:
    /// - The transition is not valid.
    /// - The current status in the database does not match `from`
    ///   (optimistic lock failure).
    /// - The task does not exist.
    pub async fn transition(
        pool: &PgPool,
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    ) -> Result<()> {
        if !Self::is_valid_transition(from, to) {
            bail!(
                "invalid state transition: {} -> {} for task {}",
                from,
                to,
                task_id
            );
        }

        if from == TaskStatus::Failed && to == TaskStatus::Pending {
            return Self::retry_transition(pool, task_id).await;
        }

        let completed_at = matches!(
            to,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
        .then(Utc::now);

        let rows = db::transition_task_status(pool, task_id, from, to, completed_at)
            .await
            .with_context(|| {
                format!(
                    "failed to transition task {} from {} to {}",
                    task_id, from, to
                )
            })?;

        if rows == 0 {
            let task = db::get_task(pool, task_id).await?;
            match task {
                None => bail!("task {} not found", task_id),
                Some(t) => bail!(
                    "optimistic lock failed: task {} has status {}, expected {}",
                    task_id,
                    t.status,
                    from
                ),
            }
        }

        Ok(())
    }

    /// Handle the `failed -> pending` retry transition.
    ///
    /// Fetches the task to check `retry_count` against `max_retries`,
    /// then atomically increments `retry_count` and resets the status
    /// so the task can be claimed again.
    async fn retry_transition(pool: &PgPool, task_id: Uuid) -> Result<()> {
        let task = db::get_task(pool, task_id)
            .await?
            .with_context(|| format!("task {} not found", task_id))?;

        if task.status != TaskStatus::Failed {
            bail!(
                "cannot retry task {}: current status is {}, expected failed",
                task_id,
                task.status
            );
        }

        if task.retry_count >= task.max_retries {
            bail!(
                "cannot retry task {}: retry_count {} >= max_retries {}",
                task_id,
                task.retry_count,
                task.max_retries
            );
        }

        let rows = db::transition_task_retry(pool, task_id, task.retry_count).await?;

        if rows == 0 {
            bail!(
                "optimistic lock failed on retry for task {} (retry_count {})",
                task_id,
                task.retry_count
            );
        }

        Ok(())
    }
}
