//! Database query functions for the `tasks` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Task, TaskStatus};

/// Parameters for inserting a new task. Kept separate from the [`Task`] row
/// struct since most fields (id, status, timestamps, retry_count) are
/// server-generated.
pub struct NewTask<'a> {
    pub owner_user_id: &'a str,
    pub file_name: &'a str,
    pub file_path: &'a str,
    pub backend: &'a str,
    pub options: serde_json::Value,
    pub priority: i32,
    pub max_retries: i32,
}

/// Insert a new task row, returning it with server-generated defaults
/// (`task_id`, `created_at`, `status = pending`, `retry_count = 0`).
pub async fn insert_task(pool: &PgPool, new_task: &NewTask<'_>) -> Result<Task> {
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks \
            (owner_user_id, file_name, file_path, backend, options, priority, max_retries) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         RETURNING *",
    )
    .bind(new_task.owner_user_id)
    .bind(new_task.file_name)
    .bind(new_task.file_path)
    .bind(new_task.backend)
    .bind(&new_task.options)
    .bind(new_task.priority)
    .bind(new_task.max_retries)
    .fetch_one(pool)
    .await
    .context("failed to insert task")?;

    Ok(task)
}

/// Fetch a single task by ID.
pub async fn get_task(pool: &PgPool, task_id: Uuid) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE task_id = $1")
        .bind(task_id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// Atomically claim the next eligible pending task for a worker.
///
/// Eligibility and ordering follow the dequeue contract: highest
/// `priority` first, then oldest `created_at`, then `task_id` as a final
/// tie-break. `FOR UPDATE SKIP LOCKED` lets multiple workers poll
/// concurrently without blocking on each other or double-claiming a row.
pub async fn claim_next(pool: &PgPool, worker_id: &str, backend: &str) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>(
        "UPDATE tasks SET status = 'processing', worker_id = $1, started_at = NOW() \
         WHERE task_id = ( \
             SELECT task_id FROM tasks \
             WHERE status = 'pending' AND backend = $2 \
             ORDER BY priority DESC, created_at ASC, task_id ASC \
             FOR UPDATE SKIP LOCKED \
             LIMIT 1 \
         ) \
         RETURNING *",
    )
    .bind(worker_id)
    .bind(backend)
    .fetch_optional(pool)
    .await
    .context("failed to claim next task")?;

    Ok(task)
}

/// Mark a task `completed`, recording its output artifact locations.
pub async fn complete_task(
    pool: &PgPool,
    task_id: Uuid,
    result_dir: &str,
    markdown_file: &str,
    json_file: Option<&str>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'completed', completed_at = NOW(), \
             result_dir = $1, markdown_file = $2, json_file = $3 \
         WHERE task_id = $4 AND status = 'processing'",
    )
    .bind(result_dir)
    .bind(markdown_file)
    .bind(json_file)
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to complete task")?;

    Ok(result.rows_affected())
}

/// Mark a task `failed`, recording the error message.
pub async fn fail_task(pool: &PgPool, task_id: Uuid, error_message: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'failed', completed_at = NOW(), error_message = $1 \
         WHERE task_id = $2 AND status = 'processing'",
    )
    .bind(error_message)
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to fail task")?;

    Ok(result.rows_affected())
}

/// Cancel a task that is still `pending`. A `processing` task cannot be
/// cancelled directly -- see [`request_cancellation`].
pub async fn cancel_task(pool: &PgPool, task_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'cancelled', completed_at = NOW() \
         WHERE task_id = $1 AND status = 'pending'",
    )
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to cancel task")?;

    Ok(result.rows_affected())
}

/// Record a cancellation request against a `processing` task. This does
/// not change `status` -- the worker running the task observes the flag
/// and performs the `processing -> cancelled` transition itself.
pub async fn request_cancellation(pool: &PgPool, task_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET cancel_requested = TRUE \
         WHERE task_id = $1 AND status = 'processing'",
    )
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to request task cancellation")?;

    Ok(result.rows_affected())
}

/// Transition a task between two statuses, with the `from` status as an
/// optimistic-lock precondition. Used by [`crate::models`]-level callers
/// (the state machine) for transitions not covered by the claim/complete/
/// fail/cancel helpers above, e.g. `pending -> cancelled`.
pub async fn transition_task_status(
    pool: &PgPool,
    task_id: Uuid,
    from: TaskStatus,
    to: TaskStatus,
    completed_at: Option<DateTime<Utc>>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = $1, completed_at = COALESCE($2, completed_at) \
         WHERE task_id = $3 AND status = $4",
    )
    .bind(to)
    .bind(completed_at)
    .bind(task_id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to transition task status")?;

    Ok(result.rows_affected())
}

/// Atomically transition a task from `failed` to `pending` (retry),
/// incrementing `retry_count` and clearing terminal-state fields. Uses
/// optimistic locking on both status and the current `retry_count`.
pub async fn transition_task_retry(pool: &PgPool, task_id: Uuid, current_retry_count: i32) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'pending', \
             retry_count = retry_count + 1, \
             worker_id = NULL, \
             started_at = NULL, \
             completed_at = NULL, \
             error_message = NULL \
         WHERE task_id = $1 AND status = 'failed' AND retry_count = $2",
    )
    .bind(task_id)
    .bind(current_retry_count)
    .execute(pool)
    .await
    .context("failed to retry task")?;

    Ok(result.rows_affected())
}

/// Reset stale `processing` tasks (those whose `started_at` is older than
/// `threshold`) back to `pending` for retry, or straight to `failed` (with
/// a "stale" error) once their retry budget is exhausted.
///
/// Returns the tasks that were touched, in their post-reset state.
pub async fn reset_stale(pool: &PgPool, threshold: chrono::Duration) -> Result<Vec<Task>> {
    let cutoff = Utc::now() - threshold;

    let retried = sqlx::query_as::<_, Task>(
        "UPDATE tasks \
         SET status = 'pending', \
             retry_count = retry_count + 1, \
             worker_id = NULL, \
             started_at = NULL \
         WHERE status = 'processing' \
           AND started_at < $1 \
           AND retry_count < max_retries \
         RETURNING *",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await
    .context("failed to reset stale tasks for retry")?;

    let failed = sqlx::query_as::<_, Task>(
        "UPDATE tasks \
         SET status = 'failed', \
             completed_at = NOW(), \
             error_message = 'stale: exceeded retry budget after timeout' \
         WHERE status = 'processing' \
           AND started_at < $1 \
           AND retry_count >= max_retries \
         RETURNING *",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await
    .context("failed to fail stale tasks past retry budget")?;

    Ok(retried.into_iter().chain(failed).collect())
}

/// Delete terminal-state tasks (`completed`, `failed`, `cancelled`) older
/// than `retention_days`. Returns the deleted rows so the caller can also
/// remove their artifact directories from disk.
pub async fn purge_old(pool: &PgPool, retention_days: i64) -> Result<Vec<Task>> {
    let cutoff = Utc::now() - chrono::Duration::days(retention_days);

    let deleted = sqlx::query_as::<_, Task>(
        "DELETE FROM tasks \
         WHERE status IN ('completed', 'failed', 'cancelled') \
           AND completed_at < $1 \
         RETURNING *",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await
    .context("failed to purge old tasks")?;

    Ok(deleted)
}

/// Aggregate queue statistics, broken down by status.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub total: i64,
}

/// Get a summary of task counts by status across the whole queue.
pub async fn stats(pool: &PgPool) -> Result<QueueStats> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT status::text, COUNT(*) as cnt FROM tasks GROUP BY status")
            .fetch_all(pool)
            .await
            .context("failed to get queue stats")?;

    let mut stats = QueueStats::default();
    for (status, count) in &rows {
        match status.as_str() {
            "pending" => stats.pending = *count,
            "processing" => stats.processing = *count,
            "completed" => stats.completed = *count,
            "failed" => stats.failed = *count,
            "cancelled" => stats.cancelled = *count,
            _ => {}
        }
        stats.total += count;
    }
    Ok(stats)
}

/// Paginated task listing, optionally scoped to a single owner and/or
/// filtered by status. `limit`/`offset` are the caller's responsibility to
/// clamp to sane bounds. Ordered most-recent-first -- this is a browsing
/// view, not the dequeue order `claim_next` uses.
pub async fn list_tasks(
    pool: &PgPool,
    owner_user_id: Option<&str>,
    status: Option<TaskStatus>,
    limit: i64,
    offset: i64,
) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE ($1::text IS NULL OR owner_user_id = $1) \
           AND ($2::text IS NULL OR status::text = $2) \
         ORDER BY created_at DESC \
         LIMIT $3 OFFSET $4",
    )
    .bind(owner_user_id)
    .bind(status.map(|s| s.to_string()))
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
    .context("failed to list tasks")?;

    Ok(tasks)
}
