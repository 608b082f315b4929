//! Worker runtime: the pull-based loop that claims tasks and hands them
//! to an [`EngineAdapter`].
//!
//! One worker is bound to a single backend/device slot and runs as a
//! long-lived `tokio` task. It polls the store for claimable work, runs
//! the configured engine, and reports the outcome back through the
//! state machine, classifying engine failures as retryable or terminal.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use mineru_db::models::Task;
use mineru_db::queries::tasks as db;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::{CancelSignal, EngineError, EngineRegistry};

/// Bound a worker to a backend, device, and pacing.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub backend: String,
    /// Device slot this worker process/task is pinned to (e.g. a GPU
    /// index), recorded for logging and worker identity only -- it does
    /// not affect which tasks `claim_next` considers eligible.
    pub device: Option<String>,
    pub poll_interval: Duration,
    pub output_root: PathBuf,
}

impl CancelSignal for CancellationToken {
    fn is_cancelled(&self) -> bool {
        CancellationToken::is_cancelled(self)
    }
}

/// Run the worker loop until `cancel` fires.
///
/// On cancellation the loop finishes any task it is currently running
/// (the engine adapter is given the same token so it can bail out early)
/// then returns.
pub async fn run_worker(
    pool: PgPool,
    registry: Arc<EngineRegistry>,
    config: WorkerConfig,
    cancel: CancellationToken,
) {
    info!(
        worker_id = %config.worker_id,
        backend = %config.backend,
        device = ?config.device,
        "worker starting"
    );

    loop {
        if cancel.is_cancelled() {
            break;
        }

        match db::claim_next(&pool, &config.worker_id, &config.backend).await {
            Ok(Some(task)) => {
                run_task(&pool, &registry, &config, &task, &cancel).await;
            }
            Ok(None) => {
                tokio::select! {
                    _ = tokio::time::sleep(config.poll_interval) => {}
                    _ = cancel.cancelled() => break,
                }
            }
            Err(e) => {
                warn!(worker_id = %config.worker_id, error = %e, "claim_next failed, backing off");
                tokio::select! {
                    _ = tokio::time::sleep(config.poll_interval) => {}
                    _ = cancel.cancelled() => break,
                }
            }
        }
    }

    info!(worker_id = %config.worker_id, "worker stopped");
}

/// Run a single claimed task to completion (or failure), recording the
/// outcome via the task store.
///
/// Cancellation is cooperative at two levels: `worker_cancel` fires on
/// worker shutdown, and a background watcher polls the store for the
/// task's own `cancel_requested` flag (set by [`crate::queue::QueueService::cancel`]
/// when a caller cancels a task that's already `processing`). Both feed
/// into a single per-task token the engine is given, so an adapter only
/// has to check one signal.
async fn run_task(
    pool: &PgPool,
    registry: &EngineRegistry,
    config: &WorkerConfig,
    task: &Task,
    worker_cancel: &CancellationToken,
) {
    let task_id = task.task_id;
    let output_dir = config.output_root.join(task_id.to_string());

    debug!(task_id = %task_id, backend = %task.backend, worker_id = %config.worker_id, "claimed task");

    let Some(engine) = registry.get(&task.backend) else {
        warn!(task_id = %task_id, backend = %task.backend, "no engine registered for backend");
        fail(pool, task_id, "no engine registered for this backend").await;
        return;
    };

    let task_cancel = worker_cancel.child_token();
    let watcher = spawn_cancel_watcher(pool.clone(), task_id, config.poll_interval, task_cancel.clone());

    let input = Path::new(&task.file_path);
    let outcome = engine.parse(input, &task.options, &output_dir, &task_cancel).await;
    task_cancel.cancel();
    watcher.abort();

    match outcome {
        Ok(parsed) => {
            let markdown_file = output_dir.join(&parsed.markdown_rel_path);
            let json_file = parsed.json_rel_path.map(|p| output_dir.join(p));

            let rows = db::complete_task(
                pool,
                task_id,
                output_dir.to_string_lossy().as_ref(),
                markdown_file.to_string_lossy().as_ref(),
                json_file.as_ref().map(|p| p.to_string_lossy()).as_deref(),
            )
            .await;

            match rows {
                Ok(n) if n > 0 => {
                    info!(task_id = %task_id, worker_id = %config.worker_id, "task completed");
                }
                Ok(_) => {
                    warn!(task_id = %task_id, "complete_task affected no rows (already terminal?)");
                }
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "failed to record task completion");
                }
            }
        }
        Err(EngineError::Transient(msg)) if task_cancel.is_cancelled() => {
            info!(task_id = %task_id, reason = %msg, "task cancelled during engine run");
            if let Err(e) = crate::state::dispatch::cancel_processing_task(pool, task_id).await {
                warn!(task_id = %task_id, error = %e, "failed to record task cancellation");
            }
        }
        Err(EngineError::Transient(msg)) => {
            warn!(task_id = %task_id, error = %msg, "engine reported a transient failure");
            fail_and_maybe_retry(pool, task_id, &msg).await;
        }
        Err(EngineError::Permanent(msg)) => {
            warn!(task_id = %task_id, error = %msg, "engine reported a permanent failure");
            fail(pool, task_id, &msg).await;
        }
    }
}

/// Poll the store for `task_id`'s `cancel_requested` flag, firing `token`
/// the moment it's set (or the task disappears/leaves `processing`).
/// Aborted by the caller once the engine call returns.
fn spawn_cancel_watcher(
    pool: PgPool,
    task_id: Uuid,
    poll_interval: Duration,
    token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if token.is_cancelled() {
                return;
            }
            match db::get_task(&pool, task_id).await {
                Ok(Some(t)) if t.cancel_requested => {
                    token.cancel();
                    return;
                }
                Ok(Some(t)) if t.status != mineru_db::models::TaskStatus::Processing => return,
                Ok(Some(_)) => {}
                Ok(None) => return,
                Err(_) => {}
            }
            tokio::time::sleep(poll_interval).await;
        }
    })
}

async fn fail(pool: &PgPool, task_id: Uuid, message: &str) {
    if let Err(e) = db::fail_task(pool, task_id, message).await {
        warn!(task_id = %task_id, error = %e, "failed to record task failure");
    }
}

/// Record a transient failure, then immediately attempt the `failed ->
/// pending` retry transition if the task still has budget left. This
/// keeps transient errors from waiting for the next maintenance tick.
async fn fail_and_maybe_retry(pool: &PgPool, task_id: Uuid, message: &str) {
    fail(pool, task_id, message).await;

    match db::get_task(pool, task_id).await {
        Ok(Some(task)) if task.retry_count < task.max_retries => {
            if let Err(e) = crate::state::dispatch::retry_task(pool, task_id).await {
                debug!(task_id = %task_id, error = %e, "retry-on-transient-failure did not apply");
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_token_implements_cancel_signal() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(CancelSignal::is_cancelled(&token));
    }
}
