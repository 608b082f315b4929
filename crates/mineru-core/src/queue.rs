//! Queue service: principal-scoped, typed-error wrapper over the task
//! store.
//!
//! This is the boundary every caller (the API facade, the CLI, the
//! worker's completion path) goes through: it translates `mineru-db`'s
//! `anyhow::Result` into [`CoreError`] and enforces who may see or touch
//! which tasks.

use std::collections::HashSet;

use mineru_db::models::{Task, TaskStatus};
use mineru_db::queries::tasks::{self as db, NewTask, QueueStats};
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::CoreError;
use crate::principal::{Permission, Principal};

/// Defaults the service applies when a caller doesn't specify one.
#[derive(Debug, Clone)]
pub struct QueueDefaults {
    pub default_priority: i32,
    pub default_max_retries: i32,
}

impl Default for QueueDefaults {
    fn default() -> Self {
        Self {
            default_priority: 0,
            default_max_retries: 3,
        }
    }
}

/// What happened to a task as a result of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The task was `pending` and is now `cancelled`.
    Cancelled,
    /// The task was `processing`; a cancellation request was recorded and
    /// the worker running it will observe it and transition to
    /// `cancelled` on its own.
    CancellationRequested,
}

pub struct QueueService {
    pool: PgPool,
    defaults: QueueDefaults,
    /// Backend names `submit` will accept. Empty means no allow-list is
    /// enforced (any non-empty backend string is accepted).
    known_backends: HashSet<String>,
}

/// Parameters for submitting a new task, as gathered from the facade's
/// multipart body or the CLI.
pub struct SubmitRequest<'a> {
    pub file_name: &'a str,
    pub file_path: &'a str,
    pub backend: &'a str,
    pub options: serde_json::Value,
    pub priority: Option<i32>,
    pub max_retries: Option<i32>,
}

impl QueueService {
    pub fn new(
        pool: PgPool,
        defaults: QueueDefaults,
        known_backends: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            pool,
            defaults,
            known_backends: known_backends.into_iter().map(|b| Self::normalize_backend(&b)).collect(),
        }
    }

    fn normalize_backend(backend: &str) -> String {
        backend.trim().to_lowercase()
    }

    /// Enqueue a new task owned by `principal`.
    pub async fn submit(
        &self,
        principal: &Principal,
        req: SubmitRequest<'_>,
    ) -> Result<Task, CoreError> {
        if !principal.has(Permission::TaskSubmit) {
            return Err(CoreError::PermissionDenied {
                user_id: principal.user_id.clone(),
                action: "submit tasks".to_string(),
            });
        }
        if req.file_name.trim().is_empty() {
            return Err(CoreError::InvalidInput("file_name must not be empty".to_string()));
        }
        if req.backend.trim().is_empty() {
            return Err(CoreError::InvalidInput("backend must not be empty".to_string()));
        }

        let backend = Self::normalize_backend(req.backend);
        if !self.known_backends.is_empty() && !self.known_backends.contains(&backend) {
            return Err(CoreError::InvalidInput(format!("unknown backend: {backend}")));
        }

        let new_task = NewTask {
            owner_user_id: &principal.user_id,
            file_name: req.file_name,
            file_path: req.file_path,
            backend: &backend,
            options: req.options,
            priority: req.priority.unwrap_or(self.defaults.default_priority),
            max_retries: req.max_retries.unwrap_or(self.defaults.default_max_retries),
        };

        let task = db::insert_task(&self.pool, &new_task)
            .await
            .map_err(CoreError::from_store_error)?;

        info!(task_id = %task.task_id, backend = %backend, "task submitted");
        Ok(task)
    }

    /// Fetch a task, enforcing owner-or-global-view access.
    pub async fn get(&self, principal: &Principal, task_id: Uuid) -> Result<Task, CoreError> {
        let task = db::get_task(&self.pool, task_id)
            .await
            .map_err(CoreError::from_store_error)?
            .ok_or(CoreError::NotFound(task_id))?;

        self.authorize_view(principal, &task)?;
        Ok(task)
    }

    /// List tasks visible to `principal`: their own unless they hold
    /// `QueueViewGlobal`, in which case `owner_filter` may widen or
    /// narrow the scope.
    pub async fn list(
        &self,
        principal: &Principal,
        owner_filter: Option<&str>,
        status: Option<TaskStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Task>, CoreError> {
        let limit = limit.clamp(1, 500);
        let offset = offset.max(0);

        let owner_user_id = if principal.has(Permission::QueueViewGlobal) {
            owner_filter
        } else {
            Some(principal.user_id.as_str())
        };

        db::list_tasks(&self.pool, owner_user_id, status, limit, offset)
            .await
            .map_err(CoreError::from_store_error)
    }

    /// Cancel a task, enforcing owner-or-global-view access.
    ///
    /// A `pending` task is cancelled immediately. A `processing` task
    /// cannot be force-cancelled -- this only records the request; the
    /// worker running the task observes it cooperatively and performs the
    /// `processing -> cancelled` transition itself. A task already in a
    /// terminal state is a conflict: there is nothing left to cancel.
    pub async fn cancel(&self, principal: &Principal, task_id: Uuid) -> Result<CancelOutcome, CoreError> {
        let task = self.get(principal, task_id).await?;

        match task.status {
            TaskStatus::Pending => {
                let rows = db::cancel_task(&self.pool, task_id)
                    .await
                    .map_err(CoreError::from_store_error)?;
                if rows > 0 {
                    Ok(CancelOutcome::Cancelled)
                } else {
                    // Raced with a worker claiming it between our read and write.
                    Err(CoreError::Conflict(task_id))
                }
            }
            TaskStatus::Processing => {
                let rows = db::request_cancellation(&self.pool, task_id)
                    .await
                    .map_err(CoreError::from_store_error)?;
                if rows > 0 {
                    Ok(CancelOutcome::CancellationRequested)
                } else {
                    Err(CoreError::Conflict(task_id))
                }
            }
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => {
                Err(CoreError::Conflict(task_id))
            }
        }
    }

    /// Queue-wide statistics. Requires `QueueView`: the numbers are
    /// aggregate counts, never per-owner detail, but they still reveal
    /// queue-wide load that a plain submitter shouldn't see.
    pub async fn stats(&self, principal: &Principal) -> Result<QueueStats, CoreError> {
        if !principal.has(Permission::QueueView) {
            return Err(CoreError::PermissionDenied {
                user_id: principal.user_id.clone(),
                action: "view queue-wide statistics".to_string(),
            });
        }
        db::stats(&self.pool).await.map_err(CoreError::from_store_error)
    }

    /// Reset stale `processing` tasks. Requires `Admin`.
    pub async fn reset_stale(
        &self,
        principal: &Principal,
        threshold_minutes: i64,
    ) -> Result<usize, CoreError> {
        self.require_admin(principal)?;

        let threshold = chrono::Duration::minutes(threshold_minutes);
        let affected = db::reset_stale(&self.pool, threshold)
            .await
            .map_err(CoreError::from_store_error)?;

        if !affected.is_empty() {
            warn!(count = affected.len(), "reclaimed stale processing tasks");
        }
        Ok(affected.len())
    }

    /// Purge terminal-state tasks past retention, removing their artifact
    /// directories from disk along with the database rows. Requires
    /// `Admin`.
    pub async fn purge_old(
        &self,
        principal: &Principal,
        retention_days: i64,
    ) -> Result<usize, CoreError> {
        self.require_admin(principal)?;

        let deleted = db::purge_old(&self.pool, retention_days)
            .await
            .map_err(CoreError::from_store_error)?;

        for task in &deleted {
            let Some(dir) = task.result_dir.as_deref().filter(|d| !d.is_empty()) else {
                continue;
            };
            if let Err(e) = tokio::fs::remove_dir_all(dir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(task_id = %task.task_id, result_dir = %dir, error = %e, "failed to remove artifact directory");
                }
            }
        }

        if !deleted.is_empty() {
            info!(count = deleted.len(), "purged retained tasks past retention");
        }
        Ok(deleted.len())
    }

    fn authorize_view(&self, principal: &Principal, task: &Task) -> Result<(), CoreError> {
        if task.owner_user_id == principal.user_id || principal.has(Permission::QueueViewGlobal) {
            Ok(())
        } else {
            Err(CoreError::PermissionDenied {
                user_id: principal.user_id.clone(),
                action: format!("view task {}", task.task_id),
            })
        }
    }

    fn require_admin(&self, principal: &Principal) -> Result<(), CoreError> {
        if principal.has(Permission::Admin) {
            Ok(())
        } else {
            Err(CoreError::PermissionDenied {
                user_id: principal.user_id.clone(),
                action: "perform an admin maintenance action".to_string(),
            })
        }
    }
}
