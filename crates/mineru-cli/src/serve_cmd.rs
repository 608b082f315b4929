use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{FromRequestParts, Multipart, Path, Query, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use mineru_core::{CancelOutcome, CoreError, Principal, QueueService, SubmitRequest};
use mineru_db::models::{Task, TaskStatus};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            message: message.into(),
        }
    }

    fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthenticated", message)
    }
}

impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        let status = match &err {
            CoreError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::PermissionDenied { .. } => StatusCode::FORBIDDEN,
            CoreError::Conflict(_) => StatusCode::CONFLICT,
            CoreError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::EngineTransient(_) | CoreError::EnginePermanent(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            CoreError::StaleExceeded(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CoreError::Cancelled(_) => StatusCode::CONFLICT,
        };
        Self::new(status, err.kind(), err.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({
            "error": { "kind": self.kind, "message": self.message }
        });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Principal extraction
// ---------------------------------------------------------------------------

/// Resolves a [`Principal`] from the trusted `X-User-Id` / `X-User-Role`
/// headers an upstream auth proxy is expected to set. Verifying how those
/// headers came to be trusted is out of scope here.
struct ResolvedPrincipal(Principal);

impl<S> FromRequestParts<S> for ResolvedPrincipal
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::unauthenticated("missing X-User-Id header"))?;
        let role = parts
            .headers
            .get("x-user-role")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("user");

        Ok(Self(Principal::new(user_id, role)))
    }
}

// ---------------------------------------------------------------------------
// App state
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<QueueService>,
    pub upload_root: PathBuf,
    pub max_upload_size_bytes: u64,
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct SubmitResponse {
    task_id: Uuid,
    status: TaskStatus,
    file_name: String,
}

#[derive(Debug, Serialize)]
struct TaskResponse {
    #[serde(flatten)]
    task: Task,
    data: Option<TaskData>,
}

#[derive(Debug, Serialize)]
struct TaskData {
    content: Option<String>,
    markdown_file: Option<String>,
    json_content: Option<serde_json::Value>,
    json_file: Option<String>,
    json_available: bool,
}

#[derive(Debug, Deserialize)]
struct GetTaskQuery {
    #[serde(default)]
    format: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<TaskStatus>,
    limit: Option<i64>,
    offset: Option<i64>,
    owner: Option<String>,
}

#[derive(Debug, Serialize)]
struct ListResponse {
    tasks: Vec<Task>,
    total: i64,
}

#[derive(Debug, Deserialize)]
struct ResetStaleRequest {
    timeout_minutes: i64,
}

#[derive(Debug, Serialize)]
struct ResetStaleResponse {
    reset_count: usize,
}

#[derive(Debug, Deserialize)]
struct CleanupRequest {
    retention_days: i64,
}

#[derive(Debug, Serialize)]
struct CleanupResponse {
    deleted_count: usize,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/tasks/submit", post(submit_task))
        .route("/tasks/{id}", get(get_task).delete(cancel_task))
        .route("/queue/tasks", get(list_tasks))
        .route("/queue/stats", get(queue_stats))
        .route("/admin/queue/reset-stale", post(reset_stale))
        .route("/admin/queue/cleanup", post(cleanup))
        .with_state(state);

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(state: AppState, bind: &str, port: u16) -> Result<()> {
    let app = build_router(state);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    info!("mineru serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("mineru serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health() -> impl IntoResponse {
    Json(HealthResponse { status: "healthy" })
}

async fn submit_task(
    State(state): State<AppState>,
    ResolvedPrincipal(principal): ResolvedPrincipal,
    mut multipart: Multipart,
) -> Result<axum::response::Response, AppError> {
    let mut file_name: Option<String> = None;
    let mut file_bytes: Option<Vec<u8>> = None;
    let mut backend = "default".to_string();
    let mut priority: Option<i32> = None;
    let mut options = serde_json::Map::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::new(StatusCode::BAD_REQUEST, "invalid_input", e.to_string()))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "file" => {
                file_name = field.file_name().map(|s| s.to_string());
                let data = field.bytes().await.map_err(|e| {
                    AppError::new(StatusCode::BAD_REQUEST, "invalid_input", e.to_string())
                })?;
                if data.len() as u64 > state.max_upload_size_bytes {
                    return Err(AppError::new(
                        StatusCode::BAD_REQUEST,
                        "invalid_input",
                        "uploaded file exceeds max_upload_size_bytes",
                    ));
                }
                file_bytes = Some(data.to_vec());
            }
            "backend" => {
                backend = field.text().await.unwrap_or_default();
            }
            "priority" => {
                let text = field.text().await.unwrap_or_default();
                priority = text.parse().ok();
            }
            other => {
                let text = field.text().await.unwrap_or_default();
                options.insert(other.to_string(), serde_json::Value::String(text));
            }
        }
    }

    let file_name =
        file_name.ok_or_else(|| AppError::new(StatusCode::BAD_REQUEST, "invalid_input", "missing file"))?;
    let bytes = file_bytes
        .ok_or_else(|| AppError::new(StatusCode::BAD_REQUEST, "invalid_input", "missing file"))?;

    let task_id = Uuid::new_v4();
    let task_dir = state.upload_root.join(task_id.to_string());
    tokio::fs::create_dir_all(&task_dir)
        .await
        .map_err(|e| AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "store_unavailable", e.to_string()))?;
    let file_path = task_dir.join(&file_name);
    tokio::fs::write(&file_path, &bytes)
        .await
        .map_err(|e| AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "store_unavailable", e.to_string()))?;

    let task = state
        .queue
        .submit(
            &principal,
            SubmitRequest {
                file_name: &file_name,
                file_path: &file_path.to_string_lossy(),
                backend: &backend,
                options: serde_json::Value::Object(options),
                priority,
                max_retries: None,
            },
        )
        .await?;

    Ok(Json(SubmitResponse {
        task_id: task.task_id,
        status: task.status,
        file_name: task.file_name,
    })
    .into_response())
}

async fn get_task(
    State(state): State<AppState>,
    ResolvedPrincipal(principal): ResolvedPrincipal,
    Path(id): Path<Uuid>,
    Query(query): Query<GetTaskQuery>,
) -> Result<axum::response::Response, AppError> {
    let task = state.queue.get(&principal, id).await?;
    let format = query.format.as_deref().unwrap_or("both");

    let data = if task.status == TaskStatus::Completed {
        let content = if format != "json" {
            match &task.markdown_file {
                Some(path) => tokio::fs::read_to_string(path).await.ok(),
                None => None,
            }
        } else {
            None
        };

        let json_content = if format != "markdown" {
            match &task.json_file {
                Some(path) => tokio::fs::read_to_string(path)
                    .await
                    .ok()
                    .and_then(|s| serde_json::from_str(&s).ok()),
                None => None,
            }
        } else {
            None
        };

        Some(TaskData {
            content,
            markdown_file: task.markdown_file.clone(),
            json_available: task.json_file.is_some(),
            json_content,
            json_file: task.json_file.clone(),
        })
    } else {
        None
    };

    Ok(Json(TaskResponse { task, data }).into_response())
}

async fn cancel_task(
    State(state): State<AppState>,
    ResolvedPrincipal(principal): ResolvedPrincipal,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let outcome = state.queue.cancel(&principal, id).await?;
    let body = match outcome {
        CancelOutcome::Cancelled => serde_json::json!({ "cancelled": true }),
        CancelOutcome::CancellationRequested => {
            serde_json::json!({ "in_flight": true, "cancellation_requested": true })
        }
    };
    Ok(Json(body).into_response())
}

async fn list_tasks(
    State(state): State<AppState>,
    ResolvedPrincipal(principal): ResolvedPrincipal,
    Query(query): Query<ListQuery>,
) -> Result<axum::response::Response, AppError> {
    let limit = query.limit.unwrap_or(50);
    let offset = query.offset.unwrap_or(0);

    let tasks = state
        .queue
        .list(&principal, query.owner.as_deref(), query.status, limit, offset)
        .await?;

    Ok(Json(ListResponse {
        total: tasks.len() as i64,
        tasks,
    })
    .into_response())
}

async fn queue_stats(
    State(state): State<AppState>,
    ResolvedPrincipal(principal): ResolvedPrincipal,
) -> Result<axum::response::Response, AppError> {
    let stats = state.queue.stats(&principal).await?;
    Ok(Json(stats).into_response())
}

async fn reset_stale(
    State(state): State<AppState>,
    ResolvedPrincipal(principal): ResolvedPrincipal,
    Json(req): Json<ResetStaleRequest>,
) -> Result<axum::response::Response, AppError> {
    let reset_count = state.queue.reset_stale(&principal, req.timeout_minutes).await?;
    Ok(Json(ResetStaleResponse { reset_count }).into_response())
}

async fn cleanup(
    State(state): State<AppState>,
    ResolvedPrincipal(principal): ResolvedPrincipal,
    Json(req): Json<CleanupRequest>,
) -> Result<axum::response::Response, AppError> {
    let deleted_count = state.queue.purge_old(&principal, req.retention_days).await?;
    Ok(Json(CleanupResponse { deleted_count }).into_response())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use mineru_core::QueueDefaults;
    use mineru_test_utils::{create_test_db, drop_test_db};
    use tower::ServiceExt;

    use super::*;

    fn test_state(pool: sqlx::PgPool, upload_root: PathBuf) -> AppState {
        AppState {
            queue: Arc::new(QueueService::new(pool, QueueDefaults::default(), [])),
            upload_root,
            max_upload_size_bytes: 10 * 1024 * 1024,
        }
    }

    async fn send_request(state: AppState, method: &str, uri: &str) -> axum::response::Response {
        let app = super::build_router(state);
        app.oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .header("x-user-id", "alice")
                .header("x-user-role", "admin")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1_048_576).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_requires_no_auth() {
        let (pool, db_name) = create_test_db().await;
        let tmp = tempfile::TempDir::new().unwrap();
        let state = test_state(pool.clone(), tmp.path().to_path_buf());

        let app = super::build_router(state);
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn queue_stats_starts_empty() {
        let (pool, db_name) = create_test_db().await;
        let tmp = tempfile::TempDir::new().unwrap();
        let state = test_state(pool.clone(), tmp.path().to_path_buf());

        let resp = send_request(state, "GET", "/api/v1/queue/stats").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["total"], 0);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn get_task_without_auth_header_is_unauthenticated() {
        let (pool, db_name) = create_test_db().await;
        let tmp = tempfile::TempDir::new().unwrap();
        let state = test_state(pool.clone(), tmp.path().to_path_buf());

        let app = super::build_router(state);
        let resp = app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/v1/tasks/{}", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn get_task_not_found_returns_404() {
        let (pool, db_name) = create_test_db().await;
        let tmp = tempfile::TempDir::new().unwrap();
        let state = test_state(pool.clone(), tmp.path().to_path_buf());

        let resp = send_request(state, "GET", &format!("/api/v1/tasks/{}", Uuid::new_v4())).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn reset_stale_with_zero_tasks_is_noop() {
        let (pool, db_name) = create_test_db().await;
        let tmp = tempfile::TempDir::new().unwrap();
        let state = test_state(pool.clone(), tmp.path().to_path_buf());

        let app = super::build_router(state);
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/admin/queue/reset-stale")
                    .header("x-user-id", "root")
                    .header("x-user-role", "admin")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::json!({"timeout_minutes": 60}).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["reset_count"], 0);

        pool.close().await;
        drop_test_db(&db_name).await;
    }
}
