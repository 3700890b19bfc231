//! HTTP control plane (C10): a thin adapter over [`crate::task_manager`] and
//! [`crate::config::runtime`] exposing tasks, runtime config, and
//! downstream-service health under `/api/v1`.
//!
//! # Error Contract
//!
//! Every error response follows `{success: false, error, details?}`:
//!
//! ```json
//! { "success": false, "error": "unknown task: abc" }
//! ```
//!
//! Codes: 400 (validation), 404 (unknown task), 409 (state conflict), 500
//! (unexpected).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted, matching this system's
//! stance of being consumed by a browser UI it does not itself implement.

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tower_http::{cors::{Any, CorsLayer}, trace::TraceLayer};

use crate::config::runtime::RuntimeConfigProvider;
use crate::config::schema;
use crate::figure_summary::FigureSummaryRewriter;
use crate::models::{Event, Task, TaskSummary};
use crate::ocr_client::OcrClient;
use crate::rag_client::RagClient;
use crate::source_client::SourceClient;
use crate::task_manager::{TaskManager, TaskManagerError};

/// Shared application state passed to all route handlers via Axum's `State`
/// extractor.
#[derive(Clone)]
struct AppState {
    tasks: Arc<TaskManager>,
    config: Arc<RuntimeConfigProvider>,
}

/// Build the router without binding a listener, so integration tests can
/// drive it in-process via `tower::ServiceExt::oneshot`.
pub fn app(tasks: Arc<TaskManager>, config: Arc<RuntimeConfigProvider>) -> Router {
    let state = AppState { tasks, config };
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(handle_health))
        .route("/api/v1/config", get(handle_get_config).put(handle_put_config))
        .route("/api/v1/config/schema", get(handle_config_schema))
        .route("/api/v1/config/import-env", post(handle_config_import_env))
        .route("/api/v1/config/reset", post(handle_config_reset))
        .route("/api/v1/tasks", post(handle_create_task).get(handle_list_tasks))
        .route("/api/v1/tasks/{id}", get(handle_get_task))
        .route("/api/v1/tasks/{id}/events", get(handle_task_events))
        .route("/api/v1/tasks/{id}/files", get(handle_task_files))
        .route("/api/v1/tasks/{id}/cancel", post(handle_cancel_task))
        .route("/api/v1/tasks/{id}/skip-file", post(handle_skip_file))
        .route("/api/v1/zotero/health", get(handle_zotero_health))
        .route("/api/v1/zotero/collections", get(handle_zotero_collections))
        .route("/api/v1/mineru/health", get(handle_mineru_health))
        .route("/api/v1/dify/health", get(handle_dify_health))
        .route("/api/v1/image-summary/health", get(handle_image_summary_health))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Starts the HTTP control plane.
///
/// Binds to `bind_addr` and registers every `/api/v1` route. Runs until the
/// process is terminated.
pub async fn run_server(bind_addr: &str, tasks: Arc<TaskManager>, config: Arc<RuntimeConfigProvider>) -> anyhow::Result<()> {
    let app = app(tasks, config);
    tracing::info!(%bind_addr, "control plane listening");
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Error envelope ============

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

struct AppError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody { success: false, error: self.message, details: None };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError { status: StatusCode::BAD_REQUEST, message: message.into() }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError { status: StatusCode::NOT_FOUND, message: message.into() }
}

fn conflict(message: impl Into<String>) -> AppError {
    AppError { status: StatusCode::CONFLICT, message: message.into() }
}

fn internal_error(message: impl Into<String>) -> AppError {
    AppError { status: StatusCode::INTERNAL_SERVER_ERROR, message: message.into() }
}

impl From<TaskManagerError> for AppError {
    fn from(e: TaskManagerError) -> Self {
        match e {
            TaskManagerError::NotFound(_) => not_found(e.to_string()),
            TaskManagerError::CapacityExceeded(_) | TaskManagerError::AlreadyTerminal(_) | TaskManagerError::FileNotSkippable(_, _) => {
                conflict(e.to_string())
            }
        }
    }
}

fn ok<T: Serialize>(value: T) -> Json<SuccessBody<T>> {
    Json(SuccessBody { success: true, data: value })
}

#[derive(Serialize)]
struct SuccessBody<T> {
    success: bool,
    data: T,
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok".to_string(), version: env!("CARGO_PKG_VERSION").to_string() })
}

// ============ /config ============

async fn handle_get_config(State(state): State<AppState>) -> impl IntoResponse {
    ok(state.config.masked())
}

async fn handle_put_config(State(state): State<AppState>, Json(patch): Json<Value>) -> Result<impl IntoResponse, AppError> {
    let masked = state.config.update(&patch).map_err(|e| internal_error(e.to_string()))?;
    Ok(ok(masked))
}

#[derive(Serialize)]
struct SchemaField {
    category: &'static str,
    key: &'static str,
    field_type: &'static str,
    default: Value,
    label: &'static str,
    sensitive: bool,
    min: Option<f64>,
    max: Option<f64>,
    options: &'static [&'static str],
}

async fn handle_config_schema() -> impl IntoResponse {
    let fields: Vec<SchemaField> = schema::SCHEMA
        .iter()
        .map(|f| SchemaField {
            category: f.category,
            key: f.key,
            field_type: match f.field_type {
                schema::FieldType::Str => "str",
                schema::FieldType::Bool => "bool",
                schema::FieldType::Int => "int",
                schema::FieldType::Float => "float",
                schema::FieldType::Select => "select",
            },
            default: f.default.clone(),
            label: f.label,
            sensitive: f.sensitive,
            min: f.min,
            max: f.max,
            options: f.options,
        })
        .collect();
    ok(serde_json::json!({ "categories": schema::CATEGORIES, "fields": fields }))
}

async fn handle_config_import_env(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let masked = state
        .config
        .import_env(std::path::Path::new(".env"))
        .map_err(|e| internal_error(e.to_string()))?;
    Ok(ok(masked))
}

async fn handle_config_reset(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let masked = state.config.reset_to_defaults().map_err(|e| internal_error(e.to_string()))?;
    Ok(ok(masked))
}

// ============ /tasks ============

#[derive(Deserialize)]
#[serde(untagged)]
enum CollectionKeysInput {
    One(String),
    Many(Vec<String>),
}

#[derive(Deserialize)]
struct CreateTaskRequest {
    #[serde(default)]
    collection_keys: Option<CollectionKeysInput>,
}

async fn handle_create_task(
    State(state): State<AppState>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<impl IntoResponse, AppError> {
    let keys = match req.collection_keys {
        Some(CollectionKeysInput::One(s)) => vec![s],
        Some(CollectionKeysInput::Many(v)) => v,
        None => Vec::new(),
    };
    let summary = state.tasks.create_task(keys)?;
    Ok((StatusCode::CREATED, ok(summary)))
}

async fn handle_list_tasks(State(state): State<AppState>) -> impl IntoResponse {
    let tasks: Vec<TaskSummary> = state.tasks.list_tasks();
    ok(tasks)
}

async fn handle_get_task(State(state): State<AppState>, AxumPath(id): AxumPath<String>) -> Result<impl IntoResponse, AppError> {
    let task: Task = state.tasks.get_task(&id)?;
    Ok(ok(task))
}

#[derive(Deserialize)]
struct EventsQuery {
    #[serde(default)]
    after_seq: u64,
}

async fn handle_task_events(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    Query(q): Query<EventsQuery>,
) -> Result<impl IntoResponse, AppError> {
    let events: Vec<Event> = state.tasks.events_since(&id, q.after_seq)?;
    Ok(ok(events))
}

async fn handle_task_files(State(state): State<AppState>, AxumPath(id): AxumPath<String>) -> Result<impl IntoResponse, AppError> {
    let task = state.tasks.get_task(&id)?;
    Ok(ok(task.files))
}

async fn handle_cancel_task(State(state): State<AppState>, AxumPath(id): AxumPath<String>) -> Result<impl IntoResponse, AppError> {
    state.tasks.cancel_task(&id)?;
    Ok(ok(serde_json::json!({ "cancelled": true })))
}

#[derive(Deserialize)]
struct SkipFileRequest {
    filename: String,
}

async fn handle_skip_file(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    Json(req): Json<SkipFileRequest>,
) -> Result<impl IntoResponse, AppError> {
    if req.filename.trim().is_empty() {
        return Err(bad_request("filename must not be empty"));
    }
    state.tasks.skip_file(&id, &req.filename)?;
    Ok(ok(serde_json::json!({ "skipped": true })))
}

// ============ downstream health / collections ============

async fn handle_zotero_health(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.config.snapshot();
    let mcp_url = snapshot.get("zotero").and_then(|z| z.get("mcp_url")).and_then(|v| v.as_str()).unwrap_or_default();
    let healthy = SourceClient::new(mcp_url).check_connection().await;
    ok(serde_json::json!({ "healthy": healthy }))
}

async fn handle_zotero_collections(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let snapshot = state.config.snapshot();
    let mcp_url = snapshot.get("zotero").and_then(|z| z.get("mcp_url")).and_then(|v| v.as_str()).unwrap_or_default();
    let collections = SourceClient::new(mcp_url).list_collections().await.map_err(|e| internal_error(e.to_string()))?;
    Ok(ok(collections))
}

async fn handle_mineru_health(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.config.snapshot();
    let mineru = snapshot.get("mineru").cloned().unwrap_or_default();
    let ocr = OcrClient::new(
        "https://mineru.net/api/v4".to_string(),
        mineru.get("api_token").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
        mineru.get("model_version").and_then(|v| v.as_str()).unwrap_or("vlm").to_string(),
        std::time::Duration::from_secs(7200),
        std::env::temp_dir(),
    );
    ok(serde_json::json!({ "healthy": ocr.check_health().await }))
}

async fn handle_dify_health(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.config.snapshot();
    let dify = snapshot.get("dify").cloned().unwrap_or_default();
    let rag = RagClient::new(crate::rag_client::RagConfig {
        base_url: dify.get("base_url").and_then(|v| v.as_str()).unwrap_or("https://api.dify.ai/v1").to_string(),
        api_key: dify.get("api_key").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
        dataset_name: dify.get("dataset_name").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
        doc_form: String::new(),
        doc_language: String::new(),
        process_mode: "custom".to_string(),
        remove_extra_spaces: true,
        remove_urls_emails: false,
        segment_separator: "\\n\\n".to_string(),
        segment_max_tokens: 800,
        chunk_overlap: 0,
        parent_mode: "paragraph".to_string(),
        subchunk_separator: "\\n".to_string(),
        subchunk_max_tokens: 256,
        subchunk_overlap: 0,
        upload_delay_s: 1,
        index_max_wait_s: 1800,
        pipeline_file: String::new(),
    });
    ok(serde_json::json!({ "healthy": rag.check_health().await }))
}

async fn handle_image_summary_health(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.config.snapshot();
    let cfg_value = snapshot.get("image_summary").cloned().unwrap_or_default();
    let cfg: crate::figure_summary::ImageSummaryConfig = serde_json::from_value(cfg_value).unwrap_or(crate::figure_summary::ImageSummaryConfig {
        enabled: false,
        api_base_url: String::new(),
        api_key: String::new(),
        model: String::new(),
        request_timeout_s: 120,
        max_context_chars: 3000,
        max_images_per_doc: 50,
        max_tokens: 900,
        temperature: 0.1,
        concurrency: 4,
    });
    let rewriter = FigureSummaryRewriter::new(cfg);
    ok(serde_json::json!({ "healthy": rewriter.check_health().await }))
}
