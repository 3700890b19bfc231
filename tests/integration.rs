//! End-to-end tests for the HTTP control plane: the `axum` router built by
//! `biblio_ingest::server::app` is driven in-process via `tower::ServiceExt`,
//! with downstream services (bridge, RAG, vision) stood up as `wiremock`
//! mock servers so no real network calls are made.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use biblio_ingest::config::runtime::RuntimeConfigProvider;
use biblio_ingest::task_manager::TaskManager;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct TestApp {
    router: axum::Router,
    _dir: tempfile::TempDir,
}

fn build_app(max_concurrent: usize, patch: Option<Value>) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(RuntimeConfigProvider::new(dir.path().join("runtime_config.json")).unwrap());
    if let Some(patch) = patch {
        config.update(&patch).unwrap();
    }
    let tasks = Arc::new(TaskManager::new(dir.path().to_path_buf(), Arc::clone(&config), max_concurrent));
    let router = biblio_ingest::server::app(tasks, config);
    TestApp { router, _dir: dir }
}

async fn send(router: &axum::Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: Value = if body.is_empty() { Value::Null } else { serde_json::from_slice(&body).unwrap() };
    (status, json)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn put_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("PUT")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn health_reports_ok() {
    let app = build_app(4, None);
    let (status, body) = send(&app.router, get("/api/v1/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn config_roundtrips_and_masks_secrets() {
    let app = build_app(4, None);

    let (status, body) = send(&app.router, get("/api/v1/config")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["dify"]["api_key"], "");

    let patch = json!({"dify": {"api_key": "sk-super-secret-value"}});
    let (status, body) = send(&app.router, put_json("/api/v1/config", patch)).await;
    assert_eq!(status, StatusCode::OK);
    let masked = body["data"]["dify"]["api_key"].as_str().unwrap();
    assert!(masked.starts_with("******"));
    assert!(masked.ends_with("alue"));
    assert!(!masked.contains("sk-super-secret"));

    let (status, body) = send(&app.router, post_json("/api/v1/config/reset", Value::Null)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["dify"]["api_key"], "");
}

#[tokio::test]
async fn config_schema_lists_all_categories() {
    let app = build_app(4, None);
    let (status, body) = send(&app.router, get("/api/v1/config/schema")).await;
    assert_eq!(status, StatusCode::OK);
    let categories: Vec<&str> = body["data"]["categories"].as_array().unwrap().iter().map(|v| v.as_str().unwrap()).collect();
    assert_eq!(categories, vec!["zotero", "mineru", "dify", "md_clean", "image_summary", "smart_split"]);
    assert!(body["data"]["fields"].as_array().unwrap().iter().any(|f| f["key"] == "mcp_url"));
}

#[tokio::test]
async fn create_task_accepts_both_collection_keys_shapes() {
    let app = build_app(4, None);

    let (status, body) = send(&app.router, post_json("/api/v1/tasks", json!({"collection_keys": "ABC123"}))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["collection_keys"], json!(["ABC123"]));

    let (status, body) = send(&app.router, post_json("/api/v1/tasks", json!({"collection_keys": ["A", "B"]}))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["collection_keys"], json!(["A", "B"]));

    let (status, body) = send(&app.router, post_json("/api/v1/tasks", json!({}))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["collection_keys"], json!([]));
}

#[tokio::test]
async fn create_task_rejects_once_concurrency_cap_is_reached() {
    let app = build_app(1, None);

    let (status, _) = send(&app.router, post_json("/api/v1/tasks", json!({"collection_keys": "ABC"}))).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = send(&app.router, post_json("/api/v1/tasks", json!({"collection_keys": "DEF"}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("concurrency cap"));
}

#[tokio::test]
async fn task_lifecycle_get_list_events_cancel() {
    let app = build_app(4, None);

    let (_, created) = send(&app.router, post_json("/api/v1/tasks", json!({"collection_keys": []}))).await;
    let task_id = created["data"]["task_id"].as_str().unwrap().to_string();

    let (status, body) = send(&app.router, get("/api/v1/tasks")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"].as_array().unwrap().iter().any(|t| t["task_id"] == task_id));

    let (status, body) = send(&app.router, get(&format!("/api/v1/tasks/{task_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["task_id"], task_id);

    let (status, _) = send(&app.router, get(&format!("/api/v1/tasks/{task_id}/events?after_seq=0"))).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(&app.router, get(&format!("/api/v1/tasks/{task_id}/files"))).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&app.router, post_json(&format!("/api/v1/tasks/{task_id}/cancel"), Value::Null)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["cancelled"], true);
}

#[tokio::test]
async fn unknown_task_id_is_404() {
    let app = build_app(4, None);
    let (status, body) = send(&app.router, get("/api/v1/tasks/does-not-exist")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn skip_file_rejects_empty_filename() {
    let app = build_app(4, None);
    let (_, created) = send(&app.router, post_json("/api/v1/tasks", json!({"collection_keys": []}))).await;
    let task_id = created["data"]["task_id"].as_str().unwrap().to_string();

    let (status, body) = send(&app.router, post_json(&format!("/api/v1/tasks/{task_id}/skip-file"), json!({"filename": "  "}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn zotero_health_reflects_mocked_bridge() {
    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"jsonrpc": "2.0", "id": 0, "result": {}})))
        .mount(&mock)
        .await;

    let app = build_app(4, Some(json!({"zotero": {"mcp_url": format!("{}/mcp", mock.uri())}})));
    let (status, body) = send(&app.router, get("/api/v1/zotero/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["healthy"], true);
}

#[tokio::test]
async fn zotero_collections_returns_empty_list_from_mocked_bridge() {
    let mock = MockServer::start().await;
    let empty_page = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "result": {"content": [{"type": "text", "text": json!({"collections": []}).to_string()}]}
    });
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .respond_with(ResponseTemplate::new(200).set_body_json(empty_page))
        .mount(&mock)
        .await;

    let app = build_app(4, Some(json!({"zotero": {"mcp_url": format!("{}/mcp", mock.uri())}})));
    let (status, body) = send(&app.router, get("/api/v1/zotero/collections")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], json!([]));
}

#[tokio::test]
async fn dify_health_reflects_mocked_rag_service() {
    let mock = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/datasets"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": []})))
        .mount(&mock)
        .await;

    let app = build_app(4, Some(json!({"dify": {"base_url": mock.uri()}})));
    let (status, body) = send(&app.router, get("/api/v1/dify/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["healthy"], true);
}

#[tokio::test]
async fn image_summary_health_reflects_mocked_vision_service() {
    let mock = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": []})))
        .mount(&mock)
        .await;

    let app = build_app(4, Some(json!({"image_summary": {"api_base_url": mock.uri()}})));
    let (status, body) = send(&app.router, get("/api/v1/image-summary/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["healthy"], true);
}

#[tokio::test]
async fn image_summary_health_is_trivially_healthy_when_disabled() {
    let app = build_app(4, Some(json!({"image_summary": {"enabled": false, "api_base_url": "http://127.0.0.1:1"}})));
    let (status, body) = send(&app.router, get("/api/v1/image-summary/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["healthy"], true);
}
