/// Router-level tests
///
/// Requests go through the full axum stack with a stub sandbox that answers
/// every harness with an all-pass payload, so no interpreter is needed.

use crate::{app, AppState};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use codedrill_common::store::{ProblemCatalog, SessionStore};
use codedrill_sandbox::harness::HarnessUnit;
use codedrill_sandbox::{
    Executor, ExecutorConfig, Sandbox, SandboxError, SandboxLimits, SandboxOutput, SandboxStatus,
    SubmissionService,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

struct AllPassSandbox;

#[async_trait]
impl Sandbox for AllPassSandbox {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn run(&self, unit: &HarnessUnit, _limits: &SandboxLimits) -> Result<SandboxOutput, SandboxError> {
        let records: Vec<Value> = (0..unit.fixture_count)
            .map(|i| {
                json!({
                    "fixture_index": i, "passed": true, "input": "add(1, 1)",
                    "expected": "2", "actual": "2", "error": null
                })
            })
            .collect();
        Ok(SandboxOutput {
            stdout: format!("{}{}\n", unit.sentinel, Value::from(records)),
            stderr: String::new(),
            status: SandboxStatus::Completed { exit_code: Some(0) },
            elapsed_ms: 1,
        })
    }
}

struct TestApp {
    router: Router,
    _data: TempDir,
    _sessions: TempDir,
}

fn write_catalog(dir: &std::path::Path) {
    std::fs::write(
        dir.join("problem_index.json"),
        json!({"problems": [{"file": "add.json"}]}).to_string(),
    )
    .unwrap();
    std::fs::write(
        dir.join("add.json"),
        json!({
            "id": "add",
            "title": "Add",
            "category": "warmup",
            "difficulty": "easy",
            "description": "Add two numbers.",
            "starter_code": "def add(a, b):\n    pass\n",
            "test_cases": [
                {"input": "add(1, 1)", "expected": "2"},
                {"input": "add(2, 2)", "expected": "4", "is_hidden": true}
            ]
        })
        .to_string(),
    )
    .unwrap();
}

fn test_app() -> TestApp {
    let data = TempDir::new().unwrap();
    let sessions_dir = TempDir::new().unwrap();
    write_catalog(data.path());

    let catalog = Arc::new(ProblemCatalog::open(data.path()).unwrap());
    let sessions = Arc::new(SessionStore::open(sessions_dir.path()).unwrap());
    let executor = Arc::new(Executor::new(Arc::new(AllPassSandbox), ExecutorConfig::default()).unwrap());
    let service = SubmissionService::new(executor, catalog.clone(), sessions.clone());

    let state = Arc::new(AppState {
        catalog,
        sessions,
        service,
    });
    TestApp {
        router: app(state, &["http://localhost:5573".to_string()]),
        _data: data,
        _sessions: sessions_dir,
    }
}

async fn call(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn test_health() {
    let app = test_app();
    let (status, body) = call(&app.router, "GET", "/api/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["sandbox"], "stub");
}

#[tokio::test]
async fn test_problem_detail_hides_hidden_fixtures() {
    let app = test_app();
    let (status, body) = call(&app.router, "GET", "/api/problems/add", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["test_cases"].as_array().unwrap().len(), 1);

    let (status, body) = call(&app.router, "GET", "/api/problems/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["detail"], "Problem not found");
}

#[tokio::test]
async fn test_problem_list_filters() {
    let app = test_app();
    let (_, all) = call(&app.router, "GET", "/api/problems", None).await;
    assert_eq!(all.as_array().unwrap().len(), 1);

    let (_, none) = call(&app.router, "GET", "/api/problems?difficulty=hard", None).await;
    assert!(none.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_session_lifecycle_and_execution() {
    let app = test_app();

    let (status, session) = call(&app.router, "POST", "/api/sessions", Some(json!({"problem_id": "add"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(session["status"], "in_progress");
    let id = session["id"].as_str().unwrap().to_string();

    let (status, updated) = call(
        &app.router,
        "PUT",
        &format!("/api/sessions/{}", id),
        Some(json!({"code": "def add(a, b):\n    return a + b\n"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(updated["code"].as_str().unwrap().contains("return a + b"));

    let (status, run) = call(&app.router, "POST", "/api/execute/run", Some(json!({"session_id": id}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(run["results"].as_array().unwrap().len(), 1);
    assert_eq!(run["all_passed"], true);
    assert!(run["error"].is_null());

    let (status, submit) = call(&app.router, "POST", "/api/execute/submit", Some(json!({"session_id": id}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(submit["results"].as_array().unwrap().len(), 2);

    let (_, stored) = call(&app.router, "GET", &format!("/api/sessions/{}", id), None).await;
    assert_eq!(stored["status"], "submitted");
    assert_eq!(stored["test_results"].as_array().unwrap().len(), 2);

    let (_, listed) = call(&app.router, "GET", "/api/sessions", None).await;
    assert_eq!(listed.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_policy_block_over_http() {
    let app = test_app();
    let (_, session) = call(&app.router, "POST", "/api/sessions", Some(json!({"problem_id": "add"}))).await;
    let id = session["id"].as_str().unwrap().to_string();
    call(
        &app.router,
        "PUT",
        &format!("/api/sessions/{}", id),
        Some(json!({"code": "import subprocess\n"})),
    )
    .await;

    let (status, run) = call(&app.router, "POST", "/api/execute/run", Some(json!({"session_id": id}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(run["failure"], "policy_violation");
    assert!(run["results"][0]["error"]
        .as_str()
        .unwrap()
        .starts_with("Blocked capability detected"));
}

#[tokio::test]
async fn test_unknown_session_is_404() {
    let app = test_app();
    let missing = uuid::Uuid::new_v4().to_string();

    let (status, body) = call(&app.router, "POST", "/api/execute/submit", Some(json!({"session_id": missing}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["detail"], "Session not found");

    let (status, _) = call(&app.router, "GET", "/api/sessions/../../etc/passwd", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(&app.router, "POST", "/api/sessions", Some(json!({"problem_id": "nope"}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_reload_reports_count() {
    let app = test_app();
    let (status, body) = call(&app.router, "POST", "/api/problems/reload", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["problems"], 1);
}
