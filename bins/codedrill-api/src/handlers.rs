// HTTP route handlers for the CodeDrill API

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use codedrill_common::store::StoreError;
use codedrill_common::types::{Problem, SessionUpdate};
use codedrill_sandbox::ExecutionError;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::error;

use crate::metrics;
use crate::AppState;

/// Error body shape: `{"detail": "..."}`.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            ApiError::NotFound(detail) => (StatusCode::NOT_FOUND, detail),
            ApiError::Internal(detail) => (StatusCode::INTERNAL_SERVER_ERROR, detail),
        };
        (status, Json(serde_json::json!({ "detail": detail }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        error!(error = %e, "Session store failure");
        ApiError::Internal(e.to_string())
    }
}

impl From<ExecutionError> for ApiError {
    fn from(e: ExecutionError) -> Self {
        match e {
            ExecutionError::SessionNotFound(_) | ExecutionError::ProblemNotFound(_) => {
                ApiError::NotFound(e.to_string())
            }
            ExecutionError::Lookup(_) | ExecutionError::Persist(_) => {
                error!(error = %e, "Execution request failed");
                ApiError::Internal(e.to_string())
            }
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ProblemQuery {
    pub category: Option<String>,
    pub difficulty: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SessionCreate {
    pub problem_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    pub session_id: String,
}

/// GET /api/health
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "sandbox": state.service.executor().sandbox_name(),
        "problems": state.catalog.len(),
    }))
}

/// GET /metrics
pub async fn metrics_handler() -> Result<impl IntoResponse, ApiError> {
    let body = metrics::render().map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body))
}

/// GET /api/problems?category=&difficulty=
pub async fn list_problems(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProblemQuery>,
) -> impl IntoResponse {
    Json(state.catalog.list(query.category.as_deref(), query.difficulty.as_deref()))
}

/// GET /api/problems/:id - hidden fixtures are not exposed
pub async fn get_problem(
    State(state): State<Arc<AppState>>,
    Path(problem_id): Path<String>,
) -> Result<Json<Problem>, ApiError> {
    let problem = state
        .catalog
        .get(&problem_id)
        .ok_or_else(|| ApiError::NotFound("Problem not found".to_string()))?;

    let mut public = (*problem).clone();
    public.test_cases.retain(|tc| !tc.is_hidden);
    Ok(Json(public))
}

/// POST /api/problems/reload
pub async fn reload_problems(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    match state.catalog.reload() {
        Ok(count) => Ok(Json(serde_json::json!({ "problems": count }))),
        Err(e) => {
            error!(error = %format!("{:#}", e), "Problem catalog reload failed");
            Err(ApiError::Internal(format!("{:#}", e)))
        }
    }
}

/// POST /api/sessions
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SessionCreate>,
) -> Result<impl IntoResponse, ApiError> {
    let problem = state
        .catalog
        .get(&req.problem_id)
        .ok_or_else(|| ApiError::NotFound(format!("Problem {} not found", req.problem_id)))?;

    Ok(Json(state.sessions.create(&problem)?))
}

/// GET /api/sessions - newest first
pub async fn list_sessions(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.sessions.list()?))
}

/// GET /api/sessions/:id
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .sessions
        .get(&session_id)?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("Session not found".to_string()))
}

/// PUT /api/sessions/:id
pub async fn update_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(update): Json<SessionUpdate>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .sessions
        .update(&session_id, update)?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("Session not found".to_string()))
}

/// POST /api/execute/run - visible fixtures, nothing persisted
pub async fn execute_run(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ExecuteRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let start = Instant::now();
    let report = state.service.execute_run(&req.session_id).await?;
    metrics::observe_execution("run", &report, start.elapsed());
    Ok(Json(report))
}

/// POST /api/execute/submit - full suite, recorded on the session
pub async fn execute_submit(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ExecuteRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let start = Instant::now();
    let report = state.service.execute_submit(&req.session_id).await?;
    metrics::observe_execution("submit", &report, start.elapsed());
    Ok(Json(report))
}
