use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::handlers;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_handler))
        .route("/api/problems", get(handlers::list_problems))
        .route("/api/problems/reload", post(handlers::reload_problems))
        .route("/api/problems/:id", get(handlers::get_problem))
        .route(
            "/api/sessions",
            get(handlers::list_sessions).post(handlers::create_session),
        )
        .route(
            "/api/sessions/:id",
            get(handlers::get_session).put(handlers::update_session),
        )
        .route("/api/execute/run", post(handlers::execute_run))
        .route("/api/execute/submit", post(handlers::execute_submit))
}
