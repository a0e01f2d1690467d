mod handlers;
mod metrics;
mod routes;

#[cfg(test)]
mod api_tests;

use anyhow::{Context, Result};
use axum::http::HeaderValue;
use axum::Router;
use codedrill_common::config::Settings;
use codedrill_common::store::{ProblemCatalog, SessionStore};
use codedrill_sandbox::{build_sandbox, Executor, ExecutorConfig, SubmissionService};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub struct AppState {
    pub catalog: Arc<ProblemCatalog>,
    pub sessions: Arc<SessionStore>,
    pub service: SubmissionService,
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods(Any)
        .allow_headers(Any)
}

pub fn app(state: Arc<AppState>, cors_origins: &[String]) -> Router {
    Router::new()
        .merge(routes::routes())
        .layer(cors_layer(cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("CodeDrill API booting...");

    let settings = Settings::load_default().context("Failed to load settings")?;
    metrics::init()?;

    let catalog = Arc::new(ProblemCatalog::open(&settings.storage.data_dir)?);
    let sessions = Arc::new(
        SessionStore::open(&settings.storage.sessions_dir)
            .context("Failed to open session store")?,
    );

    let sandbox = build_sandbox(&settings.sandbox)?;
    let executor = Arc::new(Executor::new(
        sandbox,
        ExecutorConfig::from_settings(&settings.sandbox),
    )?);
    info!(
        sandbox = executor.sandbox_name(),
        timeout_s = settings.sandbox.timeout_seconds,
        memory_mb = settings.sandbox.max_memory_mb,
        max_concurrent = settings.sandbox.max_concurrent,
        "Execution sandbox ready"
    );

    let service = SubmissionService::new(executor, catalog.clone(), sessions.clone());
    let state = Arc::new(AppState {
        catalog,
        sessions,
        service,
    });

    let app = app(state, &settings.server.cors_origins);

    let addr = settings.server.bind_addr.as_str();
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("HTTP server listening on {}", addr);

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}
