pub mod error;
pub mod routes;
pub mod scheduler;
pub mod state;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tremor_core::pipeline::Orchestrator;

/// Build the axum Router with all API routes and middleware.
/// Used by `serve()` and available for integration testing.
pub fn build_router(orchestrator: Arc<Orchestrator>) -> Router {
    let app_state = state::AppState::new(orchestrator);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/data", get(routes::data::get_data))
        .route("/api/trigger", post(routes::trigger::trigger_run))
        .route("/api/runs", get(routes::runs::list_runs))
        .route("/api/health", get(routes::health::get_health))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app_state)
}

/// Bind `0.0.0.0:{port}`, start the scheduler and serve until Ctrl-C.
pub async fn serve(orchestrator: Arc<Orchestrator>, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    serve_on(orchestrator, listener).await
}

/// Serve on a pre-bound listener, so callers can bind port 0 and read the
/// chosen port first.
pub async fn serve_on(
    orchestrator: Arc<Orchestrator>,
    listener: tokio::net::TcpListener,
) -> anyhow::Result<()> {
    let actual_port = listener.local_addr()?.port();
    let scheduler = scheduler::spawn(orchestrator.clone());
    let app = build_router(orchestrator);

    tracing::info!("tremor API listening on http://localhost:{actual_port}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("failed to listen for shutdown signal: {e}");
            }
            tracing::info!("shutting down");
        })
        .await?;
    scheduler.abort();
    Ok(())
}
