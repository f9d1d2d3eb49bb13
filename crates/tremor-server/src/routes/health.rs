use axum::extract::State;
use axum::Json;
use tremor_core::pipeline::Health;

use crate::error::AppError;
use crate::state::AppState;

/// GET /api/health
pub async fn get_health(State(app): State<AppState>) -> Result<Json<Health>, AppError> {
    let orch = app.orchestrator.clone();
    let health = tokio::task::spawn_blocking(move || orch.health())
        .await
        .map_err(AppError::join)??;
    Ok(Json(health))
}
