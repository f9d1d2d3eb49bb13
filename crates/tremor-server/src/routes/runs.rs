use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use tremor_core::pipeline::record::PipelineRunRecord;

use crate::error::AppError;
use crate::state::AppState;

const DEFAULT_LIMIT: usize = 20;
const MAX_LIMIT: usize = 200;

#[derive(Debug, Default, Deserialize)]
pub struct RunsParams {
    #[serde(default)]
    limit: Option<usize>,
}

/// GET /api/runs?limit=N, newest run records first.
pub async fn list_runs(
    State(app): State<AppState>,
    Query(params): Query<RunsParams>,
) -> Result<Json<Vec<PipelineRunRecord>>, AppError> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let orch = app.orchestrator.clone();
    let runs = tokio::task::spawn_blocking(move || orch.list_runs(limit))
        .await
        .map_err(AppError::join)??;
    Ok(Json(runs))
}
