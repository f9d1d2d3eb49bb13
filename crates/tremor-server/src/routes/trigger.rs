use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tremor_core::extract::ExtractionMode;
use tremor_core::pipeline::record::{PipelineRunRecord, RunOutcome, RunTrigger};

use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct TriggerResponse {
    pub run_id: String,
    pub outcome: RunOutcome,
    pub rows: usize,
    pub last_ts: Option<DateTime<Utc>>,
    pub mode: ExtractionMode,
    pub error_kind: Option<String>,
}

impl From<&PipelineRunRecord> for TriggerResponse {
    fn from(rec: &PipelineRunRecord) -> Self {
        Self {
            run_id: rec.run_id.to_string(),
            outcome: rec.outcome,
            rows: rec.rows,
            last_ts: rec.last_ts,
            mode: rec.mode,
            error_kind: rec.error_kind.clone(),
        }
    }
}

/// POST /api/trigger: run the pipeline now.
///
/// A failed run is still a 200 with `outcome: failed`. 409 when another run
/// holds the lock.
pub async fn trigger_run(State(app): State<AppState>) -> Result<Json<TriggerResponse>, AppError> {
    let orch = app.orchestrator.clone();
    let rec = tokio::task::spawn_blocking(move || orch.run_once(RunTrigger::Manual))
        .await
        .map_err(AppError::join)??;
    Ok(Json(TriggerResponse::from(&rec)))
}
