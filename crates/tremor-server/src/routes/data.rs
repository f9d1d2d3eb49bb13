use std::num::IntErrorKind;

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use tremor_core::serve::{DataResponse, QueryRequest, RangeAlias};

use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct DataParams {
    #[serde(default)]
    limit: Option<String>,
    #[serde(default)]
    range: Option<String>,
}

impl DataParams {
    fn into_request(self) -> Result<QueryRequest, AppError> {
        let limit = match self.limit.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(raw) => Some(parse_limit(raw)?),
            None => None,
        };
        let range = match self.range.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(raw) => Some(raw.parse::<RangeAlias>().map_err(AppError::bad_request)?),
            None => None,
        };
        Ok(QueryRequest { limit, range })
    }
}

/// Any integer is accepted; out-of-range values saturate and the core clamps
/// them into the configured limits. Only non-integers are rejected.
fn parse_limit(raw: &str) -> Result<usize, AppError> {
    match raw.parse::<i64>() {
        Ok(n) if n <= 0 => Ok(0),
        Ok(n) => Ok(usize::try_from(n).unwrap_or(usize::MAX)),
        Err(e) => match e.kind() {
            IntErrorKind::PosOverflow => Ok(usize::MAX),
            IntErrorKind::NegOverflow => Ok(0),
            _ => Err(AppError::bad_request(format!("invalid limit '{raw}'"))),
        },
    }
}

/// GET /api/data?limit=N | ?range=24h|48h|7d|30d|all
///
/// Data-quality problems come back as `ok: false` with a `reason`; only a
/// missing or unreadable dataset is an error.
pub async fn get_data(
    State(app): State<AppState>,
    Query(params): Query<DataParams>,
) -> Result<Json<DataResponse>, AppError> {
    let req = params.into_request()?;
    let orch = app.orchestrator.clone();
    let resp = tokio::task::spawn_blocking(move || orch.query(&req, chrono::Utc::now()))
        .await
        .map_err(AppError::join)??;
    Ok(Json(resp))
}
