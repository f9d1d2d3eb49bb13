//! Read-side validation and windowing of the canonical dataset.
//!
//! Data-quality problems come back as `ok: false` responses with a
//! [`ValidationReason`]; only system faults (a missing or unreadable store)
//! are errors.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ServingConfig;
use crate::error::Result;
use crate::extract::ExtractionMode;
use crate::sample::{format_timestamp, parse_timestamp};
use crate::store::{DatasetStore, RawTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationReason {
    MissingTimestamp,
    EmptyData,
    InsufficientValidData,
    EmptyAfterLimit,
}

impl ValidationReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingTimestamp => "missing_timestamp",
            Self::EmptyData => "empty_data",
            Self::InsufficientValidData => "insufficient_valid_data",
            Self::EmptyAfterLimit => "empty_after_limit",
        }
    }
}

impl fmt::Display for ValidationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named look-back windows accepted by `?range=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RangeAlias {
    #[serde(rename = "24h")]
    Day,
    #[serde(rename = "48h")]
    TwoDays,
    #[serde(rename = "7d")]
    Week,
    #[serde(rename = "30d")]
    Month,
    #[serde(rename = "all")]
    All,
}

impl RangeAlias {
    /// Look-back length; `None` for `all`.
    pub fn duration(self) -> Option<Duration> {
        match self {
            Self::Day => Some(Duration::hours(24)),
            Self::TwoDays => Some(Duration::hours(48)),
            Self::Week => Some(Duration::days(7)),
            Self::Month => Some(Duration::days(30)),
            Self::All => None,
        }
    }
}

impl FromStr for RangeAlias {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "24h" => Ok(Self::Day),
            "48h" => Ok(Self::TwoDays),
            "7d" => Ok(Self::Week),
            "30d" => Ok(Self::Month),
            "all" => Ok(Self::All),
            other => Err(format!(
                "unknown range '{other}' (expected 24h, 48h, 7d, 30d or all)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct QueryRequest {
    pub limit: Option<usize>,
    /// Takes precedence over `limit` when both are present.
    pub range: Option<RangeAlias>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataPoint {
    pub timestamp: String,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DataResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<ValidationReason>,
    pub data: Vec<DataPoint>,
    pub last_ts: Option<String>,
    pub rows: usize,
    pub source: ExtractionMode,
    pub updated_at: Option<DateTime<Utc>>,
    pub is_stale: bool,
}

/// Rows that survived validation and windowing, oldest first.
#[derive(Debug, Clone, PartialEq)]
pub struct Windowed {
    pub points: Vec<(DateTime<Utc>, f64)>,
}

/// A data-quality rejection and the row count at the stage that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejection {
    pub reason: ValidationReason,
    pub rows: usize,
}

/// Coerce, validate and window a raw table. Pure; never touches the disk.
pub fn classify(
    table: &RawTable,
    req: &QueryRequest,
    cfg: &ServingConfig,
    now: DateTime<Utc>,
) -> std::result::Result<Windowed, Rejection> {
    let Some(ts_col) = table.column("timestamp") else {
        return Err(Rejection {
            reason: ValidationReason::MissingTimestamp,
            rows: table.rows.len(),
        });
    };
    let value_col = table.column("value");

    // Last occurrence of a timestamp wins; BTreeMap keeps them ordered.
    let mut coerced: BTreeMap<DateTime<Utc>, Option<f64>> = BTreeMap::new();
    for row in &table.rows {
        let Some(ts) = table.cell(row, Some(ts_col)).and_then(parse_timestamp) else {
            continue;
        };
        let value = table
            .cell(row, value_col)
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|v| v.is_finite());
        coerced.insert(ts, value);
    }
    if coerced.is_empty() {
        return Err(Rejection {
            reason: ValidationReason::EmptyData,
            rows: 0,
        });
    }

    let valid: Vec<(DateTime<Utc>, f64)> = coerced
        .into_iter()
        .filter_map(|(ts, v)| v.map(|v| (ts, v)))
        .collect();
    if valid.len() < cfg.min_valid_rows {
        return Err(Rejection {
            reason: ValidationReason::InsufficientValidData,
            rows: valid.len(),
        });
    }

    let max_limit = cfg.max_limit.max(cfg.min_limit);
    let points: Vec<(DateTime<Utc>, f64)> = match req.range {
        Some(range) => {
            let recent: Vec<_> = match range.duration() {
                Some(span) => {
                    let cutoff = now - span;
                    valid.into_iter().filter(|(ts, _)| *ts > cutoff).collect()
                }
                None => valid,
            };
            tail(recent, max_limit)
        }
        None => {
            let limit = req
                .limit
                .unwrap_or(cfg.default_limit)
                .clamp(cfg.min_limit, max_limit);
            tail(valid, limit)
        }
    };
    if points.is_empty() {
        return Err(Rejection {
            reason: ValidationReason::EmptyAfterLimit,
            rows: 0,
        });
    }
    Ok(Windowed { points })
}

fn tail<T>(mut rows: Vec<T>, n: usize) -> Vec<T> {
    if rows.len() > n {
        rows.drain(..rows.len() - n);
    }
    rows
}

/// Answer a read request against `store`.
pub fn query(
    store: &DatasetStore,
    cfg: &ServingConfig,
    req: &QueryRequest,
    source: ExtractionMode,
    now: DateTime<Utc>,
) -> Result<DataResponse> {
    let table = store.read_table()?;
    let updated_at = store.last_modified_at()?;

    let response = match classify(&table, req, cfg, now) {
        Ok(Windowed { points }) => {
            let last = points.last().map(|(ts, _)| *ts);
            let is_stale = last
                .map(|ts| now - ts > cfg.stale_after())
                .unwrap_or(true);
            let data: Vec<DataPoint> = points
                .iter()
                .map(|(ts, v)| DataPoint {
                    timestamp: format_timestamp(ts),
                    value: v.clamp(cfg.display_min, cfg.display_max),
                })
                .collect();
            DataResponse {
                ok: true,
                reason: None,
                rows: data.len(),
                data,
                last_ts: last.as_ref().map(format_timestamp),
                source,
                updated_at,
                is_stale,
            }
        }
        Err(Rejection { reason, rows }) => {
            tracing::debug!(reason = %reason, rows, "dataset query rejected");
            DataResponse {
                ok: false,
                reason: Some(reason),
                data: Vec::new(),
                last_ts: None,
                rows,
                source,
                updated_at,
                is_stale: true,
            }
        }
    };
    Ok(response)
}
