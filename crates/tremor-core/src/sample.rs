use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

/// Canonical on-disk timestamp format.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Naive layouts accepted when coercing timestamps from older files.
const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SecondaryStats {
    pub max: f64,
    pub rolling_avg: f64,
}

/// One point of the tremor amplitude series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TremorSample {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary: Option<SecondaryStats>,
}

impl TremorSample {
    pub fn new(timestamp: DateTime<Utc>, value: f64) -> Self {
        Self {
            timestamp,
            value,
            secondary: None,
        }
    }

    pub fn with_secondary(mut self, max: f64, rolling_avg: f64) -> Self {
        self.secondary = Some(SecondaryStats { max, rolling_avg });
        self
    }

    /// Finite and positive, i.e. representable on the log display scale.
    pub fn is_valid(&self) -> bool {
        self.value.is_finite() && self.value > 0.0
    }
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Drop sub-second precision; the canonical format stores whole seconds.
pub fn whole_seconds(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(0)
}

/// Coerce a stored timestamp string to UTC whole seconds. Accepts RFC 3339
/// and a handful of naive layouts, which are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(whole_seconds(dt.with_timezone(&Utc)));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| whole_seconds(naive.and_utc()))
}
