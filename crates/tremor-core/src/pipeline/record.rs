use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::extract::ExtractionMode;
use crate::store::MergeStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    Scheduled,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Delivered,
    Failed,
    /// Permanent failure; not retried this cycle.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub subscriber_id: String,
    pub channel_id: String,
    pub outcome: DeliveryOutcome,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Diagnostics for one orchestrator invocation. Written once, never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRunRecord {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub trigger: RunTrigger,
    pub mode: ExtractionMode,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub source_hash: Option<String>,
    /// Primary source was flagged stale this run.
    #[serde(default)]
    pub primary_stale: bool,
    /// Plot columns with any curve pixel.
    pub raw_row_count: usize,
    /// Samples extracted, one per timestamp.
    pub parsed_row_count: usize,
    pub rows_after_validation: usize,
    #[serde(default)]
    pub merge: Option<MergeStats>,
    pub outcome: RunOutcome,
    #[serde(default)]
    pub error_kind: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    /// Store rows after the run.
    pub rows: usize,
    pub last_ts: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deliveries: Vec<DeliveryRecord>,
}

impl PipelineRunRecord {
    pub fn is_success(&self) -> bool {
        self.outcome == RunOutcome::Success
    }

    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}
