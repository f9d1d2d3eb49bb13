//! Run history and alert state, persisted with redb.
//!
//! # Table design
//!
//! `RUNS` uses a 24-byte composite key:
//! ```text
//! [ started_at_ms: u64 big-endian (8 bytes) | run uuid: 16 bytes ]
//! ```
//! Byte order equals start-time order, so the newest runs are a reverse
//! scan and retention trimming removes from the front.
//!
//! `ALERT_STATE` is keyed by subscriber id. A cycle's states are written in
//! a single transaction together with the removal of rows for subscribers
//! that are no longer active.
//!
//! `ANCHORS` is keyed by extraction mode and holds the hash and right-edge
//! anchor of the last merged image, so an unchanged image re-extracts onto
//! the same timestamps after a restart.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use uuid::Uuid;

use serde::{Deserialize, Serialize};

use crate::alert::AlertState;
use crate::error::{Result, TremorError};
use crate::extract::ExtractionMode;

use super::record::PipelineRunRecord;

// ---------------------------------------------------------------------------
// Table definitions
// ---------------------------------------------------------------------------

/// Key: started_at_ms big-endian ++ uuid bytes. Value: JSON PipelineRunRecord.
const RUNS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("runs");

/// Key: subscriber id. Value: JSON AlertState.
const ALERT_STATE: TableDefinition<&str, &[u8]> = TableDefinition::new("alert_state");

/// Key: extraction mode name. Value: JSON SourceAnchor.
const ANCHORS: TableDefinition<&str, &[u8]> = TableDefinition::new("anchors");

/// Hash and anchor of the last image merged in one mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceAnchor {
    pub mode: ExtractionMode,
    pub hash: String,
    pub anchor: DateTime<Utc>,
}

fn db_err(e: impl std::fmt::Display) -> TremorError {
    TremorError::Db(e.to_string())
}

fn run_key(ts: DateTime<Utc>, id: Uuid) -> [u8; 24] {
    let mut key = [0u8; 24];
    let ms = ts.timestamp_millis().max(0) as u64;
    key[..8].copy_from_slice(&ms.to_be_bytes());
    key[8..].copy_from_slice(id.as_bytes());
    key
}

// ---------------------------------------------------------------------------
// PipelineDb
// ---------------------------------------------------------------------------

pub struct PipelineDb {
    db: Database,
}

impl PipelineDb {
    /// Open or create the database at `path`, creating all tables.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            crate::io::ensure_dir(parent)?;
        }
        let db = Database::create(path).map_err(db_err)?;
        let wt = db.begin_write().map_err(db_err)?;
        wt.open_table(RUNS).map_err(db_err)?;
        wt.open_table(ALERT_STATE).map_err(db_err)?;
        wt.open_table(ANCHORS).map_err(db_err)?;
        wt.commit().map_err(db_err)?;
        Ok(Self { db })
    }

    /// Insert a run record, then drop the oldest records beyond `retention`.
    pub fn insert_run(&self, run: &PipelineRunRecord, retention: usize) -> Result<()> {
        let key = run_key(run.started_at, run.run_id);
        let value = serde_json::to_vec(run)?;
        let wt = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = wt.open_table(RUNS).map_err(db_err)?;
            table
                .insert(key.as_slice(), value.as_slice())
                .map_err(db_err)?;

            let len = table.len().map_err(db_err)? as usize;
            let excess = len.saturating_sub(retention.max(1));
            for _ in 0..excess {
                if table.pop_first().map_err(db_err)?.is_none() {
                    break;
                }
            }
        }
        wt.commit().map_err(db_err)?;
        Ok(())
    }

    /// Newest runs first, at most `limit`.
    pub fn list_runs(&self, limit: usize) -> Result<Vec<PipelineRunRecord>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(RUNS).map_err(db_err)?;
        let mut result = Vec::new();
        for entry in table.iter().map_err(db_err)?.rev().take(limit) {
            let (_, v) = entry.map_err(db_err)?;
            result.push(serde_json::from_slice(v.value())?);
        }
        Ok(result)
    }

    pub fn last_run(&self) -> Result<Option<PipelineRunRecord>> {
        Ok(self.list_runs(1)?.into_iter().next())
    }

    /// Newest successful run, if any is still retained.
    pub fn last_success(&self) -> Result<Option<PipelineRunRecord>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(RUNS).map_err(db_err)?;
        for entry in table.iter().map_err(db_err)?.rev() {
            let (_, v) = entry.map_err(db_err)?;
            let run: PipelineRunRecord = serde_json::from_slice(v.value())?;
            if run.is_success() {
                return Ok(Some(run));
            }
        }
        Ok(None)
    }

    pub fn load_anchors(&self) -> Result<HashMap<ExtractionMode, SourceAnchor>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(ANCHORS).map_err(db_err)?;
        let mut result = HashMap::new();
        for entry in table.iter().map_err(db_err)? {
            let (_, v) = entry.map_err(db_err)?;
            let anchor: SourceAnchor = serde_json::from_slice(v.value())?;
            result.insert(anchor.mode, anchor);
        }
        Ok(result)
    }

    /// Replace the stored anchor for `anchor.mode`.
    pub fn save_anchor(&self, anchor: &SourceAnchor) -> Result<()> {
        let value = serde_json::to_vec(anchor)?;
        let wt = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = wt.open_table(ANCHORS).map_err(db_err)?;
            table
                .insert(anchor.mode.as_str(), value.as_slice())
                .map_err(db_err)?;
        }
        wt.commit().map_err(db_err)?;
        Ok(())
    }

    pub fn load_alert_states(&self) -> Result<HashMap<String, AlertState>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(ALERT_STATE).map_err(db_err)?;
        let mut result = HashMap::new();
        for entry in table.iter().map_err(db_err)? {
            let (k, v) = entry.map_err(db_err)?;
            let state: AlertState = serde_json::from_slice(v.value())?;
            result.insert(k.value().to_string(), state);
        }
        Ok(result)
    }

    /// Upsert `states` and delete rows for subscribers not in `active_ids`,
    /// all in one transaction. Returns the number of pruned rows.
    pub fn commit_alert_states(
        &self,
        states: &[AlertState],
        active_ids: &HashSet<String>,
    ) -> Result<usize> {
        let wt = self.db.begin_write().map_err(db_err)?;
        let pruned;
        {
            let mut table = wt.open_table(ALERT_STATE).map_err(db_err)?;
            let mut stale = Vec::new();
            for entry in table.iter().map_err(db_err)? {
                let (k, _) = entry.map_err(db_err)?;
                let id = k.value().to_string();
                if !active_ids.contains(&id) {
                    stale.push(id);
                }
            }
            for id in &stale {
                table.remove(id.as_str()).map_err(db_err)?;
            }
            pruned = stale.len();

            for state in states {
                let value = serde_json::to_vec(state)?;
                table
                    .insert(state.subscriber_id.as_str(), value.as_slice())
                    .map_err(db_err)?;
            }
        }
        wt.commit().map_err(db_err)?;
        Ok(pruned)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
