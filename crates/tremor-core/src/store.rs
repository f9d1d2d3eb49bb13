//! Canonical tremor dataset: one CSV file, replaced atomically on every merge.
//!
//! Columns are `timestamp,value,value_max,value_avg`. Rows are unique by
//! timestamp and sorted ascending. Serialization is deterministic, so an
//! unchanged dataset re-encodes to identical bytes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::StoreConfig;
use crate::error::{Result, TremorError};
use crate::io;
use crate::paths;
use crate::sample::{format_timestamp, parse_timestamp, whole_seconds, TremorSample};

pub const HEADER: [&str; 4] = ["timestamp", "value", "value_max", "value_avg"];

/// Counts describing one `append_or_update` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MergeStats {
    pub before: usize,
    pub after: usize,
    pub inserted: usize,
    pub updated: usize,
    /// False when the merge changed nothing and the file was left alone.
    pub written: bool,
}

/// Which link of the bootstrap chain populated the canonical file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapSource {
    Existing,
    Legacy,
    Seed,
    Placeholder,
}

/// Untyped view of the stored file for the validation layer.
#[derive(Debug, Clone, Default)]
pub struct RawTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl RawTable {
    pub fn column(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h.trim() == name)
    }

    pub fn cell<'a>(&'a self, row: &'a [String], col: Option<usize>) -> Option<&'a str> {
        col.and_then(|c| row.get(c)).map(|s| s.trim())
    }
}

#[derive(Debug, Clone)]
pub struct DatasetStore {
    path: PathBuf,
    legacy_path: Option<PathBuf>,
    seed_path: Option<PathBuf>,
}

impl DatasetStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            legacy_path: None,
            seed_path: None,
        }
    }

    pub fn from_config(root: &Path, cfg: &StoreConfig) -> Self {
        Self {
            path: paths::resolve(root, &cfg.path),
            legacy_path: cfg.legacy_path.as_deref().map(|p| paths::resolve(root, p)),
            seed_path: cfg.seed_path.as_deref().map(|p| paths::resolve(root, p)),
        }
    }

    pub fn with_bootstrap_chain(mut self, legacy: Option<PathBuf>, seed: Option<PathBuf>) -> Self {
        self.legacy_path = legacy;
        self.seed_path = seed;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // -----------------------------------------------------------------------
    // Bootstrap
    // -----------------------------------------------------------------------

    /// Populate a missing or empty canonical file from the legacy location,
    /// then the seed snapshot, then a header-only placeholder. Runs once at
    /// process start; never consulted afterwards.
    pub fn bootstrap(&self) -> Result<BootstrapSource> {
        if !io::is_missing_or_empty(&self.path) {
            return Ok(BootstrapSource::Existing);
        }

        let chain = [
            (BootstrapSource::Legacy, self.legacy_path.as_deref()),
            (BootstrapSource::Seed, self.seed_path.as_deref()),
        ];
        for (source, candidate) in chain {
            let Some(candidate) = candidate else { continue };
            if io::is_missing_or_empty(candidate) {
                continue;
            }
            match read_lenient(candidate) {
                Ok(samples) => {
                    self.write_all(&samples)?;
                    info!(
                        source = ?source,
                        from = %candidate.display(),
                        rows = samples.len(),
                        "bootstrapped dataset"
                    );
                    return Ok(source);
                }
                Err(e) => {
                    warn!(from = %candidate.display(), error = %e, "unreadable bootstrap candidate, skipping");
                }
            }
        }

        self.write_all(&[])?;
        info!(path = %self.path.display(), "bootstrapped empty dataset placeholder");
        Ok(BootstrapSource::Placeholder)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// All samples in storage order. A missing file reads as empty.
    pub fn read_all(&self) -> Result<Vec<TremorSample>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let table = self.read_table()?;
        decode_strict(&table)
    }

    /// Raw headers and rows. Errors if the file is missing or unreadable.
    pub fn read_table(&self) -> Result<RawTable> {
        let data = std::fs::read(&self.path)?;
        parse_table(&data)
    }

    pub fn row_count(&self) -> Result<usize> {
        if !self.path.exists() {
            return Ok(0);
        }
        Ok(self.read_table()?.rows.len())
    }

    pub fn last_modified_at(&self) -> Result<Option<DateTime<Utc>>> {
        match std::fs::metadata(&self.path) {
            Ok(meta) => Ok(Some(DateTime::<Utc>::from(meta.modified()?))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    // -----------------------------------------------------------------------
    // Merge
    // -----------------------------------------------------------------------

    /// Upsert `samples` keyed by timestamp; a later write wins. The merged
    /// dataset replaces the file atomically, and only if something changed.
    pub fn append_or_update(&self, samples: &[TremorSample]) -> Result<MergeStats> {
        let existing = self.read_all()?;
        let before = existing.len();
        let mut merged: BTreeMap<DateTime<Utc>, TremorSample> =
            existing.into_iter().map(|s| (s.timestamp, s)).collect();

        let mut inserted = 0;
        let mut updated = 0;
        for sample in samples {
            let sample = TremorSample {
                timestamp: whole_seconds(sample.timestamp),
                ..sample.clone()
            };
            match merged.insert(sample.timestamp, sample.clone()) {
                None => inserted += 1,
                Some(prev) if prev != sample => updated += 1,
                Some(_) => {}
            }
        }

        let after = merged.len();
        let written = inserted > 0 || updated > 0 || !self.path.exists();
        if written {
            let rows: Vec<TremorSample> = merged.into_values().collect();
            self.write_all(&rows)?;
        }

        Ok(MergeStats {
            before,
            after,
            inserted,
            updated,
            written,
        })
    }

    fn write_all(&self, samples: &[TremorSample]) -> Result<()> {
        let data = encode(samples)?;
        io::atomic_write(&self.path, &data)
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Encode samples (assumed sorted and unique) as canonical CSV.
pub fn encode(samples: &[TremorSample]) -> Result<Vec<u8>> {
    let mut wtr = csv::Writer::from_writer(vec![]);
    wtr.write_record(HEADER)?;
    for s in samples {
        let (max, avg) = match s.secondary {
            Some(stats) => (stats.max.to_string(), stats.rolling_avg.to_string()),
            None => (String::new(), String::new()),
        };
        wtr.write_record([format_timestamp(&s.timestamp), s.value.to_string(), max, avg])?;
    }
    wtr.into_inner().map_err(|e| TremorError::Io(e.into_error()))
}

fn parse_table(data: &[u8]) -> Result<RawTable> {
    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .has_headers(true)
        .from_reader(data);
    let headers = rdr.headers()?.iter().map(|h| h.to_string()).collect();
    let mut rows = Vec::new();
    for record in rdr.records() {
        let record = record?;
        rows.push(record.iter().map(|c| c.to_string()).collect());
    }
    Ok(RawTable { headers, rows })
}

fn parse_optional(cell: Option<&str>) -> Option<f64> {
    cell.filter(|c| !c.is_empty()).and_then(|c| c.parse().ok())
}

/// Decode one row; `None` when the timestamp or value is unusable.
fn decode_row(table: &RawTable, row: &[String], cols: &Columns) -> Option<TremorSample> {
    let timestamp = parse_timestamp(table.cell(row, cols.timestamp)?)?;
    let value: f64 = table.cell(row, cols.value)?.parse().ok()?;
    let mut sample = TremorSample::new(timestamp, value);
    if let (Some(max), Some(avg)) = (
        parse_optional(table.cell(row, cols.max)),
        parse_optional(table.cell(row, cols.avg)),
    ) {
        sample = sample.with_secondary(max, avg);
    }
    Some(sample)
}

struct Columns {
    timestamp: Option<usize>,
    value: Option<usize>,
    max: Option<usize>,
    avg: Option<usize>,
}

impl Columns {
    fn locate(table: &RawTable) -> Self {
        Self {
            timestamp: table.column("timestamp"),
            value: table.column("value"),
            max: table.column("value_max"),
            avg: table.column("value_avg"),
        }
    }
}

/// The canonical file is written only by this module; any bad row is corruption.
fn decode_strict(table: &RawTable) -> Result<Vec<TremorSample>> {
    let cols = Columns::locate(table);
    if cols.timestamp.is_none() || cols.value.is_none() {
        return Err(TremorError::CorruptRow {
            row: 0,
            reason: "missing timestamp or value column".into(),
        });
    }
    table
        .rows
        .iter()
        .enumerate()
        .map(|(i, row)| {
            decode_row(table, row, &cols).ok_or_else(|| TremorError::CorruptRow {
                row: i + 1,
                reason: format!("unparseable row {row:?}"),
            })
        })
        .collect()
}

/// Bootstrap sources may come from older writers: drop bad rows, sort, and
/// dedupe last-wins.
fn read_lenient(path: &Path) -> Result<Vec<TremorSample>> {
    let table = parse_table(&std::fs::read(path)?)?;
    let cols = Columns::locate(&table);
    if cols.timestamp.is_none() || cols.value.is_none() {
        return Err(TremorError::CorruptRow {
            row: 0,
            reason: format!("{} lacks timestamp/value columns", path.display()),
        });
    }
    let mut by_ts = BTreeMap::new();
    let mut dropped = 0;
    for row in &table.rows {
        match decode_row(&table, row, &cols) {
            Some(s) if s.is_valid() => {
                by_ts.insert(s.timestamp, s);
            }
            _ => dropped += 1,
        }
    }
    if dropped > 0 {
        warn!(from = %path.display(), dropped, "dropped unusable rows during bootstrap");
    }
    Ok(by_ts.into_values().collect())
}
