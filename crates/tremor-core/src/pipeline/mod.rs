//! Pipeline orchestration: acquire, extract, validate, merge, alert.
//!
//! One [`Orchestrator`] owns the [`PipelineContext`] and an in-process run
//! lock. A run moves `Acquiring -> Extracting -> Merging` and ends in
//! `Succeeded` or `Failed`; every run, whatever its outcome, produces one
//! [`PipelineRunRecord`] in the pipeline database. Failed runs never touch
//! the dataset.

pub mod db;
pub mod record;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock, TryLockError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

use crate::acquire::{Fetcher, HttpFetcher, SourceAcquirer};
use crate::alert::AlertEvaluator;
use crate::config::Config;
use crate::error::{AcquisitionError, ExtractionError, Result, TremorError};
use crate::extract::{extract, ExtractionMode};
use crate::notify::{notifier_from_config, Dispatcher, Notifier};
use crate::paths;
use crate::sample::TremorSample;
use crate::serve::{self, DataResponse, QueryRequest};
use crate::store::DatasetStore;
use crate::subscribers::{SubscriberSource, YamlSubscribers};

use db::{PipelineDb, SourceAnchor};
use record::{DeliveryRecord, PipelineRunRecord, RunOutcome, RunTrigger};

// ---------------------------------------------------------------------------
// PipelineContext
// ---------------------------------------------------------------------------

/// Everything a run needs, built once per process.
pub struct PipelineContext {
    pub root: PathBuf,
    pub config: Config,
    pub store: DatasetStore,
    pub db: PipelineDb,
    pub fetcher: Box<dyn Fetcher>,
    pub subscribers: Box<dyn SubscriberSource>,
    pub notifier: Box<dyn Notifier>,
}

impl PipelineContext {
    /// Load `.tremor/config.yaml` under `root` and wire the default
    /// collaborators: HTTP fetcher, YAML subscriber file, configured notifier.
    pub fn open(root: &Path) -> Result<Self> {
        let config = Config::load(root)?;
        config.ensure_valid()?;
        let fetcher = Box::new(HttpFetcher::new(config.source.user_agent.clone()));
        let subscribers = Box::new(YamlSubscribers::for_root(root));
        let notifier = notifier_from_config(&config.dispatch);
        Self::from_parts(root, config, fetcher, subscribers, notifier)
    }

    pub fn from_parts(
        root: &Path,
        config: Config,
        fetcher: Box<dyn Fetcher>,
        subscribers: Box<dyn SubscriberSource>,
        notifier: Box<dyn Notifier>,
    ) -> Result<Self> {
        let store = DatasetStore::from_config(root, &config.store);
        let db = PipelineDb::open(&paths::pipeline_db_path(root))?;
        Ok(Self {
            root: root.to_path_buf(),
            config,
            store,
            db,
            fetcher,
            subscribers,
            notifier,
        })
    }
}

// ---------------------------------------------------------------------------
// Run state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum RunState {
    Acquiring,
    Extracting,
    Merging,
    Succeeded,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Acquiring => "acquiring",
            Self::Extracting => "extracting",
            Self::Merging => "merging",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        })
    }
}

fn enter(state: RunState) {
    debug!(state = %state, "run state");
}

/// Why a run failed, as recorded in `error_kind` / `error_message`.
struct RunFailure {
    kind: String,
    message: String,
}

impl RunFailure {
    fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl From<AcquisitionError> for RunFailure {
    fn from(e: AcquisitionError) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

impl From<ExtractionError> for RunFailure {
    fn from(e: ExtractionError) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

impl From<TremorError> for RunFailure {
    fn from(e: TremorError) -> Self {
        Self::new("store", e.to_string())
    }
}

/// Held under the run lock between runs.
struct RunMemory {
    acquirer: SourceAcquirer,
    /// Mode picked by the most recent run.
    selected: ExtractionMode,
    /// Per mode: hash and anchor of the last successfully merged image,
    /// mirrored in the pipeline database.
    anchors: HashMap<ExtractionMode, SourceAnchor>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Health {
    pub ok: bool,
    pub mode: ExtractionMode,
    pub updated_at: Option<DateTime<Utc>>,
    pub rows: usize,
    pub running: bool,
    pub last_run: Option<RunSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    ctx: PipelineContext,
    memory: Mutex<RunMemory>,
    /// Mode of the data currently in the store.
    serving_mode: RwLock<ExtractionMode>,
    run_budget: Duration,
}

impl Orchestrator {
    /// Bootstraps the dataset and restores the serving mode from the last
    /// successful run, and the per-mode image anchors.
    pub fn new(ctx: PipelineContext) -> Result<Self> {
        let source = ctx.store.bootstrap()?;
        info!(source = ?source, path = %ctx.store.path().display(), "dataset ready");

        let serving = ctx
            .db
            .last_success()?
            .map(|r| r.mode)
            .unwrap_or_default();
        let anchors = ctx.db.load_anchors()?;
        let cfg = &ctx.config;
        let acquirer = SourceAcquirer::new(
            cfg.retry.clone(),
            Duration::from_secs(cfg.source.timeout_secs),
            cfg.source.stale_after_repeats,
        );
        let run_budget = Duration::from_secs(cfg.schedule.run_budget_secs);

        Ok(Self {
            ctx,
            memory: Mutex::new(RunMemory {
                acquirer,
                selected: serving,
                anchors,
            }),
            serving_mode: RwLock::new(serving),
            run_budget,
        })
    }

    pub fn with_run_budget(mut self, budget: Duration) -> Self {
        self.run_budget = budget;
        self
    }

    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    pub fn config(&self) -> &Config {
        &self.ctx.config
    }

    pub fn current_mode(&self) -> ExtractionMode {
        *self
            .serving_mode
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_running(&self) -> bool {
        matches!(self.memory.try_lock(), Err(TryLockError::WouldBlock))
    }

    /// Execute one run now. Returns `RunInProgress` without waiting if
    /// another run holds the lock.
    pub fn run_once(&self, trigger: RunTrigger) -> Result<PipelineRunRecord> {
        let mut memory = match self.memory.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Err(TremorError::RunInProgress),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };

        let run_id = Uuid::new_v4();
        let span = info_span!("run", %run_id, trigger = ?trigger);
        let _enter = span.enter();

        let started_at = Utc::now();
        let clock = Instant::now();
        let mut rec = PipelineRunRecord {
            run_id,
            started_at,
            finished_at: started_at,
            trigger,
            mode: memory.selected,
            source_url: None,
            source_hash: None,
            primary_stale: false,
            raw_row_count: 0,
            parsed_row_count: 0,
            rows_after_validation: 0,
            merge: None,
            outcome: RunOutcome::Failed,
            error_kind: None,
            error_message: None,
            rows: 0,
            last_ts: None,
            deliveries: Vec::new(),
        };

        match self.execute(&mut memory, &mut rec, clock) {
            Ok(()) => {
                rec.outcome = RunOutcome::Success;
                enter(RunState::Succeeded);
            }
            Err(failure) => {
                enter(RunState::Failed);
                warn!(error_kind = %failure.kind, error = %failure.message, "run failed, dataset untouched");
                rec.error_kind = Some(failure.kind);
                rec.error_message = Some(failure.message);
            }
        }

        let latest = match self.ctx.store.read_all() {
            Ok(all) => {
                rec.rows = all.len();
                rec.last_ts = all.last().map(|s| s.timestamp);
                all.last().cloned()
            }
            Err(e) => {
                warn!(error = %e, "could not read dataset after run");
                None
            }
        };

        if rec.is_success() && self.ctx.config.alerts.enabled {
            if let Some(latest) = latest {
                match self.alert_cycle(&latest) {
                    Ok(deliveries) => rec.deliveries = deliveries,
                    Err(e) => warn!(error = %e, "alert cycle failed"),
                }
            }
        }

        rec.finished_at = Utc::now();
        self.ctx
            .db
            .insert_run(&rec, self.ctx.config.runs.retention)?;
        info!(
            outcome = ?rec.outcome,
            mode = %rec.mode,
            rows = rec.rows,
            deliveries = rec.deliveries.len(),
            elapsed_ms = rec.duration_ms(),
            "run finished"
        );
        Ok(rec)
    }

    fn execute(
        &self,
        memory: &mut RunMemory,
        rec: &mut PipelineRunRecord,
        clock: Instant,
    ) -> std::result::Result<(), RunFailure> {
        let cfg = &self.ctx.config;
        let fetcher = self.ctx.fetcher.as_ref();

        enter(RunState::Acquiring);
        let primary = memory.acquirer.fetch(fetcher, &cfg.source.primary_url)?;
        rec.primary_stale = primary.stale;

        let fallback_url = cfg
            .source
            .fallback_url
            .as_deref()
            .filter(|u| !u.trim().is_empty());
        let mode = if primary.stale && fallback_url.is_some() {
            ExtractionMode::Fallback
        } else {
            ExtractionMode::Primary
        };
        if mode != memory.selected {
            info!(from = %memory.selected, to = %mode, "extraction mode switched");
            memory.selected = mode;
        }
        rec.mode = mode;

        let acquisition = match (mode, fallback_url) {
            (ExtractionMode::Fallback, Some(url)) => memory.acquirer.fetch(fetcher, url)?,
            _ => primary,
        };
        rec.source_url = Some(acquisition.url.clone());
        rec.source_hash = Some(acquisition.hash.clone());

        let profile = cfg.extraction.profile(mode);
        let anchor = match memory.anchors.get(&mode) {
            Some(known) if known.hash == acquisition.hash => known.anchor,
            _ => profile.snap(acquisition.fetched_at),
        };

        enter(RunState::Extracting);
        let extraction = extract(&acquisition.bytes, profile, anchor)?;
        rec.raw_row_count = extraction.raw_columns;
        rec.parsed_row_count = extraction.parsed_columns;

        let samples: Vec<TremorSample> = extraction
            .samples
            .into_iter()
            .filter(|s| s.is_valid())
            .collect();
        rec.rows_after_validation = samples.len();
        let dropped = rec.parsed_row_count.saturating_sub(samples.len());
        if dropped > 0 {
            warn!(dropped, "dropped non-finite or non-positive samples");
        }

        let elapsed = clock.elapsed();
        if elapsed > self.run_budget {
            return Err(RunFailure::new(
                "run_timeout",
                format!(
                    "run took {}ms, budget is {}ms",
                    elapsed.as_millis(),
                    self.run_budget.as_millis()
                ),
            ));
        }

        enter(RunState::Merging);
        let stats = self.ctx.store.append_or_update(&samples)?;
        info!(
            inserted = stats.inserted,
            updated = stats.updated,
            rows = stats.after,
            written = stats.written,
            "merged samples"
        );
        rec.merge = Some(stats);

        let known = SourceAnchor {
            mode,
            hash: acquisition.hash,
            anchor,
        };
        if memory.anchors.get(&mode) != Some(&known) {
            if let Err(e) = self.ctx.db.save_anchor(&known) {
                warn!(error = %e, "could not persist image anchor");
            }
            memory.anchors.insert(mode, known);
        }
        *self
            .serving_mode
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = mode;
        Ok(())
    }

    /// Evaluate alerts for the newest sample, commit all states in one
    /// transaction, then dispatch.
    fn alert_cycle(&self, latest: &TremorSample) -> Result<Vec<DeliveryRecord>> {
        let cfg = &self.ctx.config;
        let subscribers = self.ctx.subscribers.list_active_subscribers()?;
        let previous = self.ctx.db.load_alert_states()?;

        let evaluation = AlertEvaluator::new(&cfg.alerts).evaluate(
            &subscribers,
            &previous,
            latest.value,
            latest.timestamp,
            Utc::now(),
        );

        let active: HashSet<String> = subscribers.iter().map(|s| s.id.clone()).collect();
        let pruned = self.ctx.db.commit_alert_states(&evaluation.states, &active)?;
        if pruned > 0 {
            debug!(pruned, "dropped alert state of inactive subscribers");
        }

        if evaluation.requests.is_empty() {
            return Ok(Vec::new());
        }
        let dispatcher = Dispatcher::from_config(self.ctx.notifier.as_ref(), &cfg.dispatch);
        Ok(dispatcher.dispatch(&evaluation.requests))
    }

    // -----------------------------------------------------------------------
    // Read side
    // -----------------------------------------------------------------------

    pub fn query(&self, req: &QueryRequest, now: DateTime<Utc>) -> Result<DataResponse> {
        serve::query(
            &self.ctx.store,
            &self.ctx.config.serving,
            req,
            self.current_mode(),
            now,
        )
    }

    pub fn list_runs(&self, limit: usize) -> Result<Vec<PipelineRunRecord>> {
        self.ctx.db.list_runs(limit)
    }

    pub fn health(&self) -> Result<Health> {
        let (ok, rows) = match self.ctx.store.row_count() {
            Ok(rows) => (self.ctx.store.path().exists(), rows),
            Err(e) => {
                warn!(error = %e, "dataset unreadable");
                (false, 0)
            }
        };
        let last_run = self.ctx.db.last_run()?.map(|r| RunSummary {
            run_id: r.run_id,
            finished_at: r.finished_at,
            outcome: r.outcome,
            error_kind: r.error_kind,
        });
        Ok(Health {
            ok,
            mode: self.current_mode(),
            updated_at: self.ctx.store.last_modified_at()?,
            rows,
            running: self.is_running(),
            last_run,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
