use crate::output::{or_dash, print_json, print_table};
use anyhow::{anyhow, Context};
use std::path::Path;
use tremor_core::config::Config;
use tremor_core::extract::ExtractionMode;
use tremor_core::paths;
use tremor_core::pipeline::db::PipelineDb;
use tremor_core::serve::{self, QueryRequest, RangeAlias};
use tremor_core::store::DatasetStore;

/// Newest points shown in table output.
const TABLE_TAIL: usize = 20;

pub fn run(root: &Path, limit: Option<usize>, range: Option<&str>, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let range = range
        .map(|r| r.parse::<RangeAlias>().map_err(|e| anyhow!(e)))
        .transpose()?;
    let req = QueryRequest { limit, range };

    let store = DatasetStore::from_config(root, &config.store);
    let response = serve::query(&store, &config.serving, &req, serving_mode(root), chrono::Utc::now())?;

    if json {
        return print_json(&response);
    }

    if !response.ok {
        let reason = response.reason.map(|r| r.as_str()).unwrap_or("unknown");
        println!("No data: {reason} ({} rows)", response.rows);
        return Ok(());
    }

    let skip = response.data.len().saturating_sub(TABLE_TAIL);
    let rows = response.data[skip..]
        .iter()
        .map(|p| vec![p.timestamp.clone(), format!("{:.3}", p.value)])
        .collect();
    print_table(&["TIMESTAMP", "VALUE"], rows);
    println!(
        "\n{} rows, source {}, last {}{}",
        response.rows,
        response.source,
        or_dash(response.last_ts.as_deref()),
        if response.is_stale { " (stale)" } else { "" }
    );
    Ok(())
}

/// Mode of the last successful run. The pipeline database is single-writer,
/// so a running server keeps it locked; report the default mode then. Before
/// the first run there is no database and none is created here.
fn serving_mode(root: &Path) -> ExtractionMode {
    let path = paths::pipeline_db_path(root);
    if !path.exists() {
        return ExtractionMode::default();
    }
    match PipelineDb::open(&path) {
        Ok(db) => db
            .last_success()
            .ok()
            .flatten()
            .map(|r| r.mode)
            .unwrap_or_default(),
        Err(e) => {
            tracing::warn!("pipeline db unavailable, assuming primary mode: {e}");
            ExtractionMode::default()
        }
    }
}
