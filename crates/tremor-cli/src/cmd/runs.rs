use crate::output::{or_dash, print_json, print_table};
use anyhow::Context;
use std::path::Path;
use tremor_core::paths;
use tremor_core::pipeline::db::PipelineDb;
use tremor_core::TremorError;

pub fn run(root: &Path, limit: usize, json: bool) -> anyhow::Result<()> {
    if !paths::config_path(root).exists() {
        return Err(TremorError::NotInitialized.into());
    }
    let db_path = paths::pipeline_db_path(root);
    let runs = if db_path.exists() {
        PipelineDb::open(&db_path)
            .context("failed to open pipeline db")?
            .list_runs(limit.max(1))?
    } else {
        Vec::new()
    };

    if json {
        return print_json(&runs);
    }
    if runs.is_empty() {
        println!("No runs recorded.");
        return Ok(());
    }

    let rows = runs
        .iter()
        .map(|r| {
            vec![
                r.started_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                format!("{:?}", r.trigger).to_lowercase(),
                r.mode.to_string(),
                format!("{:?}", r.outcome).to_lowercase(),
                r.rows.to_string(),
                format!("{}ms", r.duration_ms()),
                or_dash(r.error_kind.as_deref()),
            ]
        })
        .collect();
    print_table(
        &["STARTED", "TRIGGER", "MODE", "OUTCOME", "ROWS", "TOOK", "ERROR"],
        rows,
    );
    Ok(())
}
