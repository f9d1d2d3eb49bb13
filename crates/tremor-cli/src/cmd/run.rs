use crate::output::{or_dash, print_json};
use anyhow::{bail, Context};
use std::path::Path;
use tremor_core::pipeline::record::RunTrigger;
use tremor_core::pipeline::{Orchestrator, PipelineContext};

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let ctx = PipelineContext::open(root).context("failed to open pipeline")?;
    let orchestrator = Orchestrator::new(ctx)?;
    let record = orchestrator.run_once(RunTrigger::Manual)?;

    if json {
        print_json(&record)?;
    } else {
        println!("run:      {}", record.run_id);
        println!("outcome:  {:?}", record.outcome);
        println!("mode:     {}", record.mode);
        println!("source:   {}", or_dash(record.source_url.as_deref()));
        if let Some(merge) = &record.merge {
            println!(
                "merged:   {} new, {} updated ({} -> {} rows)",
                merge.inserted, merge.updated, merge.before, merge.after
            );
        }
        println!("rows:     {}", record.rows);
        println!("last ts:  {}", or_dash(record.last_ts));
        println!("took:     {}ms", record.duration_ms());
        if !record.deliveries.is_empty() {
            println!("alerts:   {} deliveries", record.deliveries.len());
        }
    }

    if !record.is_success() {
        bail!(
            "run failed ({}): {}",
            record.error_kind.as_deref().unwrap_or("unknown"),
            record.error_message.as_deref().unwrap_or("no details")
        );
    }
    Ok(())
}
