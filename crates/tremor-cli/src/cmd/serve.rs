use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tremor_core::pipeline::{Orchestrator, PipelineContext};

pub fn run(root: &Path, port: u16) -> Result<()> {
    let ctx = PipelineContext::open(root).context("failed to open pipeline")?;
    let orchestrator = Arc::new(Orchestrator::new(ctx)?);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(tremor_server::serve(orchestrator, port))
}
