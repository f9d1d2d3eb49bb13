//! Periodic pipeline runs.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};
use tremor_core::pipeline::record::RunTrigger;
use tremor_core::pipeline::Orchestrator;
use tremor_core::TremorError;

/// Run the pipeline every `schedule.interval_minutes`. The first run happens
/// immediately when `schedule.run_on_start` is set.
pub fn spawn(orchestrator: Arc<Orchestrator>) -> JoinHandle<()> {
    let schedule = orchestrator.config().schedule.clone();
    let period = Duration::from_secs(schedule.interval_minutes.max(1) * 60);
    info!(
        interval_minutes = schedule.interval_minutes,
        run_on_start = schedule.run_on_start,
        "scheduler started"
    );

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        if !schedule.run_on_start {
            // the first tick completes immediately
            interval.tick().await;
        }
        loop {
            interval.tick().await;
            tick(orchestrator.clone()).await;
        }
    })
}

async fn tick(orchestrator: Arc<Orchestrator>) {
    let result =
        tokio::task::spawn_blocking(move || orchestrator.run_once(RunTrigger::Scheduled)).await;
    match result {
        Ok(Ok(rec)) => debug!(run_id = %rec.run_id, outcome = ?rec.outcome, "scheduled run done"),
        Ok(Err(TremorError::RunInProgress)) => {
            info!("scheduled run skipped, another run is in progress")
        }
        Ok(Err(e)) => error!("scheduled run error: {e}"),
        Err(e) => error!("scheduled run panicked: {e}"),
    }
}
