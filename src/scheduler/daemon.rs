use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::cron::Schedules;
use crate::model::RunStatus;
use crate::workflow::Orchestrator;

/// Main scheduler execution loop.
///
/// Polls the cron table every `poll` and runs due modes one after another,
/// so runs never overlap. Returns once `shutdown` flips to `true`; a run in
/// progress stops before its next task.
pub async fn run_scheduler_loop(
    orchestrator: Arc<Orchestrator>,
    schedules: Schedules,
    poll: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(poll_secs = poll.as_secs(), "scheduler started");
    for entry in schedules.entries() {
        info!(schedule = %entry.mode, cron = %entry.expr, "schedule registered");
    }

    let stop = orchestrator.stop_handle();
    let mut interval = tokio::time::interval(poll);
    let mut last_check = Utc::now();

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    stop.store(true, Ordering::SeqCst);
                    info!("scheduler shutting down");
                    return;
                }
                continue;
            }
        }

        let now = Utc::now();
        let due = schedules.due_between(last_check, now);
        last_check = now;

        for mode in due {
            if stop.load(Ordering::SeqCst) {
                return;
            }
            info!(schedule = %mode, "run due");
            let summary = orchestrator.run(mode, now.date_naive()).await;
            match summary.status {
                RunStatus::Completed => {
                    info!(schedule = %mode, run_id = %summary.run_id, "scheduled run complete")
                }
                RunStatus::CompletedWithErrors => warn!(
                    schedule = %mode,
                    run_id = %summary.run_id,
                    failed = summary.failed,
                    "scheduled run finished with task failures"
                ),
                RunStatus::Failed | RunStatus::Running => error!(
                    schedule = %mode,
                    run_id = %summary.run_id,
                    reason = ?summary.abort_reason,
                    "scheduled run aborted"
                ),
            }
        }
    }
}
