//! Sequences collection and evaluation over eligible tasks.
//!
//! Each task is processed in isolation: a failure is recorded against the
//! task and the run moves on. Only an unavailable store aborts the run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::NaiveDate;
use tracing::{error, info, warn};

use super::TaskError;
use crate::config::TrackerConfig;
use crate::model::{Frequency, RunMode, RunSummary, Task, TaskStatus};
use crate::notify::{Dispatcher, Notifier};
use crate::storage::Store;
use crate::tracker::{CollectOutcome, LifecycleManager, LifecycleOutcome, MeasurementCollector};

const ACTIVE: [TaskStatus; 2] = [TaskStatus::Open, TaskStatus::Extended];

pub struct Orchestrator {
    store: Arc<dyn Store>,
    collector: MeasurementCollector,
    lifecycle: LifecycleManager,
    stop: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn Store>, config: &TrackerConfig, notifier: Arc<dyn Notifier>) -> Self {
        let dispatcher = Dispatcher::new(
            store.clone(),
            notifier,
            &config.notifications,
            config.evaluation.max_extensions,
        );
        Self {
            collector: MeasurementCollector::new(store.clone()),
            lifecycle: LifecycleManager::new(store.clone(), config, dispatcher),
            store,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Setting the flag stops the current run before its next task. The flag
    /// is cleared when that run finishes, so later runs proceed.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Execute one workflow run for `date` and persist its summary.
    pub async fn run(&self, mode: RunMode, date: NaiveDate) -> RunSummary {
        let mut summary = RunSummary::start(mode, date);
        info!(run_id = %summary.run_id, mode = %mode, %date, "workflow run started");

        let stages = match mode {
            RunMode::All => vec![RunMode::Daily, RunMode::Weekly, RunMode::Evaluation],
            single => vec![single],
        };
        for stage in stages {
            let mut part = RunSummary::start(stage, date);
            part.run_id = summary.run_id.clone();
            match stage {
                RunMode::Daily => self.collect_stage(Frequency::Daily, date, &mut part),
                RunMode::Weekly => self.collect_stage(Frequency::Weekly, date, &mut part),
                RunMode::Evaluation | RunMode::All => self.evaluation_stage(date, &mut part).await,
            }
            summary.absorb(part);
            if summary.abort_reason.is_some() {
                break;
            }
        }
        summary.finish();
        self.stop.store(false, Ordering::SeqCst);

        info!(
            run_id = %summary.run_id,
            mode = %mode,
            status = %summary.status,
            processed = summary.processed,
            succeeded = summary.succeeded,
            skipped = summary.skipped,
            failed = summary.failed,
            "workflow run finished"
        );
        if let Err(e) = self.store.record_workflow_run(&summary) {
            error!(run_id = %summary.run_id, error = %e, "failed to persist workflow run");
        }
        summary
    }

    fn collect_stage(&self, frequency: Frequency, date: NaiveDate, run: &mut RunSummary) {
        let Some(tasks) = self.active_tasks(run) else {
            return;
        };
        for task in tasks.iter().filter(|t| t.frequency == frequency) {
            if self.stopped(run) {
                return;
            }
            match self.collector.collect(task, date) {
                Ok(CollectOutcome::Recorded(_)) => run.record_success(),
                Ok(CollectOutcome::NotDue | CollectOutcome::NoIncidents) => run.record_skip(),
                Err(e) => {
                    if self.fail(run, task.id, "collect", e) {
                        return;
                    }
                }
            }
        }
    }

    async fn evaluation_stage(&self, date: NaiveDate, run: &mut RunSummary) {
        let Some(tasks) = self.active_tasks(run) else {
            return;
        };
        for task in tasks.iter().filter(|t| t.monitor_end_date <= date) {
            if self.stopped(run) {
                return;
            }
            match self.lifecycle.evaluate_task(task.id, date).await {
                Ok(LifecycleOutcome::Applied { .. }) => run.record_success(),
                Ok(LifecycleOutcome::Skipped { .. }) => run.record_skip(),
                Err(e) => {
                    if self.fail(run, task.id, "evaluate", e) {
                        return;
                    }
                }
            }
        }
    }

    fn active_tasks(&self, run: &mut RunSummary) -> Option<Vec<Task>> {
        match self.store.tasks(&ACTIVE) {
            Ok(tasks) => Some(tasks),
            Err(e) => {
                error!(run_id = %run.run_id, error = %e, "cannot list active tasks, aborting run");
                run.abort(e);
                None
            }
        }
    }

    fn stopped(&self, run: &mut RunSummary) -> bool {
        if self.stop.load(Ordering::SeqCst) {
            warn!(run_id = %run.run_id, "stop requested, ending run early");
            run.abort("stop requested");
            return true;
        }
        false
    }

    /// Records the failure; returns true when the run must abort.
    fn fail(&self, run: &mut RunSummary, task_id: i64, stage: &str, err: TaskError) -> bool {
        warn!(run_id = %run.run_id, task_id, stage, error = %err, "task failed");
        run.record_failure(task_id, stage, &err);
        if err.is_fatal() {
            error!(run_id = %run.run_id, error = %err, "store unavailable, aborting run");
            run.abort(err);
            return true;
        }
        false
    }
}
