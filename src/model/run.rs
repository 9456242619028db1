//! Run records for workflow and pattern-analysis executions.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::detect::TimeDimension;

/// Which part of the workflow a run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Daily,
    Weekly,
    Evaluation,
    All,
}

labelled_enum!(RunMode, "run mode", {
    Daily => "daily",
    Weekly => "weekly",
    Evaluation => "evaluation",
    All => "all",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    /// Finished, but at least one task failed.
    CompletedWithErrors,
    /// Aborted because the store became unavailable.
    Failed,
}

labelled_enum!(RunStatus, "run status", {
    Running => "running",
    Completed => "completed",
    CompletedWithErrors => "completed_with_errors",
    Failed => "failed",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub task_id: i64,
    pub stage: String,
    pub error: String,
}

/// Outcome of one orchestrator run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub mode: RunMode,
    pub run_date: NaiveDate,
    pub status: RunStatus,
    pub processed: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub failures: Vec<TaskFailure>,
    pub abort_reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunSummary {
    pub fn start(mode: RunMode, run_date: NaiveDate) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            mode,
            run_date,
            status: RunStatus::Running,
            processed: 0,
            succeeded: 0,
            skipped: 0,
            failed: 0,
            failures: Vec::new(),
            abort_reason: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn record_success(&mut self) {
        self.processed += 1;
        self.succeeded += 1;
    }

    pub fn record_skip(&mut self) {
        self.processed += 1;
        self.skipped += 1;
    }

    pub fn record_failure(&mut self, task_id: i64, stage: &str, error: impl ToString) {
        self.processed += 1;
        self.failed += 1;
        self.failures.push(TaskFailure {
            task_id,
            stage: stage.to_string(),
            error: error.to_string(),
        });
    }

    /// Fold a sub-run (e.g. the daily part of an `all` run) into this one.
    pub fn absorb(&mut self, other: RunSummary) {
        self.processed += other.processed;
        self.succeeded += other.succeeded;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.failures.extend(other.failures);
        if other.abort_reason.is_some() {
            self.abort_reason = other.abort_reason;
        }
    }

    pub fn finish(&mut self) {
        self.status = if self.abort_reason.is_some() {
            RunStatus::Failed
        } else if self.failed > 0 {
            RunStatus::CompletedWithErrors
        } else {
            RunStatus::Completed
        };
        self.finished_at = Some(Utc::now());
    }

    pub fn abort(&mut self, reason: impl ToString) {
        self.abort_reason = Some(reason.to_string());
        self.finish();
    }
}

/// A pattern analysis execution over one time dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRun {
    pub run_id: String,
    pub dimension: TimeDimension,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub status: RunStatus,
    pub forced: bool,
    pub findings_count: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}
