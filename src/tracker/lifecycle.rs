//! Applies evaluation decisions to tasks.

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use tracing::{debug, info};

use super::evaluator::Evaluator;
use crate::analysis::summary::summarize;
use crate::config::{AnalysisConfig, TrackerConfig};
use crate::model::{Decision, DeliveryStatus, Task, TaskEvaluation, TaskStatus, TaskSummary};
use crate::notify::Dispatcher;
use crate::storage::{ExtensionRequest, Store, StoreError, TaskOutcome};
use crate::workflow::TaskError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "status")]
pub enum SkipReason {
    Terminal(TaskStatus),
    AlreadyEvaluated,
    /// `monitor_end_date` is still ahead.
    NotDue,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum LifecycleOutcome {
    Skipped {
        reason: SkipReason,
    },
    Applied {
        decision: Decision,
        evaluation_id: i64,
        /// `None` when the evaluation had already been notified.
        notification: Option<DeliveryStatus>,
    },
}

impl LifecycleOutcome {
    pub fn skipped(reason: SkipReason) -> Self {
        LifecycleOutcome::Skipped { reason }
    }

    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self {
            LifecycleOutcome::Skipped { reason } => Some(*reason),
            LifecycleOutcome::Applied { .. } => None,
        }
    }
}

pub struct LifecycleManager {
    store: Arc<dyn Store>,
    evaluator: Evaluator,
    analysis: AnalysisConfig,
    cycle_days: i64,
    dispatcher: Dispatcher,
}

impl LifecycleManager {
    pub fn new(store: Arc<dyn Store>, config: &TrackerConfig, dispatcher: Dispatcher) -> Self {
        Self {
            store,
            evaluator: Evaluator::new(&config.evaluation),
            analysis: config.analysis.clone(),
            cycle_days: config.evaluation.cycle_days,
            dispatcher,
        }
    }

    /// Summarize, evaluate and apply the decision for one task whose window
    /// has ended on or before `today`, then notify.
    ///
    /// Re-running on the same day, or against a task that already reached a
    /// terminal status, is a no-op.
    pub async fn evaluate_task(
        &self,
        task_id: i64,
        today: NaiveDate,
    ) -> Result<LifecycleOutcome, TaskError> {
        let task = self
            .store
            .task(task_id)?
            .ok_or_else(|| StoreError::NotFound(format!("task {task_id}")))?;

        if task.status.is_terminal() {
            debug!(task_id, status = %task.status, "task is terminal, skipping");
            return Ok(LifecycleOutcome::skipped(SkipReason::Terminal(task.status)));
        }
        // Terminal and extended tasks are caught by the other checks; this
        // one covers an extended task whose end date was moved back by hand.
        if task.evaluated_on(today) {
            debug!(task_id, %today, "task already evaluated today, skipping");
            return Ok(LifecycleOutcome::skipped(SkipReason::AlreadyEvaluated));
        }
        if task.monitor_end_date > today {
            return Ok(LifecycleOutcome::skipped(SkipReason::NotDue));
        }

        let (summary, evaluation) = match self.pending_evaluation(&task)? {
            Some(pending) => {
                info!(task_id, evaluation_id = pending.1.id, "resuming unapplied evaluation");
                pending
            }
            None => self.evaluate(&task)?,
        };

        // Stamped with the run date so a same-day rerun sees it.
        let evaluated_at = today.and_time(Utc::now().time()).and_utc();
        self.apply(&task, &summary, &evaluation, evaluated_at)?;
        info!(
            task_id,
            decision = %evaluation.decision,
            confidence = evaluation.confidence,
            improvement_pct = ?evaluation.improvement_pct,
            "evaluation applied"
        );

        let updated = self
            .store
            .task(task_id)?
            .ok_or_else(|| StoreError::NotFound(format!("task {task_id}")))?;
        let notification = self
            .dispatcher
            .notify_decision(&updated, &summary, &evaluation)
            .await?;

        Ok(LifecycleOutcome::Applied {
            decision: evaluation.decision,
            evaluation_id: evaluation.id,
            notification,
        })
    }

    /// A final summary for the current generation that was evaluated but
    /// whose decision never reached the task.
    fn pending_evaluation(
        &self,
        task: &Task,
    ) -> Result<Option<(TaskSummary, TaskEvaluation)>, TaskError> {
        let Some(summary) = self
            .store
            .summaries(task.id)?
            .into_iter()
            .find(|s| s.extension_number == task.extension_count && s.is_final)
        else {
            return Ok(None);
        };
        let evaluation = self
            .store
            .evaluations(task.id)?
            .into_iter()
            .find(|e| e.summary_id == summary.id);
        Ok(evaluation.map(|e| (summary, e)))
    }

    fn evaluate(&self, task: &Task) -> Result<(TaskSummary, TaskEvaluation), TaskError> {
        let measurements = self.store.measurements(task.id)?;
        let now = Utc::now();

        let mut summary = summarize(task, &measurements, &self.analysis, now)?;
        summary.id = self.store.upsert_summary(&summary)?;
        debug!(task_id = task.id, summary_id = summary.id, status = %summary.status, "summary stored");

        let mut evaluation = self
            .evaluator
            .evaluate(task, &summary)
            .into_evaluation(&summary, now);
        evaluation.id = self.store.insert_evaluation(&evaluation)?;
        Ok((summary, evaluation))
    }

    fn apply(
        &self,
        task: &Task,
        summary: &TaskSummary,
        evaluation: &TaskEvaluation,
        now: DateTime<Utc>,
    ) -> Result<(), TaskError> {
        let status = match evaluation.decision {
            Decision::Extend => {
                let extension = self.store.extend_task(&ExtensionRequest {
                    task_id: task.id,
                    summary_id: summary.id,
                    expected_extension_count: task.extension_count,
                    original_end_date: task.monitor_end_date,
                    new_end_date: task.monitor_end_date + Duration::days(self.cycle_days),
                    reason: evaluation.explanation.clone(),
                    evaluated_at: now,
                    notes: evaluation.explanation.clone(),
                    recommendation: evaluation.recommendation.clone(),
                })?;
                info!(
                    task_id = task.id,
                    sequence = extension.sequence,
                    new_end_date = %extension.new_end_date,
                    "monitoring extended"
                );
                return Ok(());
            }
            Decision::Close => TaskStatus::Closed,
            Decision::Review => TaskStatus::Review,
            Decision::Intervene => TaskStatus::Intervene,
        };
        self.store.apply_outcome(&TaskOutcome {
            task_id: task.id,
            status,
            evaluated_at: now,
            notes: evaluation.explanation.clone(),
            recommendation: evaluation.recommendation.clone(),
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NotificationConfig;
    use crate::model::{EntityKind, Frequency, IssueType, Measurement};
    use crate::notify::LogNotifier;
    use crate::storage::SqliteStore;

    fn date(m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, m, d).unwrap()
    }

    fn setup() -> (Arc<SqliteStore>, LifecycleManager) {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let config = TrackerConfig::default();
        let notifications = NotificationConfig {
            manager_recipients: vec!["maint-manager@plant.test".into()],
            ..NotificationConfig::default()
        };
        let dispatcher = Dispatcher::new(
            store.clone(),
            Arc::new(LogNotifier),
            &notifications,
            config.evaluation.max_extensions,
        );
        let manager = LifecycleManager::new(store.clone(), &config, dispatcher);
        (store, manager)
    }

    fn task_with_series(store: &SqliteStore, values: &[f64]) -> Task {
        let mut task = Task::new(
            "Repair time",
            EntityKind::Mechanic,
            "M-17",
            IssueType::RepairTime,
            Frequency::Daily,
            date(3, 1),
            date(3, 14),
        )
        .with_assignee("m17@plant.test");
        task.id = store.insert_task(&task).unwrap();
        for (i, v) in values.iter().enumerate() {
            store
                .upsert_measurement(&Measurement {
                    id: 0,
                    task_id: task.id,
                    measurement_date: date(3, 1) + Duration::days(i as i64),
                    value: *v,
                    sample_count: 2,
                    change_pct: None,
                    is_improved: false,
                    notes: None,
                    created_at: Utc::now(),
                })
                .unwrap();
        }
        task
    }

    #[tokio::test]
    async fn test_strong_improvement_closes_and_notifies() {
        let (store, manager) = setup();
        let task = task_with_series(&store, &[40.0, 38.0, 36.5, 35.0, 33.0, 31.5, 30.0, 29.0]);

        let outcome = manager.evaluate_task(task.id, date(3, 14)).await.unwrap();
        match outcome {
            LifecycleOutcome::Applied {
                decision,
                notification,
                ..
            } => {
                assert_eq!(decision, Decision::Close);
                assert_eq!(notification, Some(DeliveryStatus::Sent));
            }
            other => panic!("expected applied outcome, got {other:?}"),
        }
        let stored = store.task(task.id).unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Closed);
        assert!(stored.evaluated_at.is_some());
        assert_eq!(store.notifications(task.id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_closed_task_same_day_is_noop() {
        let (store, manager) = setup();
        let task = task_with_series(&store, &[40.0, 38.0, 36.5, 35.0, 33.0, 31.5, 30.0, 29.0]);
        manager.evaluate_task(task.id, date(3, 14)).await.unwrap();

        let again = manager.evaluate_task(task.id, date(3, 14)).await.unwrap();
        assert_eq!(
            again.skip_reason(),
            Some(SkipReason::Terminal(TaskStatus::Closed))
        );
        assert_eq!(store.evaluations(task.id).unwrap().len(), 1);
        assert_eq!(store.notifications(task.id).unwrap().len(), 1);
        assert!(store.extensions(task.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_partial_progress_extends_window() {
        let (store, manager) = setup();
        // ~10% better with a flat second half: partial progress.
        let task = task_with_series(&store, &[40.0, 44.0, 37.0, 41.0, 35.0, 39.0, 34.0, 36.0]);

        let outcome = manager.evaluate_task(task.id, date(3, 14)).await.unwrap();
        assert!(matches!(
            outcome,
            LifecycleOutcome::Applied {
                decision: Decision::Extend,
                ..
            }
        ));

        let stored = store.task(task.id).unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Extended);
        assert_eq!(stored.extension_count, 1);
        assert_eq!(stored.monitor_end_date, date(3, 28));

        let extensions = store.extensions(task.id).unwrap();
        assert_eq!(extensions.len(), 1);
        assert_eq!(extensions[0].original_end_date, date(3, 14));
        assert!(!store.summaries(task.id).unwrap()[0].is_final);

        // Window now ends 3/28.
        let early = manager.evaluate_task(task.id, date(3, 20)).await.unwrap();
        assert_eq!(early.skip_reason(), Some(SkipReason::NotDue));
    }

    #[tokio::test]
    async fn test_end_date_moved_back_same_day_is_already_evaluated() {
        let (store, manager) = setup();
        let task = task_with_series(&store, &[40.0, 44.0, 37.0, 41.0, 35.0, 39.0, 34.0, 36.0]);
        manager.evaluate_task(task.id, date(3, 14)).await.unwrap();

        store
            .pool()
            .get()
            .unwrap()
            .execute(
                "UPDATE tasks SET monitor_end_date = '2024-03-14' WHERE id = ?1",
                [task.id],
            )
            .unwrap();

        let again = manager.evaluate_task(task.id, date(3, 14)).await.unwrap();
        assert_eq!(again.skip_reason(), Some(SkipReason::AlreadyEvaluated));
        assert_eq!(store.extensions(task.id).unwrap().len(), 1);
        assert_eq!(store.evaluations(task.id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_task_is_not_found() {
        let (_store, manager) = setup();
        let err = manager.evaluate_task(404, date(3, 14)).await.unwrap_err();
        assert!(matches!(err, TaskError::Store(StoreError::NotFound(_))));
    }
}
