//! Routes decisions to recipients and records every delivery attempt.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use super::templates::{render_analysis_complete, render_decision, DecisionView};
use super::{Notifier, NotifyError, RenderedMessage};
use crate::config::NotificationConfig;
use crate::detect::engine::AnalysisReport;
use crate::model::{
    Decision, DeliveryStatus, NotificationKind, NotificationLog, Task, TaskEvaluation, TaskSummary,
};
use crate::storage::{Store, StoreResult};

#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    managers: Vec<String>,
    max_extensions: u32,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
        cfg: &NotificationConfig,
        max_extensions: u32,
    ) -> Self {
        Self {
            store,
            notifier,
            managers: cfg.manager_recipients.clone(),
            max_extensions,
        }
    }

    /// Managers for review/intervene; the task's contact plus managers for
    /// close/extend. Order is kept, duplicates dropped.
    pub fn recipients(&self, decision: Decision, task: &Task) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        if matches!(decision, Decision::Close | Decision::Extend) {
            if let Some(contact) = task.assigned_to.as_deref() {
                out.push(contact.to_string());
            }
        }
        for manager in &self.managers {
            if !out.iter().any(|r| r.eq_ignore_ascii_case(manager)) {
                out.push(manager.clone());
            }
        }
        out.retain(|r| !r.trim().is_empty());
        out
    }

    /// Notify about one evaluation. Returns `None` when the evaluation was
    /// already notified. Only store errors propagate.
    pub async fn notify_decision(
        &self,
        task: &Task,
        summary: &TaskSummary,
        evaluation: &TaskEvaluation,
    ) -> StoreResult<Option<DeliveryStatus>> {
        if self.store.notification_exists(evaluation.id)? {
            info!(
                task_id = task.id,
                evaluation_id = evaluation.id,
                "evaluation already notified, skipping"
            );
            return Ok(None);
        }

        let view = DecisionView::new(task, summary, evaluation, self.max_extensions);
        let recipients = self.recipients(evaluation.decision, task);
        let rendered = render_decision(evaluation.decision, &view);
        let status = self
            .deliver(
                evaluation.decision.into(),
                Some(task.id),
                Some(evaluation.id),
                recipients,
                rendered,
            )
            .await?;
        Ok(Some(status))
    }

    /// Completion message for a pattern analysis run, sent to managers.
    pub async fn notify_analysis(&self, report: &AnalysisReport) -> StoreResult<DeliveryStatus> {
        let rendered = render_analysis_complete(report);
        self.deliver(
            NotificationKind::AnalysisComplete,
            None,
            None,
            self.managers.clone(),
            rendered,
        )
        .await
    }

    async fn deliver(
        &self,
        kind: NotificationKind,
        task_id: Option<i64>,
        evaluation_id: Option<i64>,
        recipients: Vec<String>,
        rendered: Result<RenderedMessage, NotifyError>,
    ) -> StoreResult<DeliveryStatus> {
        let (subject, body, outcome) = match rendered {
            Ok(message) => {
                let outcome = if recipients.is_empty() {
                    Err(NotifyError::Delivery("no recipients configured".into()))
                } else {
                    self.notifier.send(&recipients, &message, task_id).await
                };
                (message.subject, message.body, outcome)
            }
            Err(e) => (format!("{kind} notification"), String::new(), Err(e)),
        };

        let (status, error) = match outcome {
            Ok(()) => (DeliveryStatus::Sent, None),
            Err(e) => {
                warn!(
                    kind = %kind,
                    task_id = ?task_id,
                    channel = self.notifier.channel(),
                    error = %e,
                    "notification delivery failed"
                );
                (DeliveryStatus::Failed, Some(e.to_string()))
            }
        };

        self.store.insert_notification(&NotificationLog {
            id: 0,
            task_id,
            evaluation_id,
            kind,
            recipients,
            subject,
            body,
            channel: self.notifier.channel().to_string(),
            status,
            error,
            created_at: Utc::now(),
        })?;
        Ok(status)
    }
}
