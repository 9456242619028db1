use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::EntityKind;
use crate::analysis::stats::{Trend, TwoSampleTest};

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Open,
    Extended,
    Closed,
    Review,
    Intervene,
}

labelled_enum!(TaskStatus, "task status", {
    Open => "open",
    Extended => "extended",
    Closed => "closed",
    Review => "review",
    Intervene => "intervene",
});

impl TaskStatus {
    /// Still being monitored.
    pub fn is_active(self) -> bool {
        matches!(self, TaskStatus::Open | TaskStatus::Extended)
    }

    /// No further automatic work happens on the task.
    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }
}

/// The metric a task tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    ResponseTime,
    RepairTime,
    Downtime,
    IncidentCount,
    IncidentsHandled,
}

labelled_enum!(IssueType, "issue type", {
    ResponseTime => "response_time",
    RepairTime => "repair_time",
    Downtime => "downtime",
    IncidentCount => "incident_count",
    IncidentsHandled => "incidents_handled",
});

impl IssueType {
    /// A falling value is an improvement.
    pub fn lower_is_better(self) -> bool {
        !matches!(self, IssueType::IncidentsHandled)
    }

    pub fn unit(self) -> &'static str {
        match self {
            IssueType::ResponseTime | IssueType::RepairTime | IssueType::Downtime => "minutes",
            IssueType::IncidentCount | IssueType::IncidentsHandled => "incidents",
        }
    }

    /// Convert a raw percentage change into an improvement percentage
    /// (positive is better).
    pub fn improvement(self, change_pct: f64) -> f64 {
        if self.lower_is_better() {
            -change_pct
        } else {
            change_pct
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Daily,
    Weekly,
}

labelled_enum!(Frequency, "frequency", {
    Daily => "daily",
    Weekly => "weekly",
});

impl Frequency {
    /// Days between measurements, which is also the collection window.
    pub fn cadence_days(self) -> i64 {
        match self {
            Frequency::Daily => 1,
            Frequency::Weekly => 7,
        }
    }
}

/// A monitored improvement objective for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    #[serde(default)]
    pub id: i64,
    pub title: String,
    pub entity_kind: EntityKind,
    pub entity_id: String,
    pub entity_name: String,
    pub issue_type: IssueType,
    pub machine_type: Option<String>,
    pub reason: Option<String>,
    pub frequency: Frequency,
    pub start_date: NaiveDate,
    pub monitor_end_date: NaiveDate,
    pub extension_count: u32,
    pub status: TaskStatus,
    pub evaluated_at: Option<DateTime<Utc>>,
    pub evaluation_notes: Option<String>,
    pub recommendation: Option<String>,
    /// Contact for the monitored entity (e.g. the mechanic's address).
    pub assigned_to: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// New open task with no measurements or extensions.
    pub fn new(
        title: impl Into<String>,
        entity_kind: EntityKind,
        entity_id: impl Into<String>,
        issue_type: IssueType,
        frequency: Frequency,
        start_date: NaiveDate,
        monitor_end_date: NaiveDate,
    ) -> Self {
        let entity_id = entity_id.into();
        Self {
            id: 0,
            title: title.into(),
            entity_kind,
            entity_name: entity_id.clone(),
            entity_id,
            issue_type,
            machine_type: None,
            reason: None,
            frequency,
            start_date,
            monitor_end_date,
            extension_count: 0,
            status: TaskStatus::Open,
            evaluated_at: None,
            evaluation_notes: None,
            recommendation: None,
            assigned_to: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_entity_name(mut self, name: impl Into<String>) -> Self {
        self.entity_name = name.into();
        self
    }

    pub fn with_machine_type(mut self, machine_type: impl Into<String>) -> Self {
        self.machine_type = Some(machine_type.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_assignee(mut self, contact: impl Into<String>) -> Self {
        self.assigned_to = Some(contact.into());
        self
    }

    /// Whether the task was already evaluated on `date`.
    pub fn evaluated_on(&self, date: NaiveDate) -> bool {
        self.evaluated_at
            .map(|at| at.date_naive() == date)
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Measurement
// ---------------------------------------------------------------------------

/// One collected sample for a task. Never mutated after insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    #[serde(default)]
    pub id: i64,
    pub task_id: i64,
    pub measurement_date: NaiveDate,
    pub value: f64,
    pub sample_count: u32,
    /// Change against the task's first measurement.
    pub change_pct: Option<f64>,
    pub is_improved: bool,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryStatus {
    Summarized,
    InsufficientData,
}

labelled_enum!(SummaryStatus, "summary status", {
    Summarized => "summarized",
    InsufficientData => "insufficient_data",
});

/// Analyzer output for one task and extension generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    #[serde(default)]
    pub id: i64,
    pub task_id: i64,
    /// The task's `extension_count` when the summary was produced.
    pub extension_number: u32,
    pub status: SummaryStatus,
    pub measurement_count: usize,
    pub period_start: Option<NaiveDate>,
    pub period_end: Option<NaiveDate>,
    pub baseline_value: Option<f64>,
    pub latest_value: Option<f64>,
    /// Raw `(latest - baseline) / baseline * 100`.
    pub change_pct: Option<f64>,
    /// `change_pct` oriented so that positive means better.
    pub improvement_pct: Option<f64>,
    pub trend: Option<Trend>,
    pub halves: Option<TwoSampleTest>,
    pub moving_average: Vec<Option<f64>>,
    pub period_changes: Vec<Option<f64>>,
    pub is_final: bool,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl TaskSummary {
    pub fn is_sufficient(&self) -> bool {
        self.status == SummaryStatus::Summarized
    }

    /// Trend is significant and moving in the improving direction.
    pub fn trend_improving(&self, issue: IssueType) -> bool {
        self.trend
            .map(|t| t.is_significant && issue.improvement(t.slope) > 0.0)
            .unwrap_or(false)
    }

    /// Trend is significant and moving in the worsening direction.
    pub fn trend_deteriorating(&self, issue: IssueType) -> bool {
        self.trend
            .map(|t| t.is_significant && issue.improvement(t.slope) < 0.0)
            .unwrap_or(false)
    }

    /// Second half differs significantly from the first and is worse.
    pub fn halves_deteriorating(&self, issue: IssueType) -> bool {
        self.halves
            .map(|h| h.is_significant && issue.improvement(h.second_mean - h.first_mean) < 0.0)
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Close,
    Extend,
    Review,
    Intervene,
}

labelled_enum!(Decision, "decision", {
    Close => "close",
    Extend => "extend",
    Review => "review",
    Intervene => "intervene",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceLevel {
    High,
    Medium,
    Low,
}

labelled_enum!(ConfidenceLevel, "confidence level", {
    High => "high",
    Medium => "medium",
    Low => "low",
});

impl ConfidenceLevel {
    pub fn from_confidence(confidence: f64) -> Self {
        if confidence >= 0.95 {
            ConfidenceLevel::High
        } else if confidence >= 0.80 {
            ConfidenceLevel::Medium
        } else {
            ConfidenceLevel::Low
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvaluation {
    #[serde(default)]
    pub id: i64,
    pub task_id: i64,
    pub summary_id: i64,
    pub decision: Decision,
    /// In `[0, 1]`.
    pub confidence: f64,
    pub confidence_level: ConfidenceLevel,
    pub explanation: String,
    pub recommendation: String,
    pub improvement_pct: Option<f64>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Extension
// ---------------------------------------------------------------------------

/// Append-only record of one monitoring-period extension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExtension {
    #[serde(default)]
    pub id: i64,
    pub task_id: i64,
    pub sequence: u32,
    pub original_end_date: NaiveDate,
    pub new_end_date: NaiveDate,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Notification log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Close,
    Extend,
    Review,
    Intervene,
    AnalysisComplete,
}

labelled_enum!(NotificationKind, "notification kind", {
    Close => "close",
    Extend => "extend",
    Review => "review",
    Intervene => "intervene",
    AnalysisComplete => "analysis_complete",
});

impl From<Decision> for NotificationKind {
    fn from(decision: Decision) -> Self {
        match decision {
            Decision::Close => NotificationKind::Close,
            Decision::Extend => NotificationKind::Extend,
            Decision::Review => NotificationKind::Review,
            Decision::Intervene => NotificationKind::Intervene,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sent,
    Failed,
}

labelled_enum!(DeliveryStatus, "delivery status", {
    Sent => "sent",
    Failed => "failed",
});

/// Append-only record of a notification attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationLog {
    #[serde(default)]
    pub id: i64,
    pub task_id: Option<i64>,
    pub evaluation_id: Option<i64>,
    pub kind: NotificationKind,
    pub recipients: Vec<String>,
    pub subject: String,
    pub body: String,
    pub channel: String,
    pub status: DeliveryStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}
