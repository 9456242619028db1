//! askama templates for decision and analysis-completion messages.

use askama::Template;

use super::{NotifyError, RenderedMessage};
use crate::detect::engine::AnalysisReport;
use crate::detect::Severity;
use crate::model::{Decision, NotificationKind, Task, TaskEvaluation, TaskSummary};

/// Figures shared by the four decision templates, preformatted.
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionView {
    pub task_id: i64,
    pub title: String,
    pub entity_name: String,
    pub issue: String,
    pub start_date: String,
    pub end_date: String,
    pub extension_count: u32,
    pub max_extensions: u32,
    pub measurement_count: usize,
    pub baseline: String,
    pub latest: String,
    pub improvement: String,
    pub confidence: String,
    pub explanation: String,
    pub recommendation: String,
}

impl DecisionView {
    pub fn new(
        task: &Task,
        summary: &TaskSummary,
        evaluation: &TaskEvaluation,
        max_extensions: u32,
    ) -> Self {
        let unit = task.issue_type.unit();
        let value = |v: Option<f64>| match v {
            Some(v) => format!("{v:.1} {unit}"),
            None => "n/a".to_string(),
        };
        Self {
            task_id: task.id,
            title: task.title.clone(),
            entity_name: task.entity_name.clone(),
            issue: task.issue_type.as_str().replace('_', " "),
            start_date: task.start_date.to_string(),
            end_date: task.monitor_end_date.to_string(),
            extension_count: task.extension_count,
            max_extensions,
            measurement_count: summary.measurement_count,
            baseline: value(summary.baseline_value),
            latest: value(summary.latest_value),
            improvement: match evaluation.improvement_pct {
                Some(p) => format!("{p:+.1}%"),
                None => "n/a".to_string(),
            },
            confidence: format!(
                "{:.0}% ({})",
                evaluation.confidence * 100.0,
                evaluation.confidence_level
            ),
            explanation: evaluation.explanation.clone(),
            recommendation: evaluation.recommendation.clone(),
        }
    }
}

#[derive(Template)]
#[template(path = "notify/close.txt")]
struct CloseTemplate<'a> {
    view: &'a DecisionView,
}

#[derive(Template)]
#[template(path = "notify/extend.txt")]
struct ExtendTemplate<'a> {
    view: &'a DecisionView,
}

#[derive(Template)]
#[template(path = "notify/review.txt")]
struct ReviewTemplate<'a> {
    view: &'a DecisionView,
}

#[derive(Template)]
#[template(path = "notify/intervene.txt")]
struct InterveneTemplate<'a> {
    view: &'a DecisionView,
}

pub fn render_decision(decision: Decision, view: &DecisionView) -> Result<RenderedMessage, NotifyError> {
    let (subject, body) = match decision {
        Decision::Close => (
            format!("Task closed: {}", view.title),
            CloseTemplate { view }.render()?,
        ),
        Decision::Extend => (
            format!("Monitoring extended: {}", view.title),
            ExtendTemplate { view }.render()?,
        ),
        Decision::Review => (
            format!("Review needed: {}", view.title),
            ReviewTemplate { view }.render()?,
        ),
        Decision::Intervene => (
            format!("Intervention required: {}", view.title),
            InterveneTemplate { view }.render()?,
        ),
    };
    Ok(RenderedMessage {
        kind: decision.into(),
        subject,
        body,
    })
}

// ---------------------------------------------------------------------------
// Analysis completion
// ---------------------------------------------------------------------------

pub struct DimensionLine {
    pub name: String,
    pub flagged: usize,
    pub inserted: usize,
}

pub struct FindingLine {
    pub severity: String,
    pub description: String,
}

#[derive(Template)]
#[template(path = "notify/analysis_complete.txt")]
struct AnalysisCompleteTemplate<'a> {
    run_id: &'a str,
    period_start: String,
    period_end: String,
    total: usize,
    high: usize,
    medium: usize,
    low: usize,
    dimensions: Vec<DimensionLine>,
    skipped: Vec<String>,
    top: Vec<FindingLine>,
}

/// Findings listed in the completion message, most severe first.
const TOP_FINDINGS: usize = 5;

pub fn render_analysis_complete(report: &AnalysisReport) -> Result<RenderedMessage, NotifyError> {
    let count = |sev: Severity| report.findings.iter().filter(|f| f.severity == sev).count();

    let mut ranked: Vec<_> = report.findings.iter().collect();
    ranked.sort_by(|a, b| b.severity.cmp(&a.severity));

    let template = AnalysisCompleteTemplate {
        run_id: &report.run_id,
        period_start: report.period_start.to_string(),
        period_end: report.period_end.to_string(),
        total: report.findings.len(),
        high: count(Severity::High),
        medium: count(Severity::Medium),
        low: count(Severity::Low),
        dimensions: report
            .dimensions
            .iter()
            .map(|d| DimensionLine {
                name: d.dimension.as_str().replace('_', " "),
                flagged: d.flagged,
                inserted: d.inserted,
            })
            .collect(),
        skipped: report
            .skipped
            .iter()
            .map(|s| format!("{} (last run {} day(s) ago)", s.dimension, s.days_since))
            .collect(),
        top: ranked
            .into_iter()
            .take(TOP_FINDINGS)
            .map(|f| FindingLine {
                severity: f.severity.as_str().to_uppercase(),
                description: f.description.clone(),
            })
            .collect(),
    };

    Ok(RenderedMessage {
        kind: NotificationKind::AnalysisComplete,
        subject: format!(
            "Pattern analysis {} to {}: {} finding(s)",
            report.period_start,
            report.period_end,
            report.findings.len()
        ),
        body: template.render()?,
    })
}
