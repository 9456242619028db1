//! Read-only queries behind `maintrack query`.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::analysis::pareto::{breakdown, cross_patterns, CrossPattern, ParetoBreakdown, ParetoDimension};
use crate::analysis::patterns::entity_key;
use crate::analysis::repeats::{find_repeats, RepeatReport};
use crate::analysis::stats::{aggregate, compare, Aggregate, Comparison};
use crate::analysis::AnalysisError;
use crate::config::{BreakdownConfig, TrackerConfig};
use crate::detect::{FindingFilter, PatternType, TimeSeriesFinding};
use crate::model::{
    labelled_enum, EntityKind, IncidentFilter, IncidentRecord, Measurement, NotificationLog, Task,
    TaskEvaluation, TaskExtension, TaskSummary,
};
use crate::storage::{Store, StoreError};

#[derive(Debug, Error)]
pub enum QueryError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Analysis(#[from] AnalysisError),

    #[error("invalid query window: {start} is after {end}")]
    InvalidWindow { start: NaiveDate, end: NaiveDate },

    #[error("{0} metrics are not reported per entity")]
    UnsupportedEntity(EntityKind),

    #[error("repeat window must be positive, got {0} minutes")]
    InvalidRepeatWindow(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    ResponseTime,
    RepairTime,
    Downtime,
}

labelled_enum!(Metric, "metric", {
    ResponseTime => "response_time",
    RepairTime => "repair_time",
    Downtime => "downtime",
});

impl Metric {
    fn minutes(self, incident: &IncidentRecord) -> f64 {
        match self {
            Metric::ResponseTime => incident.response_minutes(),
            Metric::RepairTime => incident.repair_minutes(),
            Metric::Downtime => incident.downtime_minutes(),
        }
    }

    /// Pattern whose findings are relevant to this metric.
    fn pattern(self) -> PatternType {
        match self {
            Metric::ResponseTime => PatternType::ResponseTime,
            Metric::RepairTime => PatternType::RepairTime,
            Metric::Downtime => PatternType::Volume,
        }
    }
}

/// Closed incidents between `start` and `end` (inclusive dates).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricQuery {
    pub metric: Metric,
    pub entity_kind: EntityKind,
    /// Report a single entity; the team baseline still covers everyone.
    pub entity_id: Option<String>,
    pub machine_type: Option<String>,
    pub reason: Option<String>,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityMetric {
    pub entity_id: String,
    pub entity_name: String,
    pub incidents: usize,
    pub aggregate: Aggregate,
    pub vs_team: Comparison,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricReport {
    pub metric: Metric,
    pub entity_kind: EntityKind,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub incidents: usize,
    /// `None` when no incidents matched.
    pub team: Option<Aggregate>,
    pub entities: Vec<EntityMetric>,
    /// Stored findings for the same metric whose window overlaps the query.
    pub findings: Vec<TimeSeriesFinding>,
}

/// Closed incidents between `start` and `end` (inclusive dates), broken
/// down by each of `dimensions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParetoQuery {
    pub metric: Metric,
    /// Empty means [`ParetoDimension::DEFAULT`].
    pub dimensions: Vec<ParetoDimension>,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParetoReport {
    pub metric: Metric,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub incidents: usize,
    pub breakdowns: Vec<ParetoBreakdown>,
    pub cross_dimensional: Vec<CrossPattern>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskHistory {
    pub task: Task,
    pub measurements: Vec<Measurement>,
    pub summaries: Vec<TaskSummary>,
    pub evaluations: Vec<TaskEvaluation>,
    pub extensions: Vec<TaskExtension>,
    pub notifications: Vec<NotificationLog>,
    pub latest_summary: Option<TaskSummary>,
    pub latest_evaluation: Option<TaskEvaluation>,
}

pub struct QueryService {
    store: Arc<dyn Store>,
    min_samples: usize,
    breakdown: BreakdownConfig,
}

impl QueryService {
    pub fn new(store: Arc<dyn Store>, config: &TrackerConfig) -> Self {
        Self {
            store,
            min_samples: config.analysis.min_samples,
            breakdown: config.breakdown.clone(),
        }
    }

    /// Per-entity aggregates compared against the team baseline.
    ///
    /// Entities with fewer than `analysis.min_samples` incidents are left
    /// out of `entities` but still count toward the team.
    pub fn metric_report(&self, query: &MetricQuery) -> Result<MetricReport, QueryError> {
        let window = window(query.start, query.end)?;
        if query.entity_kind == EntityKind::Overall {
            return Err(QueryError::UnsupportedEntity(query.entity_kind));
        }

        let mut filter = window.with_status("closed");
        filter.machine_type = query.machine_type.clone();
        filter.reason = query.reason.clone();
        let incidents = self.store.incidents(&filter)?;

        let all: Vec<f64> = incidents.iter().map(|i| query.metric.minutes(i)).collect();
        let team = if all.is_empty() {
            None
        } else {
            Some(aggregate(&all, 1)?)
        };

        let mut grouped: BTreeMap<String, (String, Vec<f64>)> = BTreeMap::new();
        for incident in &incidents {
            let (id, name) = entity_key(query.entity_kind, incident);
            if query.entity_id.as_deref().is_some_and(|wanted| wanted != id) {
                continue;
            }
            grouped
                .entry(id)
                .or_insert_with(|| (name, Vec::new()))
                .1
                .push(query.metric.minutes(incident));
        }

        let mut entities = Vec::with_capacity(grouped.len());
        if let Some(team) = team.as_ref() {
            for (entity_id, (entity_name, values)) in grouped {
                let agg = match aggregate(&values, self.min_samples) {
                    Ok(agg) => agg,
                    Err(AnalysisError::InsufficientData { .. }) => continue,
                    Err(e) => return Err(e.into()),
                };
                entities.push(EntityMetric {
                    entity_id,
                    entity_name,
                    incidents: values.len(),
                    vs_team: compare(&agg, team),
                    aggregate: agg,
                });
            }
        }

        let findings = self
            .store
            .findings(&FindingFilter {
                entity_kind: Some(query.entity_kind),
                entity_id: query.entity_id.clone(),
                pattern: Some(query.metric.pattern()),
                ..FindingFilter::default()
            })?
            .into_iter()
            .filter(|f| f.period_start <= query.end && f.period_end >= query.start)
            .collect();

        Ok(MetricReport {
            metric: query.metric,
            entity_kind: query.entity_kind,
            period_start: query.start,
            period_end: query.end,
            incidents: incidents.len(),
            team,
            entities,
            findings,
        })
    }

    /// Pareto breakdown of the metric per dimension, with the related
    /// factors of each contributor.
    pub fn pareto_report(&self, query: &ParetoQuery) -> Result<ParetoReport, QueryError> {
        let filter = window(query.start, query.end)?.with_status("closed");
        let incidents = self.store.incidents(&filter)?;
        let dimensions: &[ParetoDimension] = if query.dimensions.is_empty() {
            &ParetoDimension::DEFAULT
        } else {
            &query.dimensions
        };

        let breakdowns: Vec<ParetoBreakdown> = dimensions
            .iter()
            .map(|d| {
                breakdown(
                    &incidents,
                    *d,
                    |i| query.metric.minutes(i),
                    self.breakdown.pareto_threshold_pct,
                )
            })
            .collect();
        let cross_dimensional =
            cross_patterns(&incidents, &breakdowns, self.breakdown.related_factors);

        Ok(ParetoReport {
            metric: query.metric,
            period_start: query.start,
            period_end: query.end,
            incidents: incidents.len(),
            breakdowns,
            cross_dimensional,
        })
    }

    /// Repeat failures among all incidents created in the window.
    /// `window_minutes` overrides `breakdown.repeat_window_minutes`.
    pub fn repeat_report(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        window_minutes: Option<i64>,
    ) -> Result<RepeatReport, QueryError> {
        let incidents = self.store.incidents(&window(start, end)?)?;
        let minutes = window_minutes.unwrap_or(self.breakdown.repeat_window_minutes);
        if minutes <= 0 {
            return Err(QueryError::InvalidRepeatWindow(minutes));
        }
        Ok(find_repeats(&incidents, minutes, self.breakdown.top_problems))
    }

    pub fn task_history(&self, task_id: i64) -> Result<TaskHistory, QueryError> {
        let task = self
            .store
            .task(task_id)?
            .ok_or_else(|| StoreError::NotFound(format!("task {task_id}")))?;
        let summaries = self.store.summaries(task_id)?;
        let evaluations = self.store.evaluations(task_id)?;
        Ok(TaskHistory {
            measurements: self.store.measurements(task_id)?,
            extensions: self.store.extensions(task_id)?,
            notifications: self.store.notifications(task_id)?,
            latest_summary: summaries.last().cloned(),
            latest_evaluation: evaluations.last().cloned(),
            task,
            summaries,
            evaluations,
        })
    }
}

/// Incident filter for the inclusive date range `start..=end`.
fn window(start: NaiveDate, end: NaiveDate) -> Result<IncidentFilter, QueryError> {
    if start > end {
        return Err(QueryError::InvalidWindow { start, end });
    }
    let from = Utc.from_utc_datetime(&start.and_time(NaiveTime::MIN));
    let to = Utc.from_utc_datetime(&(end + Duration::days(1)).and_time(NaiveTime::MIN));
    Ok(IncidentFilter::between(from, to))
}
