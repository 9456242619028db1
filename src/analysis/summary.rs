//! Turns a task's measurement series into a [`TaskSummary`].

use chrono::{DateTime, Utc};

use super::stats::{
    aggregate, halves_test, moving_average, percentage_change, period_changes, trend,
};
use super::{AnalysisError, AnalysisResult};
use crate::config::AnalysisConfig;
use crate::model::{Measurement, SummaryStatus, Task, TaskSummary};

/// Summarize `measurements` (ordered by date) for the task's current
/// extension generation.
///
/// Too few measurements is not an error: the summary comes back with
/// [`SummaryStatus::InsufficientData`] so it can still be stored. Non-finite
/// values are a [`AnalysisError::Computation`] error.
pub fn summarize(
    task: &Task,
    measurements: &[Measurement],
    cfg: &AnalysisConfig,
    now: DateTime<Utc>,
) -> AnalysisResult<TaskSummary> {
    let values: Vec<f64> = measurements.iter().map(|m| m.value).collect();
    let mut summary = TaskSummary {
        id: 0,
        task_id: task.id,
        extension_number: task.extension_count,
        status: SummaryStatus::Summarized,
        measurement_count: values.len(),
        period_start: measurements.first().map(|m| m.measurement_date),
        period_end: measurements.last().map(|m| m.measurement_date),
        baseline_value: values.first().copied(),
        latest_value: values.last().copied(),
        change_pct: None,
        improvement_pct: None,
        trend: None,
        halves: None,
        moving_average: Vec::new(),
        period_changes: Vec::new(),
        is_final: true,
        message: String::new(),
        created_at: now,
    };

    match aggregate(&values, cfg.min_samples) {
        Ok(_) => {}
        Err(AnalysisError::InsufficientData { needed, have }) => {
            summary.status = SummaryStatus::InsufficientData;
            summary.message = format!(
                "insufficient data: {have} measurement(s) collected, at least {needed} needed"
            );
            return Ok(summary);
        }
        Err(e) => return Err(e),
    }

    let (baseline, latest) = match (summary.baseline_value, summary.latest_value) {
        (Some(b), Some(l)) => (b, l),
        _ => {
            return Err(AnalysisError::Computation(
                "measurement series is empty".into(),
            ))
        }
    };
    summary.change_pct = percentage_change(baseline, latest);
    summary.improvement_pct = summary.change_pct.map(|c| task.issue_type.improvement(c));
    summary.trend = optional(trend(&values, cfg.trend_alpha))?;
    summary.halves = optional(halves_test(&values, cfg.halves_alpha))?;
    summary.moving_average = moving_average(&values, cfg.moving_average_window)?;
    summary.period_changes = period_changes(&values);

    let unit = task.issue_type.unit();
    let mut message = format!(
        "{} measurements; {} moved from {baseline:.1} to {latest:.1} {unit}",
        values.len(),
        task.issue_type.as_str().replace('_', " "),
    );
    if let Some(improvement) = summary.improvement_pct {
        message.push_str(&format!(" ({improvement:+.1}% improvement)"));
    }
    if let Some(t) = summary.trend {
        message.push_str(&format!("; {}", t.describe()));
    }
    summary.message = message;
    Ok(summary)
}

/// Treat "not enough points for this statistic" as absent.
fn optional<T>(result: AnalysisResult<T>) -> AnalysisResult<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(AnalysisError::InsufficientData { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::stats::TrendDirection;
    use crate::model::{EntityKind, Frequency, IssueType};
    use chrono::{Duration, NaiveDate};

    fn task(issue: IssueType) -> Task {
        let mut task = Task::new(
            "Repair time",
            EntityKind::Mechanic,
            "M-17",
            issue,
            Frequency::Daily,
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, 15).unwrap(),
        );
        task.id = 1;
        task
    }

    fn series(values: &[f64]) -> Vec<Measurement> {
        let start = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        values
            .iter()
            .enumerate()
            .map(|(i, v)| Measurement {
                id: i as i64 + 1,
                task_id: 1,
                measurement_date: start + Duration::days(i as i64),
                value: *v,
                sample_count: 3,
                change_pct: None,
                is_improved: false,
                notes: None,
                created_at: Utc::now(),
            })
            .collect()
    }

    #[test]
    fn test_declining_repair_time_is_improvement() {
        let values = [40.0, 38.5, 37.0, 35.0, 34.0, 32.5, 31.0, 30.0];
        let summary = summarize(
            &task(IssueType::RepairTime),
            &series(&values),
            &AnalysisConfig::default(),
            Utc::now(),
        )
        .unwrap();

        assert!(summary.is_sufficient());
        assert_eq!(summary.measurement_count, 8);
        assert_eq!(summary.change_pct, Some(-25.0));
        assert_eq!(summary.improvement_pct, Some(25.0));
        let trend = summary.trend.unwrap();
        assert_eq!(trend.direction, TrendDirection::Decreasing);
        assert!(trend.is_significant);
        assert!(summary.trend_improving(IssueType::RepairTime));
        assert!(summary.halves.unwrap().is_significant);
        assert!(!summary.halves_deteriorating(IssueType::RepairTime));
        assert_eq!(summary.moving_average.len(), 8);
        assert_eq!(summary.moving_average[0], None);
        assert_eq!(summary.period_changes.len(), 7);
        assert!(summary.message.contains("+25.0% improvement"));
    }

    #[test]
    fn test_rising_handled_count_is_improvement() {
        let summary = summarize(
            &task(IssueType::IncidentsHandled),
            &series(&[10.0, 12.0, 15.0]),
            &AnalysisConfig::default(),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(summary.improvement_pct, Some(50.0));
        // Three points: no halves test.
        assert!(summary.halves.is_none());
        assert!(summary.trend.is_some());
    }

    #[test]
    fn test_too_few_measurements_marks_insufficient() {
        let cfg = AnalysisConfig {
            min_samples: 3,
            ..AnalysisConfig::default()
        };
        let summary = summarize(&task(IssueType::RepairTime), &series(&[40.0, 35.0]), &cfg, Utc::now())
            .unwrap();
        assert_eq!(summary.status, SummaryStatus::InsufficientData);
        assert!(summary.trend.is_none());
        assert!(summary.improvement_pct.is_none());
        assert!(summary.message.contains("at least 3"));

        let at_minimum =
            summarize(&task(IssueType::RepairTime), &series(&[40.0, 35.0, 33.0]), &cfg, Utc::now())
                .unwrap();
        assert!(at_minimum.is_sufficient());
    }

    #[test]
    fn test_non_finite_measurement_is_computation_error() {
        let err = summarize(
            &task(IssueType::RepairTime),
            &series(&[40.0, f64::INFINITY, 30.0]),
            &AnalysisConfig::default(),
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, AnalysisError::Computation(_)));
    }

    #[test]
    fn test_summary_tracks_extension_generation() {
        let mut t = task(IssueType::ResponseTime);
        t.extension_count = 2;
        let summary =
            summarize(&t, &series(&[9.0, 8.0, 8.5]), &AnalysisConfig::default(), Utc::now()).unwrap();
        assert_eq!(summary.extension_number, 2);
        assert!(summary.is_final);
    }
}
