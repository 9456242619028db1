//! End-of-window decision table.
//!
//! Rows are checked top to bottom and the first match decides:
//!
//! | rule                   | condition                                                    | decision    |
//! |------------------------|--------------------------------------------------------------|-------------|
//! | `InsufficientData`     | summary has too few measurements                              | `review`    |
//! | `TargetMet`            | improvement >= target and trend significantly improving       | `close`     |
//! | `SignificantDecline`   | improvement < 0 and trend or second half significantly worse  | `intervene` |
//! | `PartialProgress`      | improvement >= partial floor and extensions left               | `extend`    |
//! | `ExtensionsExhausted`  | improvement >= partial floor and no extensions left            | `review`    |
//! | `Ambiguous`            | anything else                                                 | `review`    |

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::config::EvaluationConfig;
use crate::model::{ConfidenceLevel, Decision, Task, TaskEvaluation, TaskSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Rule {
    InsufficientData,
    TargetMet,
    SignificantDecline,
    PartialProgress,
    ExtensionsExhausted,
    Ambiguous,
}

impl Rule {
    pub fn decision(self) -> Decision {
        match self {
            Rule::TargetMet => Decision::Close,
            Rule::SignificantDecline => Decision::Intervene,
            Rule::PartialProgress => Decision::Extend,
            Rule::InsufficientData | Rule::ExtensionsExhausted | Rule::Ambiguous => Decision::Review,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verdict {
    pub rule: Rule,
    pub decision: Decision,
    pub confidence: f64,
    pub confidence_level: ConfidenceLevel,
    pub explanation: String,
    pub recommendation: String,
}

impl Verdict {
    pub fn into_evaluation(self, summary: &TaskSummary, now: DateTime<Utc>) -> TaskEvaluation {
        TaskEvaluation {
            id: 0,
            task_id: summary.task_id,
            summary_id: summary.id,
            decision: self.decision,
            confidence: self.confidence,
            confidence_level: self.confidence_level,
            explanation: self.explanation,
            recommendation: self.recommendation,
            improvement_pct: summary.improvement_pct,
            created_at: now,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Evaluator {
    cfg: EvaluationConfig,
}

impl Evaluator {
    pub fn new(cfg: &EvaluationConfig) -> Self {
        Self { cfg: cfg.clone() }
    }

    pub fn rule_for(&self, task: &Task, summary: &TaskSummary) -> Rule {
        if !summary.is_sufficient() {
            return Rule::InsufficientData;
        }
        let Some(improvement) = summary.improvement_pct else {
            return Rule::Ambiguous;
        };
        let issue = task.issue_type;

        if improvement >= self.cfg.target_improvement_pct && summary.trend_improving(issue) {
            Rule::TargetMet
        } else if improvement < 0.0
            && (summary.trend_deteriorating(issue) || summary.halves_deteriorating(issue))
        {
            Rule::SignificantDecline
        } else if improvement >= self.cfg.partial_improvement_pct {
            if task.extension_count < self.cfg.max_extensions {
                Rule::PartialProgress
            } else {
                Rule::ExtensionsExhausted
            }
        } else {
            Rule::Ambiguous
        }
    }

    pub fn evaluate(&self, task: &Task, summary: &TaskSummary) -> Verdict {
        let rule = self.rule_for(task, summary);
        let confidence = match rule {
            Rule::InsufficientData => 0.0,
            _ => confidence(summary),
        };
        Verdict {
            rule,
            decision: rule.decision(),
            confidence,
            confidence_level: ConfidenceLevel::from_confidence(confidence),
            explanation: self.explain(rule, task, summary),
            recommendation: self.recommend(rule, task),
        }
    }

    fn explain(&self, rule: Rule, task: &Task, summary: &TaskSummary) -> String {
        let metric = task.issue_type.as_str().replace('_', " ");
        let unit = task.issue_type.unit();
        let improvement = summary.improvement_pct.unwrap_or(0.0);
        let movement = match (summary.baseline_value, summary.latest_value) {
            (Some(b), Some(l)) => format!(" from {b:.1} to {l:.1} {unit}"),
            _ => String::new(),
        };
        let trend = summary
            .trend
            .map(|t| format!("; {}", t.describe()))
            .unwrap_or_default();
        let target = self.cfg.target_improvement_pct;

        match rule {
            Rule::InsufficientData => format!(
                "Cannot evaluate {metric} for {}: {}.",
                task.entity_name, summary.message
            ),
            Rule::TargetMet => format!(
                "{} improved {metric} by {improvement:.1}%{movement}, meeting the {target:.1}% target{trend}.",
                task.entity_name
            ),
            Rule::SignificantDecline => {
                let halves = summary
                    .halves
                    .filter(|_| summary.halves_deteriorating(task.issue_type))
                    .map(|h| {
                        format!(
                            "; second-half average {:.1} vs first-half {:.1} ({:.0}% confidence)",
                            h.second_mean, h.first_mean, h.confidence_pct
                        )
                    })
                    .unwrap_or_default();
                format!(
                    "{metric} for {} worsened by {:.1}%{movement}{trend}{halves}.",
                    task.entity_name,
                    improvement.abs()
                )
            }
            Rule::PartialProgress => {
                let gap = if improvement >= target {
                    "reached the target without a significant trend".to_string()
                } else {
                    format!("short of the {target:.1}% target")
                };
                format!(
                    "{} improved {metric} by {improvement:.1}%{movement}, {gap}{trend}. Extension {} of {}.",
                    task.entity_name,
                    task.extension_count + 1,
                    self.cfg.max_extensions
                )
            }
            Rule::ExtensionsExhausted => format!(
                "{} improved {metric} by {improvement:.1}%{movement} but is still below the {target:.1}% target after {} of {} extensions{trend}.",
                task.entity_name, task.extension_count, self.cfg.max_extensions
            ),
            Rule::Ambiguous => format!(
                "{metric} for {} changed by {:+.1}%{movement} with no significant trend in either direction{trend}.",
                task.entity_name,
                improvement
            ),
        }
    }

    fn recommend(&self, rule: Rule, task: &Task) -> String {
        match rule {
            Rule::InsufficientData => format!(
                "Confirm incidents for {} are being recorded and restart monitoring.",
                task.entity_name
            ),
            Rule::TargetMet => format!(
                "Close the task and recognise the improvement with {}.",
                task.entity_name
            ),
            Rule::SignificantDecline => {
                let scope = task
                    .machine_type
                    .as_deref()
                    .map(|m| format!("{m} machines"))
                    .unwrap_or_else(|| "the affected machines".to_string());
                format!(
                    "Meet with {} and their supervisor now; check training and parts availability for {scope}.",
                    task.entity_name
                )
            }
            Rule::PartialProgress => format!(
                "Continue monitoring until {} and share interim progress with {}.",
                task.monitor_end_date + Duration::days(self.cfg.cycle_days),
                task.entity_name
            ),
            Rule::ExtensionsExhausted => {
                "Review with the maintenance manager: set a new target or escalate.".to_string()
            }
            Rule::Ambiguous => {
                "Review the measurements manually before deciding on next steps.".to_string()
            }
        }
    }
}

/// `1 - min(p)` over the available significance tests, in `[0, 1]`.
fn confidence(summary: &TaskSummary) -> f64 {
    summary
        .trend
        .map(|t| t.p_value)
        .into_iter()
        .chain(summary.halves.map(|h| h.p_value))
        .filter(|p| p.is_finite())
        .fold(None, |acc: Option<f64>, p| Some(acc.map_or(p, |a| a.min(p))))
        .map(|p| (1.0 - p).clamp(0.0, 1.0))
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::stats::{Trend, TrendDirection, TrendStrength, TwoSampleTest};
    use crate::analysis::summary::summarize;
    use crate::config::AnalysisConfig;
    use crate::model::{EntityKind, Frequency, IssueType, Measurement, SummaryStatus};
    use chrono::NaiveDate;

    fn task(extension_count: u32) -> Task {
        let mut task = Task::new(
            "Repair time",
            EntityKind::Mechanic,
            "M-17",
            IssueType::RepairTime,
            Frequency::Daily,
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, 15).unwrap(),
        )
        .with_entity_name("Dana Ortiz");
        task.extension_count = extension_count;
        task
    }

    fn trend(slope: f64, p_value: f64) -> Trend {
        Trend {
            slope,
            intercept: 40.0,
            r_squared: 0.8,
            p_value,
            is_significant: p_value <= 0.05,
            direction: if slope < 0.0 {
                TrendDirection::Decreasing
            } else {
                TrendDirection::Increasing
            },
            strength: TrendStrength::Strong,
        }
    }

    fn summary(improvement: f64, trend: Option<Trend>, halves: Option<TwoSampleTest>) -> TaskSummary {
        TaskSummary {
            id: 5,
            task_id: 1,
            extension_number: 0,
            status: SummaryStatus::Summarized,
            measurement_count: 10,
            period_start: None,
            period_end: None,
            baseline_value: Some(40.0),
            latest_value: Some(40.0 * (1.0 - improvement / 100.0)),
            change_pct: Some(-improvement),
            improvement_pct: Some(improvement),
            trend,
            halves,
            moving_average: Vec::new(),
            period_changes: Vec::new(),
            is_final: true,
            message: "summarized".into(),
            created_at: Utc::now(),
        }
    }

    fn significant_halves(p_value: f64) -> TwoSampleTest {
        TwoSampleTest {
            first_mean: 30.0,
            second_mean: 40.0,
            t_statistic: Some(-3.0),
            p_value,
            is_significant: true,
            confidence_pct: (1.0 - p_value) * 100.0,
        }
    }

    #[test]
    fn test_target_met_with_improving_trend_closes() {
        let evaluator = Evaluator::new(&EvaluationConfig::default());
        let verdict = evaluator.evaluate(&task(0), &summary(20.0, Some(trend(-1.2, 0.001)), None));
        assert_eq!(verdict.rule, Rule::TargetMet);
        assert_eq!(verdict.decision, Decision::Close);
        assert!((verdict.confidence - 0.999).abs() < 1e-9);
        assert_eq!(verdict.confidence_level, ConfidenceLevel::High);
        assert!(verdict.explanation.contains("20.0%"));
    }

    #[test]
    fn test_target_without_significant_trend_extends() {
        let evaluator = Evaluator::new(&EvaluationConfig::default());
        let verdict = evaluator.evaluate(&task(0), &summary(20.0, Some(trend(-1.2, 0.2)), None));
        assert_eq!(verdict.decision, Decision::Extend);
        assert!(verdict.explanation.contains("without a significant trend"));
        assert!(verdict.recommendation.contains("2024-03-29"));
    }

    #[test]
    fn test_significant_worsening_intervenes() {
        let evaluator = Evaluator::new(&EvaluationConfig::default());
        let by_trend = evaluator.evaluate(&task(0), &summary(-20.0, Some(trend(1.5, 0.01)), None));
        assert_eq!(by_trend.decision, Decision::Intervene);

        let by_halves = evaluator.evaluate(
            &task(0),
            &summary(-20.0, Some(trend(1.5, 0.3)), Some(significant_halves(0.04))),
        );
        assert_eq!(by_halves.rule, Rule::SignificantDecline);
        assert!((by_halves.confidence - 0.96).abs() < 1e-9);
        assert!(by_halves.explanation.contains("second-half average 40.0"));
    }

    #[test]
    fn test_significantly_better_second_half_does_not_intervene() {
        // An early spike leaves the last value above the first, but the
        // second half is clearly faster than the first.
        let values = [10.0, 40.0, 40.0, 40.0, 15.0, 15.0, 15.0, 12.0];
        let start = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let measurements: Vec<Measurement> = values
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
            .collect();
        let s = summarize(&task(0), &measurements, &AnalysisConfig::default(), Utc::now()).unwrap();
        assert!(s.improvement_pct.unwrap() < 0.0);
        assert!(s.halves.unwrap().is_significant);
        assert!(!s.halves_deteriorating(IssueType::RepairTime));

        let verdict = Evaluator::new(&EvaluationConfig::default()).evaluate(&task(0), &s);
        assert_ne!(verdict.decision, Decision::Intervene);
        assert_eq!(verdict.rule, Rule::Ambiguous);
        assert!(!verdict.explanation.contains("second-half average"));
    }

    #[test]
    fn test_worse_without_significance_is_ambiguous() {
        let evaluator = Evaluator::new(&EvaluationConfig::default());
        let verdict = evaluator.evaluate(&task(0), &summary(-3.0, Some(trend(0.2, 0.6)), None));
        assert_eq!(verdict.rule, Rule::Ambiguous);
        assert_eq!(verdict.decision, Decision::Review);
        assert_eq!(verdict.confidence_level, ConfidenceLevel::Low);
    }

    #[test]
    fn test_extension_limit_escalates_to_review() {
        for max in [1u32, 3, 5] {
            let evaluator = Evaluator::new(&EvaluationConfig {
                max_extensions: max,
                ..EvaluationConfig::default()
            });
            let partial = summary(8.0, Some(trend(-0.3, 0.2)), None);
            assert_eq!(
                evaluator.evaluate(&task(max - 1), &partial).decision,
                Decision::Extend
            );
            let exhausted = evaluator.evaluate(&task(max), &partial);
            assert_eq!(exhausted.rule, Rule::ExtensionsExhausted);
            assert_eq!(exhausted.decision, Decision::Review);
        }
    }

    #[test]
    fn test_insufficient_data_reviews_with_zero_confidence() {
        let evaluator = Evaluator::new(&EvaluationConfig::default());
        let mut s = summary(0.0, None, None);
        s.status = SummaryStatus::InsufficientData;
        s.improvement_pct = None;
        s.message = "insufficient data: 1 measurement(s) collected, at least 2 needed".into();

        let verdict = evaluator.evaluate(&task(0), &s);
        assert_eq!(verdict.decision, Decision::Review);
        assert_eq!(verdict.confidence, 0.0);
        assert!(verdict.explanation.contains("at least 2 needed"));

        let record = verdict.into_evaluation(&s, Utc::now());
        assert_eq!(record.summary_id, 5);
        assert_eq!(record.task_id, 1);
    }
}
