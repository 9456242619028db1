//! Threshold classification of bucket comparisons into findings.

use chrono::{NaiveDate, Utc};
use tracing::debug;

use super::{FindingContext, PatternType, Severity, TimeSeriesFinding};
use crate::analysis::patterns::BucketComparison;
use crate::analysis::stats::Comparison;
use crate::config::{ClassifierConfig, SeverityRule};

/// Identity shared by every finding of one analysis run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunContext {
    pub run_id: String,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
}

/// Applies the ordered severity rules. First matching rule wins; a deviation
/// that clears only the floor gets the floor severity.
#[derive(Debug, Clone)]
pub struct Classifier {
    rules: Vec<SeverityRule>,
    floor_percent_diff: f64,
    floor_severity: Severity,
    worse_only: bool,
}

impl Classifier {
    pub fn new(cfg: &ClassifierConfig) -> Self {
        Self {
            rules: cfg.rules.clone(),
            floor_percent_diff: cfg.floor_percent_diff,
            floor_severity: cfg.floor_severity,
            worse_only: cfg.worse_only,
        }
    }

    pub fn severity_for(&self, comparison: &Comparison) -> Option<Severity> {
        let diff = comparison.percent_diff?;
        if self.worse_only && diff <= 0.0 {
            return None;
        }
        let magnitude = diff.abs();
        if magnitude < self.floor_percent_diff {
            return None;
        }
        let severity = self
            .rules
            .iter()
            .find(|rule| magnitude >= rule.min_percent_diff && comparison.z_score.meets(rule.min_z_score))
            .map(|rule| rule.severity)
            .unwrap_or(self.floor_severity);
        Some(severity)
    }

    /// Zero or one finding for a comparison.
    pub fn classify(&self, bc: &BucketComparison, run: &RunContext) -> Option<TimeSeriesFinding> {
        let severity = self.severity_for(&bc.comparison)?;

        let mut context = FindingContext {
            flagged_avg: bc.entity.mean,
            normal_avg: bc.normal.map(|n| n.mean),
            team_avg: bc.team.mean,
            variance_vs_normal: bc.variance_vs_normal(),
            variance_vs_team: bc.comparison.percent_diff,
            z_score: Some(bc.comparison.z_score),
            incident_count: bc.incident_count,
            ..FindingContext::default()
        };
        if matches!(bc.pattern, PatternType::Volume | PatternType::IncidentCount) {
            context.flagged_incidents = Some(bc.incident_count);
            if bc.total_incidents > 0 {
                context.percentage_of_total =
                    Some(bc.incident_count as f64 / bc.total_incidents as f64 * 100.0);
            }
        }
        if bc.pattern == PatternType::IncidentCount {
            context.average_incidents = Some(bc.team.mean);
        }

        let mut finding = TimeSeriesFinding {
            id: 0,
            run_id: run.run_id.clone(),
            entity_kind: bc.entity_kind,
            entity_id: bc.entity_id.clone(),
            entity_name: bc.entity_name.clone(),
            pattern: bc.pattern,
            dimension: bc.dimension,
            time_value: bc.bucket.label.clone(),
            severity,
            description: String::new(),
            context,
            period_start: run.period_start,
            period_end: run.period_end,
            created_at: Utc::now(),
        };
        finding.description = finding.explain();
        debug!(
            entity = %finding.entity_id,
            pattern = %finding.pattern,
            bucket = %finding.time_value,
            severity = %finding.severity,
            "pattern flagged"
        );
        Some(finding)
    }

    pub fn classify_all<'a>(
        &self,
        comparisons: impl IntoIterator<Item = &'a BucketComparison>,
        run: &RunContext,
    ) -> Vec<TimeSeriesFinding> {
        comparisons
            .into_iter()
            .filter_map(|bc| self.classify(bc, run))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::patterns::Bucket;
    use crate::analysis::stats::{compare, Aggregate, ZScore};
    use crate::detect::TimeDimension;
    use crate::model::EntityKind;
    use crate::storage::{SqliteStore, Store};

    fn agg(mean: f64, std_dev: f64, count: usize) -> Aggregate {
        Aggregate {
            mean,
            median: mean,
            count,
            std_dev,
        }
    }

    fn comparison(entity_mean: f64, team_mean: f64, team_sd: f64) -> BucketComparison {
        let entity = agg(entity_mean, 1.0, 6);
        let team = agg(team_mean, team_sd, 30);
        BucketComparison {
            entity_kind: EntityKind::Mechanic,
            entity_id: "M-17".into(),
            entity_name: "Dana Ortiz".into(),
            pattern: PatternType::ResponseTime,
            dimension: TimeDimension::DayOfWeek,
            bucket: Bucket {
                order: 0,
                label: "Monday".into(),
            },
            comparison: compare(&entity, &team),
            entity,
            team,
            normal: Some(agg(9.0, 1.5, 20)),
            incident_count: 6,
            total_incidents: 80,
        }
    }

    fn run() -> RunContext {
        RunContext {
            run_id: "run-1".into(),
            period_start: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            period_end: NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
        }
    }

    #[test]
    fn test_slow_monday_is_medium_under_defaults() {
        let classifier = Classifier::new(&ClassifierConfig::default());
        let bc = comparison(12.5, 8.8, 2.0);
        match bc.comparison.z_score {
            ZScore::Defined(z) => assert!((z - 1.85).abs() < 1e-9),
            ZScore::Undefined => panic!("z-score should be defined"),
        }
        let diff = bc.comparison.percent_diff.unwrap();
        assert!((diff - 42.045).abs() < 0.01);

        let finding = classifier.classify(&bc, &run()).unwrap();
        assert_eq!(finding.severity, Severity::Medium);
        assert_eq!(finding.time_value, "Monday");
        assert_eq!(finding.context.team_avg, 8.8);
        assert!(finding.description.contains("12.5 min"));
    }

    #[test]
    fn test_thresholds_are_configurable() {
        let bc = comparison(12.5, 8.8, 2.0);

        let mut relaxed = ClassifierConfig::default();
        relaxed.rules[0].min_z_score = 1.8;
        assert_eq!(
            Classifier::new(&relaxed).severity_for(&bc.comparison),
            Some(Severity::High)
        );

        let mut strict = ClassifierConfig::default();
        strict.rules[0].min_percent_diff = 60.0;
        strict.rules[1].min_percent_diff = 45.0;
        assert_eq!(
            Classifier::new(&strict).severity_for(&bc.comparison),
            Some(Severity::Low)
        );

        let mut high_floor = ClassifierConfig::default();
        high_floor.floor_percent_diff = 50.0;
        high_floor.rules.clear();
        assert_eq!(Classifier::new(&high_floor).severity_for(&bc.comparison), None);
    }

    #[test]
    fn test_undefined_z_score_falls_to_floor() {
        let classifier = Classifier::new(&ClassifierConfig::default());
        let bc = comparison(13.0, 10.0, 0.0);
        assert_eq!(bc.comparison.z_score, ZScore::Undefined);
        assert_eq!(classifier.severity_for(&bc.comparison), Some(Severity::Low));
    }

    #[test]
    fn test_below_floor_and_better_than_team_not_flagged() {
        let classifier = Classifier::new(&ClassifierConfig::default());
        assert!(classifier.classify(&comparison(9.5, 8.8, 2.0), &run()).is_none());
        assert!(classifier.classify(&comparison(5.0, 8.8, 2.0), &run()).is_none());

        let both_ways = Classifier::new(&ClassifierConfig {
            worse_only: false,
            ..ClassifierConfig::default()
        });
        assert_eq!(
            both_ways.severity_for(&comparison(5.0, 8.8, 2.0).comparison),
            Some(Severity::Medium)
        );
    }

    #[test]
    fn test_count_patterns_carry_volume_figures() {
        let classifier = Classifier::new(&ClassifierConfig::default());
        let mut bc = comparison(14.0, 8.0, 3.0);
        bc.entity_kind = EntityKind::Overall;
        bc.pattern = PatternType::IncidentCount;
        bc.incident_count = 14;
        bc.total_incidents = 56;
        bc.normal = None;

        let finding = classifier.classify(&bc, &run()).unwrap();
        assert_eq!(finding.context.flagged_incidents, Some(14));
        assert_eq!(finding.context.average_incidents, Some(8.0));
        assert_eq!(finding.context.percentage_of_total, Some(25.0));
        assert!(finding.description.starts_with("Plant-wide"));
    }

    #[test]
    fn test_reclassifying_same_run_adds_no_rows() {
        let store = SqliteStore::in_memory().unwrap();
        let classifier = Classifier::new(&ClassifierConfig::default());
        let mut other = comparison(20.0, 8.8, 2.0);
        other.entity_id = "M-21".into();
        let inputs = vec![comparison(12.5, 8.8, 2.0), other];

        for pass in 0..2 {
            let inserted = classifier
                .classify_all(&inputs, &run())
                .iter()
                .filter(|f| store.upsert_finding(f).unwrap())
                .count();
            assert_eq!(inserted, if pass == 0 { 2 } else { 0 });
        }
        assert_eq!(store.findings(&Default::default()).unwrap().len(), 2);
    }
}
