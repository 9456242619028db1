//! Time bucketing of incidents and per-bucket entity comparisons.
//!
//! For every pattern (entity kind, metric) and every bucket of the chosen
//! time dimension, each entity's bucket mean is compared against the team
//! mean for the same bucket. Plant-wide incident counts are compared
//! bucket against bucket.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use serde::Serialize;
use tracing::warn;

use super::stats::{aggregate, compare, compare_mean, Aggregate, Comparison};
use super::AnalysisError;
use crate::config::PatternConfig;
use crate::detect::{PatternType, TimeDimension};
use crate::model::{EntityKind, IncidentRecord};

/// Entity/metric pairs analyzed for every time dimension.
pub const PATTERN_SPECS: [(EntityKind, PatternType); 5] = [
    (EntityKind::Mechanic, PatternType::ResponseTime),
    (EntityKind::Mechanic, PatternType::RepairTime),
    (EntityKind::Machine, PatternType::RepairTime),
    (EntityKind::Line, PatternType::Volume),
    (EntityKind::Overall, PatternType::IncidentCount),
];

/// Sortable bucket key: `order` gives the natural order, `label` is stored.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Bucket {
    pub order: u32,
    pub label: String,
}

/// Bucket for `ts` in `dimension`, or `None` when excluded (outside work
/// hours, or not covered by any shift).
pub fn bucket_for(dimension: TimeDimension, ts: DateTime<Utc>, cfg: &PatternConfig) -> Option<Bucket> {
    match dimension {
        TimeDimension::DayOfWeek => {
            let day = ts.weekday();
            Some(Bucket {
                order: day.num_days_from_monday(),
                label: weekday_name(day).to_string(),
            })
        }
        TimeDimension::Hour => {
            let hour = ts.hour();
            if hour < cfg.work_hours_start || hour >= cfg.work_hours_end {
                return None;
            }
            Some(hour_bucket(hour))
        }
        TimeDimension::Shift => {
            let hour = ts.hour();
            cfg.shifts
                .iter()
                .enumerate()
                .find(|(_, s)| s.contains(hour))
                .map(|(i, s)| Bucket {
                    order: i as u32,
                    label: s.name.clone(),
                })
        }
    }
}

/// Every bucket of `dimension`, so empty buckets count as zero.
pub fn all_buckets(dimension: TimeDimension, cfg: &PatternConfig) -> Vec<Bucket> {
    match dimension {
        TimeDimension::DayOfWeek => [
            Weekday::Mon,
            Weekday::Tue,
            Weekday::Wed,
            Weekday::Thu,
            Weekday::Fri,
            Weekday::Sat,
            Weekday::Sun,
        ]
        .into_iter()
        .map(|d| Bucket {
            order: d.num_days_from_monday(),
            label: weekday_name(d).to_string(),
        })
        .collect(),
        TimeDimension::Hour => (cfg.work_hours_start..cfg.work_hours_end)
            .map(hour_bucket)
            .collect(),
        TimeDimension::Shift => cfg
            .shifts
            .iter()
            .enumerate()
            .map(|(i, s)| Bucket {
                order: i as u32,
                label: s.name.clone(),
            })
            .collect(),
    }
}

fn hour_bucket(hour: u32) -> Bucket {
    Bucket {
        order: hour,
        label: format!("{:02}:00-{:02}:00", hour, (hour + 1) % 24),
    }
}

fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}

/// One entity in one bucket against the team in the same bucket.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BucketComparison {
    pub entity_kind: EntityKind,
    pub entity_id: String,
    pub entity_name: String,
    pub pattern: PatternType,
    pub dimension: TimeDimension,
    pub bucket: Bucket,
    /// Entity figures inside the bucket (for counts: a single-value aggregate).
    pub entity: Aggregate,
    /// Team figures inside the bucket (for counts: across all buckets).
    pub team: Aggregate,
    /// Entity figures across all buckets.
    pub normal: Option<Aggregate>,
    pub comparison: Comparison,
    /// Incidents behind `entity`.
    pub incident_count: usize,
    /// Incidents in the whole analysis window.
    pub total_incidents: usize,
}

impl BucketComparison {
    pub fn variance_vs_normal(&self) -> Option<f64> {
        self.normal
            .and_then(|n| super::stats::percentage_change(n.mean, self.entity.mean))
    }
}

pub(crate) fn entity_key(kind: EntityKind, incident: &IncidentRecord) -> (String, String) {
    match kind {
        EntityKind::Mechanic => (incident.mechanic_id.clone(), incident.mechanic_name.clone()),
        EntityKind::Machine => (
            incident.machine_number.clone(),
            format!("{} {}", incident.machine_type, incident.machine_number),
        ),
        EntityKind::Line => (incident.line.clone(), incident.line.clone()),
        EntityKind::Overall => ("overall".to_string(), "Plant".to_string()),
    }
}

fn metric_value(pattern: PatternType, incident: &IncidentRecord) -> f64 {
    match pattern {
        PatternType::ResponseTime => incident.response_minutes(),
        PatternType::RepairTime => incident.repair_minutes(),
        PatternType::Volume => incident.downtime_minutes(),
        PatternType::IncidentCount => 1.0,
    }
}

/// Build every comparison for one pattern and dimension.
///
/// Buckets or entities with fewer than `min_bucket_incidents` samples are
/// left out. A computation failure for one entity is logged and that entity
/// is skipped.
pub fn compare_buckets(
    incidents: &[IncidentRecord],
    kind: EntityKind,
    pattern: PatternType,
    dimension: TimeDimension,
    cfg: &PatternConfig,
    min_bucket_incidents: usize,
) -> Vec<BucketComparison> {
    if pattern == PatternType::IncidentCount {
        return compare_bucket_counts(incidents, dimension, cfg);
    }

    // bucket -> entity id -> values
    let mut by_bucket: BTreeMap<Bucket, BTreeMap<String, Vec<f64>>> = BTreeMap::new();
    let mut by_entity: BTreeMap<String, (String, Vec<f64>)> = BTreeMap::new();

    for incident in incidents {
        let Some(bucket) = bucket_for(dimension, incident.created_at, cfg) else {
            continue;
        };
        let (id, name) = entity_key(kind, incident);
        if id.is_empty() {
            continue;
        }
        let value = metric_value(pattern, incident);
        by_bucket
            .entry(bucket)
            .or_default()
            .entry(id.clone())
            .or_default()
            .push(value);
        by_entity
            .entry(id)
            .or_insert_with(|| (name, Vec::new()))
            .1
            .push(value);
    }

    let mut out = Vec::new();
    for (bucket, entities) in by_bucket {
        let team_values: Vec<f64> = entities.values().flatten().copied().collect();
        let team = match aggregate(&team_values, min_bucket_incidents) {
            Ok(t) => t,
            Err(AnalysisError::InsufficientData { .. }) => continue,
            Err(e) => {
                warn!(pattern = %pattern, bucket = %bucket.label, error = %e, "team baseline failed, bucket skipped");
                continue;
            }
        };

        for (id, values) in entities {
            let entity = match aggregate(&values, min_bucket_incidents) {
                Ok(a) => a,
                Err(AnalysisError::InsufficientData { .. }) => continue,
                Err(e) => {
                    warn!(entity = %id, pattern = %pattern, error = %e, "entity aggregate failed, skipped");
                    continue;
                }
            };
            let (name, all_values) = match by_entity.get(&id) {
                Some((name, all)) => (name.clone(), all.as_slice()),
                None => continue,
            };
            let normal = aggregate(all_values, 1).ok();

            out.push(BucketComparison {
                entity_kind: kind,
                entity_id: id,
                entity_name: name,
                pattern,
                dimension,
                bucket: bucket.clone(),
                comparison: compare(&entity, &team),
                incident_count: entity.count,
                entity,
                team,
                normal,
                total_incidents: incidents.len(),
            });
        }
    }
    out
}

fn compare_bucket_counts(
    incidents: &[IncidentRecord],
    dimension: TimeDimension,
    cfg: &PatternConfig,
) -> Vec<BucketComparison> {
    let mut counts: BTreeMap<Bucket, usize> = all_buckets(dimension, cfg)
        .into_iter()
        .map(|b| (b, 0))
        .collect();
    let mut bucketed = 0usize;
    for incident in incidents {
        if let Some(bucket) = bucket_for(dimension, incident.created_at, cfg) {
            *counts.entry(bucket).or_default() += 1;
            bucketed += 1;
        }
    }
    if bucketed == 0 {
        return Vec::new();
    }

    let values: Vec<f64> = counts.values().map(|c| *c as f64).collect();
    let team = match aggregate(&values, 2) {
        Ok(t) => t,
        Err(_) => return Vec::new(),
    };

    counts
        .into_iter()
        .map(|(bucket, count)| {
            let entity = Aggregate {
                mean: count as f64,
                median: count as f64,
                count: 1,
                std_dev: 0.0,
            };
            BucketComparison {
                entity_kind: EntityKind::Overall,
                entity_id: "overall".to_string(),
                entity_name: "Plant".to_string(),
                pattern: PatternType::IncidentCount,
                dimension,
                bucket,
                comparison: compare_mean(count as f64, &team),
                entity,
                team,
                normal: None,
                incident_count: count,
                total_incidents: bucketed,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn incident(mechanic: &str, ts: DateTime<Utc>, response_min: i64, repair_min: i64) -> IncidentRecord {
        IncidentRecord {
            id: 0,
            created_at: ts,
            resolved_at: Some(ts),
            updated_at: ts,
            downtime_ms: (response_min + repair_min) * 60_000,
            repair_ms: repair_min * 60_000,
            response_ms: response_min * 60_000,
            machine_number: "SW-01".into(),
            machine_type: "Sewing".into(),
            mechanic_id: mechanic.into(),
            mechanic_name: format!("Mechanic {mechanic}"),
            supervisor_id: None,
            reason: "Thread break".into(),
            status: "Closed".into(),
            line: "L1".into(),
            product: None,
        }
    }

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        // 2024-01-01 is a Monday.
        Utc.with_ymd_and_hms(2024, 1, day, hour, 15, 0).unwrap()
    }

    #[test]
    fn test_bucket_labels() {
        let cfg = PatternConfig::default();
        let monday = bucket_for(TimeDimension::DayOfWeek, at(1, 9), &cfg).unwrap();
        assert_eq!(monday.label, "Monday");
        assert_eq!(monday.order, 0);

        let hour = bucket_for(TimeDimension::Hour, at(1, 9), &cfg).unwrap();
        assert_eq!(hour.label, "09:00-10:00");
        assert!(bucket_for(TimeDimension::Hour, at(1, 18), &cfg).is_none());
        assert!(bucket_for(TimeDimension::Hour, at(1, 6), &cfg).is_none());

        let shift = bucket_for(TimeDimension::Shift, at(1, 23), &cfg).unwrap();
        assert_eq!(shift.label, "night");
    }

    #[test]
    fn test_all_buckets_follow_config() {
        let cfg = PatternConfig::default();
        assert_eq!(all_buckets(TimeDimension::DayOfWeek, &cfg).len(), 7);
        assert_eq!(all_buckets(TimeDimension::Hour, &cfg).len(), 10);
        assert_eq!(all_buckets(TimeDimension::Shift, &cfg).len(), 3);
    }

    #[test]
    fn test_slow_mechanic_on_monday_is_compared_to_team() {
        let cfg = PatternConfig::default();
        let mut incidents = Vec::new();
        for day in [1, 8] {
            incidents.push(incident("A", at(day, 9), 20, 30));
            incidents.push(incident("A", at(day, 10), 22, 30));
            incidents.push(incident("B", at(day, 9), 8, 30));
            incidents.push(incident("B", at(day, 11), 10, 30));
        }

        let out = compare_buckets(
            &incidents,
            EntityKind::Mechanic,
            PatternType::ResponseTime,
            TimeDimension::DayOfWeek,
            &cfg,
            2,
        );
        assert_eq!(out.len(), 2);
        let a = out.iter().find(|c| c.entity_id == "A").unwrap();
        assert_eq!(a.bucket.label, "Monday");
        assert_eq!(a.incident_count, 4);
        assert!((a.entity.mean - 21.0).abs() < 1e-9);
        assert!((a.team.mean - 15.0).abs() < 1e-9);
        assert!((a.comparison.percent_diff.unwrap() - 40.0).abs() < 1e-9);
        assert_eq!(a.entity_name, "Mechanic A");
    }

    #[test]
    fn test_small_buckets_are_skipped() {
        let cfg = PatternConfig::default();
        let incidents = vec![incident("A", at(1, 9), 20, 30)];
        let out = compare_buckets(
            &incidents,
            EntityKind::Mechanic,
            PatternType::ResponseTime,
            TimeDimension::DayOfWeek,
            &cfg,
            2,
        );
        assert!(out.is_empty());
    }

    #[test]
    fn test_bucket_counts_include_empty_buckets() {
        let cfg = PatternConfig::default();
        let mut incidents = Vec::new();
        for hour in [9, 9, 9, 9, 9, 9, 10, 11] {
            incidents.push(incident("A", at(1, hour), 5, 5));
        }
        let out = compare_buckets(
            &incidents,
            EntityKind::Overall,
            PatternType::IncidentCount,
            TimeDimension::Hour,
            &cfg,
            2,
        );
        assert_eq!(out.len(), 10);
        let nine = out.iter().find(|c| c.bucket.label == "09:00-10:00").unwrap();
        assert_eq!(nine.incident_count, 6);
        assert_eq!(nine.total_incidents, 8);
        assert!((nine.team.mean - 0.8).abs() < 1e-9);
        assert!(nine.comparison.z_score.value().unwrap() > 2.0);
    }
}
