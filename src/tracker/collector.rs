//! Daily and weekly measurement collection from closed incidents.

use std::sync::Arc;

use chrono::{Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use tracing::{debug, info};

use crate::analysis::stats::{aggregate, percentage_change};
use crate::model::{EntityKind, IncidentFilter, IncidentRecord, IssueType, Measurement, Task};
use crate::storage::Store;
use crate::workflow::TaskError;

#[derive(Debug, Clone, PartialEq)]
pub enum CollectOutcome {
    Recorded(Measurement),
    /// Outside the window, or the last measurement is too recent.
    NotDue,
    /// No closed incidents in the collection window.
    NoIncidents,
}

pub struct MeasurementCollector {
    store: Arc<dyn Store>,
}

impl MeasurementCollector {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// A measurement is due when the task is being monitored on `today` and
    /// at least one cadence has passed since the last measurement.
    pub fn is_due(task: &Task, last: Option<&Measurement>, today: NaiveDate) -> bool {
        if !task.status.is_active() || today < task.start_date || today > task.monitor_end_date {
            return false;
        }
        match last {
            Some(m) => m.measurement_date + Duration::days(task.frequency.cadence_days()) <= today,
            None => true,
        }
    }

    /// Record one measurement dated `today`, covering the cadence window
    /// that ends at the start of `today`.
    pub fn collect(&self, task: &Task, today: NaiveDate) -> Result<CollectOutcome, TaskError> {
        let history = self.store.measurements(task.id)?;
        if !Self::is_due(task, history.last(), today) {
            debug!(task_id = task.id, "measurement not due");
            return Ok(CollectOutcome::NotDue);
        }

        let cadence = task.frequency.cadence_days();
        let until = Utc.from_utc_datetime(&today.and_time(NaiveTime::MIN));
        let from = until - Duration::days(cadence);
        let incidents = self.store.incidents(&incident_filter(task, from, until))?;
        if incidents.is_empty() {
            info!(task_id = task.id, from = %from, until = %until, "no closed incidents in window, skipping");
            return Ok(CollectOutcome::NoIncidents);
        }

        let value = metric_value(task.issue_type, &incidents)?;
        let change_pct = history
            .first()
            .and_then(|first| percentage_change(first.value, value));
        let is_improved = change_pct
            .map(|c| task.issue_type.improvement(c) > 0.0)
            .unwrap_or(false);

        let mut measurement = Measurement {
            id: 0,
            task_id: task.id,
            measurement_date: today,
            value,
            sample_count: incidents.len() as u32,
            change_pct,
            is_improved,
            notes: Some(format!(
                "{} closed incident(s) between {} and {}",
                incidents.len(),
                from.date_naive(),
                (until - Duration::days(1)).date_naive()
            )),
            created_at: Utc::now(),
        };
        measurement.id = self.store.upsert_measurement(&measurement)?;
        info!(
            task_id = task.id,
            value = measurement.value,
            samples = measurement.sample_count,
            change_pct = ?measurement.change_pct,
            "measurement recorded"
        );
        Ok(CollectOutcome::Recorded(measurement))
    }
}

fn incident_filter(task: &Task, from: chrono::DateTime<Utc>, until: chrono::DateTime<Utc>) -> IncidentFilter {
    let mut filter = IncidentFilter::between(from, until).with_status("closed");
    match task.entity_kind {
        EntityKind::Mechanic => filter.mechanic_id = Some(task.entity_id.clone()),
        EntityKind::Machine => filter.machine_number = Some(task.entity_id.clone()),
        EntityKind::Line => filter.line = Some(task.entity_id.clone()),
        EntityKind::Overall => {}
    }
    filter.machine_type = task.machine_type.clone();
    filter.reason = task.reason.clone();
    filter
}

/// Mean minutes for time metrics, a plain count otherwise.
fn metric_value(issue: IssueType, incidents: &[IncidentRecord]) -> Result<f64, TaskError> {
    let minutes: Vec<f64> = match issue {
        IssueType::ResponseTime => incidents.iter().map(|i| i.response_minutes()).collect(),
        IssueType::RepairTime => incidents.iter().map(|i| i.repair_minutes()).collect(),
        IssueType::Downtime => incidents.iter().map(|i| i.downtime_minutes()).collect(),
        IssueType::IncidentCount | IssueType::IncidentsHandled => return Ok(incidents.len() as f64),
    };
    Ok(aggregate(&minutes, 1)?.mean)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Frequency, TaskStatus};
    use crate::storage::SqliteStore;

    fn date(m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, m, d).unwrap()
    }

    fn incident(mechanic: &str, day: NaiveDate, hour: u32, repair_min: i64, machine_type: &str) -> IncidentRecord {
        let ts = Utc.from_utc_datetime(&day.and_hms_opt(hour, 0, 0).unwrap());
        IncidentRecord {
            id: 0,
            created_at: ts,
            resolved_at: Some(ts + Duration::minutes(repair_min)),
            updated_at: ts,
            downtime_ms: (repair_min + 5) * 60_000,
            repair_ms: repair_min * 60_000,
            response_ms: 5 * 60_000,
            machine_number: "SW-01".into(),
            machine_type: machine_type.into(),
            mechanic_id: mechanic.into(),
            mechanic_name: "Dana Ortiz".into(),
            supervisor_id: None,
            reason: "Thread break".into(),
            status: "Closed".into(),
            line: "L1".into(),
            product: None,
        }
    }

    fn setup(frequency: Frequency) -> (Arc<SqliteStore>, MeasurementCollector, Task) {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let mut task = Task::new(
            "Repair time on sewing machines",
            EntityKind::Mechanic,
            "M-17",
            IssueType::RepairTime,
            frequency,
            date(3, 1),
            date(3, 31),
        )
        .with_machine_type("Sewing");
        task.id = store.insert_task(&task).unwrap();
        (store.clone(), MeasurementCollector::new(store), task)
    }

    #[test]
    fn test_daily_collection_averages_previous_day() {
        let (store, collector, task) = setup(Frequency::Daily);
        store.insert_incident(&incident("M-17", date(3, 4), 9, 30, "Sewing")).unwrap();
        store.insert_incident(&incident("M-17", date(3, 4), 14, 50, "Sewing")).unwrap();
        // Filtered out: other machine type, other mechanic, outside the day.
        store.insert_incident(&incident("M-17", date(3, 4), 10, 90, "Cutting")).unwrap();
        store.insert_incident(&incident("M-21", date(3, 4), 10, 90, "Sewing")).unwrap();
        store.insert_incident(&incident("M-17", date(3, 5), 8, 90, "Sewing")).unwrap();

        match collector.collect(&task, date(3, 5)).unwrap() {
            CollectOutcome::Recorded(m) => {
                assert_eq!(m.value, 40.0);
                assert_eq!(m.sample_count, 2);
                assert_eq!(m.change_pct, None);
            }
            other => panic!("expected a measurement, got {other:?}"),
        }

        // Same day again: not due.
        assert_eq!(collector.collect(&task, date(3, 5)).unwrap(), CollectOutcome::NotDue);

        // Next day: 90 min vs a 40 min baseline is a regression.
        match collector.collect(&task, date(3, 6)).unwrap() {
            CollectOutcome::Recorded(m) => {
                assert_eq!(m.change_pct, Some(125.0));
                assert!(!m.is_improved);
            }
            other => panic!("expected a measurement, got {other:?}"),
        }
    }

    #[test]
    fn test_no_incidents_is_skipped() {
        let (store, collector, task) = setup(Frequency::Weekly);
        assert_eq!(collector.collect(&task, date(3, 8)).unwrap(), CollectOutcome::NoIncidents);
        assert!(store.measurements(task.id).unwrap().is_empty());
    }

    #[test]
    fn test_due_rules() {
        let (_store, _collector, mut task) = setup(Frequency::Weekly);
        let last = Measurement {
            id: 1,
            task_id: task.id,
            measurement_date: date(3, 4),
            value: 10.0,
            sample_count: 1,
            change_pct: None,
            is_improved: false,
            notes: None,
            created_at: Utc::now(),
        };
        assert!(MeasurementCollector::is_due(&task, None, date(3, 1)));
        assert!(!MeasurementCollector::is_due(&task, None, date(2, 28)));
        assert!(!MeasurementCollector::is_due(&task, Some(&last), date(3, 10)));
        assert!(MeasurementCollector::is_due(&task, Some(&last), date(3, 11)));
        assert!(!MeasurementCollector::is_due(&task, None, date(4, 1)));

        task.status = TaskStatus::Closed;
        assert!(!MeasurementCollector::is_due(&task, None, date(3, 11)));
    }
}
