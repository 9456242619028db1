//! End-to-end workflow scenarios against a file-backed database.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, NaiveDate, Utc};
use tempfile::TempDir;

use maintrack::config::TrackerConfig;
use maintrack::model::{
    DeliveryStatus, EntityKind, Frequency, IssueType, Measurement, RunMode, RunStatus, Task,
    TaskStatus,
};
use maintrack::notify::{LogNotifier, Notifier, NotifyError, RenderedMessage};
use maintrack::storage::{SqliteStore, Store};
use maintrack::workflow::Orchestrator;

fn date(m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, m, d).unwrap()
}

fn config(dir: &TempDir) -> TrackerConfig {
    let mut cfg = TrackerConfig::default();
    cfg.storage.db_path = dir.path().join("maintrack.db");
    cfg.storage.max_attempts = 1;
    cfg.notifications.manager_recipients = vec!["maint-manager@plant.test".into()];
    cfg
}

fn open(cfg: &TrackerConfig) -> Arc<SqliteStore> {
    Arc::new(SqliteStore::open(&cfg.storage).unwrap())
}

fn add_task(store: &SqliteStore, mechanic: &str, values: &[f64]) -> i64 {
    let task = Task::new(
        format!("Repair time for {mechanic}"),
        EntityKind::Mechanic,
        mechanic,
        IssueType::RepairTime,
        Frequency::Daily,
        date(3, 1),
        date(3, 14),
    )
    .with_assignee(format!("{}@plant.test", mechanic.to_lowercase()));
    let id = store.insert_task(&task).unwrap();
    for (i, value) in values.iter().enumerate() {
        store
            .upsert_measurement(&Measurement {
                id: 0,
                task_id: id,
                measurement_date: date(3, 1) + Duration::days(i as i64),
                value: *value,
                sample_count: 3,
                change_pct: None,
                is_improved: false,
                notes: None,
                created_at: Utc::now(),
            })
            .unwrap();
    }
    id
}

const IMPROVING: [f64; 8] = [40.0, 38.0, 36.5, 35.0, 33.0, 31.5, 30.0, 29.0];
const PARTIAL: [f64; 8] = [40.0, 44.0, 37.0, 41.0, 35.0, 39.0, 34.0, 36.0];

struct FailingNotifier;

#[async_trait]
impl Notifier for FailingNotifier {
    fn channel(&self) -> &str {
        "webhook"
    }

    async fn send(
        &self,
        _recipients: &[String],
        _message: &RenderedMessage,
        _task_id: Option<i64>,
    ) -> Result<(), NotifyError> {
        Err(NotifyError::Delivery("connection refused".into()))
    }
}

#[tokio::test]
async fn test_one_failing_task_does_not_stop_the_run() {
    let dir = TempDir::new().unwrap();
    let cfg = config(&dir);
    let store = open(&cfg);

    let ids: Vec<i64> = (1..=10)
        .map(|n| add_task(&store, &format!("M-{n:02}"), &IMPROVING))
        .collect();

    // A corrupt sample for the fourth task makes its summary computation fail.
    let conn = store.pool().get().unwrap();
    conn.execute(
        "INSERT INTO measurements (task_id, measurement_date, value, sample_count, is_improved, created_at)
         VALUES (?1, '2024-03-10', ?2, 1, 0, '2024-03-10T00:00:00Z')",
        rusqlite::params![ids[3], f64::INFINITY],
    )
    .unwrap();
    drop(conn);

    let orchestrator = Orchestrator::new(store.clone(), &cfg, Arc::new(LogNotifier));
    let summary = orchestrator.run(RunMode::Evaluation, date(3, 14)).await;

    assert_eq!(summary.processed, 10);
    assert_eq!(summary.succeeded, 9);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.status, RunStatus::CompletedWithErrors);
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].task_id, ids[3]);
    assert_eq!(summary.failures[0].stage, "evaluate");
    assert!(summary.failures[0].error.contains("non-finite"));

    let failed_task = store.task(ids[3]).unwrap().unwrap();
    assert_eq!(failed_task.status, TaskStatus::Open);
    for id in ids.iter().filter(|id| **id != ids[3]) {
        assert_eq!(store.task(*id).unwrap().unwrap().status, TaskStatus::Closed);
    }

    let runs = store.workflow_runs(10).unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].failed, 1);
}

#[tokio::test]
async fn test_three_extensions_then_review() {
    let dir = TempDir::new().unwrap();
    let cfg = config(&dir);
    let store = open(&cfg);
    let id = add_task(&store, "M-17", &PARTIAL);
    let orchestrator = Orchestrator::new(store.clone(), &cfg, Arc::new(LogNotifier));

    let mut run_date = date(3, 14);
    for expected in 1..=3u32 {
        let summary = orchestrator.run(RunMode::Evaluation, run_date).await;
        assert_eq!(summary.succeeded, 1, "extension run {expected}");

        let task = store.task(id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Extended);
        assert_eq!(task.extension_count, expected);
        assert_eq!(task.monitor_end_date, run_date + Duration::days(14));
        run_date = task.monitor_end_date;
    }

    let summary = orchestrator.run(RunMode::Evaluation, run_date).await;
    assert_eq!(summary.succeeded, 1);

    let task = store.task(id).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Review);
    assert_eq!(task.extension_count, 3);

    let extensions = store.extensions(id).unwrap();
    assert_eq!(extensions.len(), 3);
    for (i, ext) in extensions.iter().enumerate() {
        assert_eq!(ext.sequence, i as u32 + 1);
        assert!(ext.new_end_date > ext.original_end_date);
    }
    assert!(extensions
        .windows(2)
        .all(|w| w[1].original_end_date == w[0].new_end_date));

    let summaries = store.summaries(id).unwrap();
    assert_eq!(summaries.len(), 4);
    let finals: Vec<u32> = summaries
        .iter()
        .filter(|s| s.is_final)
        .map(|s| s.extension_number)
        .collect();
    assert_eq!(finals, vec![3]);

    let evaluations = store.evaluations(id).unwrap();
    assert_eq!(evaluations.len(), 4);
    assert!(evaluations[3].explanation.contains("3 of 3 extensions"));
    assert_eq!(store.notifications(id).unwrap().len(), 4);
}

#[tokio::test]
async fn test_rerun_on_same_day_is_noop() {
    let dir = TempDir::new().unwrap();
    let cfg = config(&dir);
    let store = open(&cfg);
    let id = add_task(&store, "M-17", &IMPROVING);
    let orchestrator = Orchestrator::new(store.clone(), &cfg, Arc::new(LogNotifier));

    let first = orchestrator.run(RunMode::Evaluation, date(3, 14)).await;
    assert_eq!(first.succeeded, 1);
    assert_eq!(store.task(id).unwrap().unwrap().status, TaskStatus::Closed);

    // Reopen the store as a fresh process would.
    drop(orchestrator);
    let store = open(&cfg);
    let orchestrator = Orchestrator::new(store.clone(), &cfg, Arc::new(LogNotifier));
    let second = orchestrator.run(RunMode::All, date(3, 14)).await;
    assert_eq!(second.processed, 0);
    assert_eq!(second.status, RunStatus::Completed);

    assert_eq!(store.evaluations(id).unwrap().len(), 1);
    assert_eq!(store.notifications(id).unwrap().len(), 1);
    assert!(store.extensions(id).unwrap().is_empty());
    assert_eq!(store.workflow_runs(10).unwrap().len(), 2);
}

#[tokio::test]
async fn test_delivery_failure_is_logged_not_fatal() {
    let dir = TempDir::new().unwrap();
    let cfg = config(&dir);
    let store = open(&cfg);
    let id = add_task(&store, "M-17", &IMPROVING);
    let orchestrator = Orchestrator::new(store.clone(), &cfg, Arc::new(FailingNotifier));

    let summary = orchestrator.run(RunMode::Evaluation, date(3, 14)).await;
    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(store.task(id).unwrap().unwrap().status, TaskStatus::Closed);

    let logs = store.notifications(id).unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, DeliveryStatus::Failed);
    assert_eq!(logs[0].channel, "webhook");
    assert!(logs[0]
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("connection refused"));
}
