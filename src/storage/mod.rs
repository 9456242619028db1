//! SQLite storage layer -- schema, typed store contract, retries.

pub mod retry;
pub mod schema;
pub mod sqlite;

pub use retry::RetryPolicy;
pub use sqlite::SqliteStore;

use chrono::{DateTime, NaiveDate, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::ErrorCode;
use thiserror::Error;

use crate::detect::{FindingFilter, TimeDimension, TimeSeriesFinding};
use crate::model::{
    AnalysisRun, IncidentFilter, IncidentRecord, Measurement, NotificationLog, RunSummary, Task,
    TaskEvaluation, TaskExtension, TaskStatus, TaskSummary,
};

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Connectivity problem; retried with backoff before surfacing.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("sqlite error: {0}")]
    Sqlite(rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// A write that would break a record invariant.
    #[error("invalid record: {0}")]
    Invalid(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::CannotOpen) => {
                StoreError::Unavailable(err.to_string())
            }
            _ => StoreError::Sqlite(err),
        }
    }
}

impl From<r2d2::Error> for StoreError {
    fn from(err: r2d2::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Final outcome written to a task by close/review/intervene.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    pub task_id: i64,
    pub status: TaskStatus,
    pub evaluated_at: DateTime<Utc>,
    pub notes: String,
    pub recommendation: String,
}

/// Everything an extension changes, applied in one transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtensionRequest {
    pub task_id: i64,
    /// Summary superseded by the extension; marked non-final.
    pub summary_id: i64,
    /// The task's `extension_count` the caller observed.
    pub expected_extension_count: u32,
    pub original_end_date: NaiveDate,
    pub new_end_date: NaiveDate,
    pub reason: String,
    pub evaluated_at: DateTime<Utc>,
    pub notes: String,
    pub recommendation: String,
}

/// Narrow read/write contract between the analytics core and persistence.
///
/// Writes are keyed by the natural uniqueness constraints of each record so
/// repeating a write is harmless.
pub trait Store: Send + Sync {
    // -- incidents --
    fn incidents(&self, filter: &IncidentFilter) -> StoreResult<Vec<IncidentRecord>>;
    fn insert_incident(&self, incident: &IncidentRecord) -> StoreResult<i64>;

    // -- tasks --
    fn insert_task(&self, task: &Task) -> StoreResult<i64>;
    fn task(&self, task_id: i64) -> StoreResult<Option<Task>>;
    /// Tasks in any of `statuses`, ordered by id. Empty means all tasks.
    fn tasks(&self, statuses: &[TaskStatus]) -> StoreResult<Vec<Task>>;
    fn apply_outcome(&self, outcome: &TaskOutcome) -> StoreResult<()>;
    fn extend_task(&self, request: &ExtensionRequest) -> StoreResult<TaskExtension>;
    fn extensions(&self, task_id: i64) -> StoreResult<Vec<TaskExtension>>;

    // -- measurements --
    /// Ordered by measurement date.
    fn measurements(&self, task_id: i64) -> StoreResult<Vec<Measurement>>;
    /// Inserts unless a measurement for the same task and date exists.
    /// Returns the id of the stored row.
    fn upsert_measurement(&self, measurement: &Measurement) -> StoreResult<i64>;

    // -- summaries and evaluations --
    fn summaries(&self, task_id: i64) -> StoreResult<Vec<TaskSummary>>;
    /// Insert or replace the summary for `(task_id, extension_number)`.
    fn upsert_summary(&self, summary: &TaskSummary) -> StoreResult<i64>;
    fn evaluations(&self, task_id: i64) -> StoreResult<Vec<TaskEvaluation>>;
    /// Rejects evaluations of non-final summaries; one evaluation per summary.
    fn insert_evaluation(&self, evaluation: &TaskEvaluation) -> StoreResult<i64>;

    // -- notifications --
    fn insert_notification(&self, log: &NotificationLog) -> StoreResult<i64>;
    fn notifications(&self, task_id: i64) -> StoreResult<Vec<NotificationLog>>;
    fn notification_exists(&self, evaluation_id: i64) -> StoreResult<bool>;

    // -- findings --
    /// Returns `false` when an identical finding already exists for the run.
    fn upsert_finding(&self, finding: &TimeSeriesFinding) -> StoreResult<bool>;
    fn findings(&self, filter: &FindingFilter) -> StoreResult<Vec<TimeSeriesFinding>>;

    // -- runs --
    fn last_analysis_run(&self, dimension: TimeDimension) -> StoreResult<Option<AnalysisRun>>;
    fn record_analysis_run(&self, run: &AnalysisRun) -> StoreResult<()>;
    fn record_workflow_run(&self, summary: &RunSummary) -> StoreResult<()>;
    fn workflow_runs(&self, limit: usize) -> StoreResult<Vec<RunSummary>>;
}

/// Open (or create) the SQLite database and return a migrated connection pool.
pub fn open_pool(path: &str) -> StoreResult<Pool> {
    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Single-connection in-memory pool, for tests and dry runs.
pub fn open_memory_pool() -> StoreResult<Pool> {
    let manager = SqliteConnectionManager::memory()
        .with_init(|c| c.execute_batch("PRAGMA foreign_keys = ON;"));
    let pool = R2D2Pool::builder()
        .max_size(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .build(manager)?;

    let conn = pool.get()?;
    schema::migrate(&conn)?;
    drop(conn);

    Ok(pool)
}
