//! [`Store`] implementation over an r2d2 SQLite pool.

use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use super::retry::{with_retry, RetryPolicy};
use super::{
    open_memory_pool, open_pool, ExtensionRequest, Pool, Store, StoreError, StoreResult,
    TaskOutcome,
};
use crate::config::StorageConfig;
use crate::detect::{FindingFilter, TimeDimension, TimeSeriesFinding};
use crate::model::{
    AnalysisRun, IncidentFilter, IncidentRecord, Measurement, NotificationLog, ParseEnumError,
    RunStatus, RunSummary, Task, TaskEvaluation, TaskExtension, TaskStatus, TaskSummary,
};

const DATE_FMT: &str = "%Y-%m-%d";

const INCIDENT_COLUMNS: &str = "id, created_at, resolved_at, updated_at, downtime_ms, repair_ms, \
     response_ms, machine_number, machine_type, mechanic_id, mechanic_name, supervisor_id, reason, \
     status, line, product";

const TASK_COLUMNS: &str = "id, title, entity_kind, entity_id, entity_name, issue_type, \
     machine_type, reason, frequency, start_date, monitor_end_date, extension_count, status, \
     evaluated_at, evaluation_notes, recommendation, assigned_to, created_at";

const MEASUREMENT_COLUMNS: &str = "id, task_id, measurement_date, value, sample_count, change_pct, \
     is_improved, notes, created_at";

const EVALUATION_COLUMNS: &str = "id, task_id, summary_id, decision, confidence, confidence_level, \
     explanation, recommendation, improvement_pct, created_at";

const EXTENSION_COLUMNS: &str =
    "id, task_id, sequence, original_end_date, new_end_date, reason, created_at";

const NOTIFICATION_COLUMNS: &str = "id, task_id, evaluation_id, kind, recipients_json, subject, \
     body, channel, status, error, created_at";

const FINDING_COLUMNS: &str = "id, run_id, entity_kind, entity_id, entity_name, pattern_type, \
     time_dimension, time_value, severity, description, context_json, period_start, period_end, \
     created_at";

const ANALYSIS_RUN_COLUMNS: &str = "run_id, time_dimension, period_start, period_end, status, \
     forced, findings_count, started_at, finished_at";

/// SQLite-backed store. Every call takes a pooled connection and is retried
/// on connectivity errors.
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool,
    retry: RetryPolicy,
}

impl SqliteStore {
    pub fn new(pool: Pool, retry: RetryPolicy) -> Self {
        Self { pool, retry }
    }

    /// Open the database named in `cfg`, creating parent directories.
    pub fn open(cfg: &StorageConfig) -> StoreResult<Self> {
        if let Some(parent) = cfg.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Unavailable(format!("create {}: {e}", parent.display()))
                })?;
            }
        }
        let path = cfg.db_path.to_string_lossy();
        info!(db_path = %path, "opening database");
        let pool = open_pool(&path)?;
        Ok(Self::new(pool, RetryPolicy::from_config(cfg)))
    }

    pub fn in_memory() -> StoreResult<Self> {
        Ok(Self::new(open_memory_pool()?, RetryPolicy::immediate(1)))
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    fn run<T>(
        &self,
        op_name: &str,
        op: impl Fn(&mut Connection) -> StoreResult<T>,
    ) -> StoreResult<T> {
        with_retry(&self.retry, op_name, || {
            let mut conn = self.pool.get()?;
            op(&mut conn)
        })
    }
}

// ---------------------------------------------------------------------------
// Column helpers
// ---------------------------------------------------------------------------

fn fmt_date(date: NaiveDate) -> String {
    date.format(DATE_FMT).to_string()
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn conversion_err(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn parse_ts(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    match DateTime::parse_from_rfc3339(s) {
        Ok(ts) => Ok(ts.with_timezone(&Utc)),
        // Column defaults use SQLite's datetime('now') format.
        Err(e) => NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
            .map(|naive| naive.and_utc())
            .map_err(|_| conversion_err(idx, e)),
    }
}

fn get_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    parse_ts(idx, &s)
}

fn get_opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let s: Option<String> = row.get(idx)?;
    s.map(|s| parse_ts(idx, &s)).transpose()
}

fn get_date(row: &Row<'_>, idx: usize) -> rusqlite::Result<NaiveDate> {
    let s: String = row.get(idx)?;
    NaiveDate::parse_from_str(&s, DATE_FMT).map_err(|e| conversion_err(idx, e))
}

fn get_enum<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = ParseEnumError>,
{
    let s: String = row.get(idx)?;
    s.parse().map_err(|e| conversion_err(idx, e))
}

fn get_json<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    serde_json::from_str(&s).map_err(|e| conversion_err(idx, e))
}

fn collect<T>(rows: impl Iterator<Item = rusqlite::Result<T>>) -> StoreResult<Vec<T>> {
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Row mappers
// ---------------------------------------------------------------------------

fn incident_from_row(row: &Row<'_>) -> rusqlite::Result<IncidentRecord> {
    Ok(IncidentRecord {
        id: row.get(0)?,
        created_at: get_ts(row, 1)?,
        resolved_at: get_opt_ts(row, 2)?,
        updated_at: get_ts(row, 3)?,
        downtime_ms: row.get(4)?,
        repair_ms: row.get(5)?,
        response_ms: row.get(6)?,
        machine_number: row.get(7)?,
        machine_type: row.get(8)?,
        mechanic_id: row.get(9)?,
        mechanic_name: row.get(10)?,
        supervisor_id: row.get(11)?,
        reason: row.get(12)?,
        status: row.get(13)?,
        line: row.get(14)?,
        product: row.get(15)?,
    })
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        title: row.get(1)?,
        entity_kind: get_enum(row, 2)?,
        entity_id: row.get(3)?,
        entity_name: row.get(4)?,
        issue_type: get_enum(row, 5)?,
        machine_type: row.get(6)?,
        reason: row.get(7)?,
        frequency: get_enum(row, 8)?,
        start_date: get_date(row, 9)?,
        monitor_end_date: get_date(row, 10)?,
        extension_count: row.get(11)?,
        status: get_enum(row, 12)?,
        evaluated_at: get_opt_ts(row, 13)?,
        evaluation_notes: row.get(14)?,
        recommendation: row.get(15)?,
        assigned_to: row.get(16)?,
        created_at: get_ts(row, 17)?,
    })
}

fn measurement_from_row(row: &Row<'_>) -> rusqlite::Result<Measurement> {
    Ok(Measurement {
        id: row.get(0)?,
        task_id: row.get(1)?,
        measurement_date: get_date(row, 2)?,
        value: row.get(3)?,
        sample_count: row.get(4)?,
        change_pct: row.get(5)?,
        is_improved: row.get(6)?,
        notes: row.get(7)?,
        created_at: get_ts(row, 8)?,
    })
}

fn summary_from_row(row: &Row<'_>) -> rusqlite::Result<TaskSummary> {
    let mut summary: TaskSummary = get_json(row, 2)?;
    summary.id = row.get(0)?;
    summary.is_final = row.get(1)?;
    Ok(summary)
}

fn evaluation_from_row(row: &Row<'_>) -> rusqlite::Result<TaskEvaluation> {
    Ok(TaskEvaluation {
        id: row.get(0)?,
        task_id: row.get(1)?,
        summary_id: row.get(2)?,
        decision: get_enum(row, 3)?,
        confidence: row.get(4)?,
        confidence_level: get_enum(row, 5)?,
        explanation: row.get(6)?,
        recommendation: row.get(7)?,
        improvement_pct: row.get(8)?,
        created_at: get_ts(row, 9)?,
    })
}

fn extension_from_row(row: &Row<'_>) -> rusqlite::Result<TaskExtension> {
    Ok(TaskExtension {
        id: row.get(0)?,
        task_id: row.get(1)?,
        sequence: row.get(2)?,
        original_end_date: get_date(row, 3)?,
        new_end_date: get_date(row, 4)?,
        reason: row.get(5)?,
        created_at: get_ts(row, 6)?,
    })
}

fn notification_from_row(row: &Row<'_>) -> rusqlite::Result<NotificationLog> {
    Ok(NotificationLog {
        id: row.get(0)?,
        task_id: row.get(1)?,
        evaluation_id: row.get(2)?,
        kind: get_enum(row, 3)?,
        recipients: get_json(row, 4)?,
        subject: row.get(5)?,
        body: row.get(6)?,
        channel: row.get(7)?,
        status: get_enum(row, 8)?,
        error: row.get(9)?,
        created_at: get_ts(row, 10)?,
    })
}

fn finding_from_row(row: &Row<'_>) -> rusqlite::Result<TimeSeriesFinding> {
    Ok(TimeSeriesFinding {
        id: row.get(0)?,
        run_id: row.get(1)?,
        entity_kind: get_enum(row, 2)?,
        entity_id: row.get(3)?,
        entity_name: row.get(4)?,
        pattern: get_enum(row, 5)?,
        dimension: get_enum(row, 6)?,
        time_value: row.get(7)?,
        severity: get_enum(row, 8)?,
        description: row.get(9)?,
        context: get_json(row, 10)?,
        period_start: get_date(row, 11)?,
        period_end: get_date(row, 12)?,
        created_at: get_ts(row, 13)?,
    })
}

fn analysis_run_from_row(row: &Row<'_>) -> rusqlite::Result<AnalysisRun> {
    let findings_count: i64 = row.get(6)?;
    Ok(AnalysisRun {
        run_id: row.get(0)?,
        dimension: get_enum(row, 1)?,
        period_start: get_date(row, 2)?,
        period_end: get_date(row, 3)?,
        status: get_enum(row, 4)?,
        forced: row.get(5)?,
        findings_count: findings_count.max(0) as usize,
        started_at: get_ts(row, 7)?,
        finished_at: get_opt_ts(row, 8)?,
    })
}

/// Appends `AND <column> = ?n` (or a case-insensitive match) for a set filter.
fn push_eq(sql: &mut String, args: &mut Vec<Value>, column: &str, value: &Option<String>, nocase: bool) {
    if let Some(v) = value {
        args.push(Value::Text(v.clone()));
        if nocase {
            sql.push_str(&format!(" AND lower({column}) = lower(?{})", args.len()));
        } else {
            sql.push_str(&format!(" AND {column} = ?{}", args.len()));
        }
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

impl Store for SqliteStore {
    fn incidents(&self, filter: &IncidentFilter) -> StoreResult<Vec<IncidentRecord>> {
        self.run("incidents", |conn| {
            let mut sql = format!("SELECT {INCIDENT_COLUMNS} FROM incidents WHERE 1 = 1");
            let mut args: Vec<Value> = Vec::new();
            push_eq(&mut sql, &mut args, "mechanic_id", &filter.mechanic_id, false);
            push_eq(&mut sql, &mut args, "machine_number", &filter.machine_number, false);
            push_eq(&mut sql, &mut args, "machine_type", &filter.machine_type, true);
            push_eq(&mut sql, &mut args, "reason", &filter.reason, true);
            push_eq(&mut sql, &mut args, "line", &filter.line, false);
            push_eq(&mut sql, &mut args, "status", &filter.status, true);
            if let Some(from) = filter.from {
                args.push(Value::Text(fmt_ts(from)));
                sql.push_str(&format!(" AND created_at >= ?{}", args.len()));
            }
            if let Some(to) = filter.to {
                args.push(Value::Text(fmt_ts(to)));
                sql.push_str(&format!(" AND created_at < ?{}", args.len()));
            }
            sql.push_str(" ORDER BY created_at, id");

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(args.iter()), incident_from_row)?;
            collect(rows)
        })
    }

    fn insert_incident(&self, i: &IncidentRecord) -> StoreResult<i64> {
        self.run("insert_incident", |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO incidents ({INCIDENT_COLUMNS})
                     VALUES (NULLIF(?1, 0), ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
                ),
                params![
                    i.id,
                    fmt_ts(i.created_at),
                    i.resolved_at.map(fmt_ts),
                    fmt_ts(i.updated_at),
                    i.downtime_ms,
                    i.repair_ms,
                    i.response_ms,
                    i.machine_number,
                    i.machine_type,
                    i.mechanic_id,
                    i.mechanic_name,
                    i.supervisor_id,
                    i.reason,
                    i.status,
                    i.line,
                    i.product,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    fn insert_task(&self, t: &Task) -> StoreResult<i64> {
        if t.monitor_end_date < t.start_date {
            return Err(StoreError::Invalid(format!(
                "task '{}' ends before it starts",
                t.title
            )));
        }
        self.run("insert_task", |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO tasks ({TASK_COLUMNS})
                     VALUES (NULLIF(?1, 0), ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)"
                ),
                params![
                    t.id,
                    t.title,
                    t.entity_kind.as_str(),
                    t.entity_id,
                    t.entity_name,
                    t.issue_type.as_str(),
                    t.machine_type,
                    t.reason,
                    t.frequency.as_str(),
                    fmt_date(t.start_date),
                    fmt_date(t.monitor_end_date),
                    t.extension_count,
                    t.status.as_str(),
                    t.evaluated_at.map(fmt_ts),
                    t.evaluation_notes,
                    t.recommendation,
                    t.assigned_to,
                    fmt_ts(t.created_at),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    fn task(&self, task_id: i64) -> StoreResult<Option<Task>> {
        self.run("task", |conn| {
            let task = conn
                .query_row(
                    &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                    [task_id],
                    task_from_row,
                )
                .optional()?;
            Ok(task)
        })
    }

    fn tasks(&self, statuses: &[TaskStatus]) -> StoreResult<Vec<Task>> {
        self.run("tasks", |conn| {
            let mut sql = format!("SELECT {TASK_COLUMNS} FROM tasks");
            let args: Vec<Value> = statuses
                .iter()
                .map(|s| Value::Text(s.as_str().to_string()))
                .collect();
            if !args.is_empty() {
                let placeholders: Vec<String> = (1..=args.len()).map(|i| format!("?{i}")).collect();
                sql.push_str(&format!(" WHERE status IN ({})", placeholders.join(", ")));
            }
            sql.push_str(" ORDER BY id");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(args.iter()), task_from_row)?;
            collect(rows)
        })
    }

    fn apply_outcome(&self, outcome: &TaskOutcome) -> StoreResult<()> {
        if outcome.status.is_active() {
            return Err(StoreError::Invalid(format!(
                "outcome status '{}' would keep task {} active; use extend_task",
                outcome.status, outcome.task_id
            )));
        }
        self.run("apply_outcome", |conn| {
            let changed = conn.execute(
                "UPDATE tasks SET status = ?2, evaluated_at = ?3, evaluation_notes = ?4, recommendation = ?5
                 WHERE id = ?1",
                params![
                    outcome.task_id,
                    outcome.status.as_str(),
                    fmt_ts(outcome.evaluated_at),
                    outcome.notes,
                    outcome.recommendation,
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("task {}", outcome.task_id)));
            }
            Ok(())
        })
    }

    fn extend_task(&self, req: &ExtensionRequest) -> StoreResult<TaskExtension> {
        if req.new_end_date <= req.original_end_date {
            return Err(StoreError::Invalid(format!(
                "extension of task {} must move the end date forward ({} -> {})",
                req.task_id, req.original_end_date, req.new_end_date
            )));
        }
        self.run("extend_task", |conn| {
            let tx = conn.transaction()?;

            let current: Option<(u32, String)> = tx
                .query_row(
                    "SELECT extension_count, monitor_end_date FROM tasks WHERE id = ?1",
                    [req.task_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let Some((count, end_date)) = current else {
                return Err(StoreError::NotFound(format!("task {}", req.task_id)));
            };
            if count != req.expected_extension_count || end_date != fmt_date(req.original_end_date) {
                return Err(StoreError::Invalid(format!(
                    "task {} changed since it was read (extension_count {count}, end {end_date})",
                    req.task_id
                )));
            }

            let sequence = count + 1;
            tx.execute(
                "UPDATE tasks SET monitor_end_date = ?2, extension_count = ?3, status = ?4,
                        evaluated_at = ?5, evaluation_notes = ?6, recommendation = ?7
                 WHERE id = ?1",
                params![
                    req.task_id,
                    fmt_date(req.new_end_date),
                    sequence,
                    TaskStatus::Extended.as_str(),
                    fmt_ts(req.evaluated_at),
                    req.notes,
                    req.recommendation,
                ],
            )?;

            let created_at = Utc::now();
            tx.execute(
                "INSERT INTO task_extensions (task_id, sequence, original_end_date, new_end_date, reason, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    req.task_id,
                    sequence,
                    fmt_date(req.original_end_date),
                    fmt_date(req.new_end_date),
                    req.reason,
                    fmt_ts(created_at),
                ],
            )?;
            let id = tx.last_insert_rowid();

            tx.execute(
                "UPDATE task_summaries SET is_final = 0 WHERE id = ?1 AND task_id = ?2",
                params![req.summary_id, req.task_id],
            )?;

            tx.commit()?;
            debug!(task_id = req.task_id, sequence, "task extension committed");

            Ok(TaskExtension {
                id,
                task_id: req.task_id,
                sequence,
                original_end_date: req.original_end_date,
                new_end_date: req.new_end_date,
                reason: req.reason.clone(),
                created_at,
            })
        })
    }

    fn extensions(&self, task_id: i64) -> StoreResult<Vec<TaskExtension>> {
        self.run("extensions", |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {EXTENSION_COLUMNS} FROM task_extensions WHERE task_id = ?1 ORDER BY sequence"
            ))?;
            let rows = stmt.query_map([task_id], extension_from_row)?;
            collect(rows)
        })
    }

    fn measurements(&self, task_id: i64) -> StoreResult<Vec<Measurement>> {
        self.run("measurements", |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MEASUREMENT_COLUMNS} FROM measurements WHERE task_id = ?1
                 ORDER BY measurement_date"
            ))?;
            let rows = stmt.query_map([task_id], measurement_from_row)?;
            collect(rows)
        })
    }

    fn upsert_measurement(&self, m: &Measurement) -> StoreResult<i64> {
        if !m.value.is_finite() {
            return Err(StoreError::Invalid(format!(
                "measurement for task {} is not finite",
                m.task_id
            )));
        }
        self.run("upsert_measurement", |conn| {
            conn.execute(
                "INSERT INTO measurements (task_id, measurement_date, value, sample_count, change_pct,
                                           is_improved, notes, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT (task_id, measurement_date) DO NOTHING",
                params![
                    m.task_id,
                    fmt_date(m.measurement_date),
                    m.value,
                    m.sample_count,
                    m.change_pct,
                    m.is_improved,
                    m.notes,
                    fmt_ts(m.created_at),
                ],
            )?;
            let id = conn.query_row(
                "SELECT id FROM measurements WHERE task_id = ?1 AND measurement_date = ?2",
                params![m.task_id, fmt_date(m.measurement_date)],
                |row| row.get(0),
            )?;
            Ok(id)
        })
    }

    fn summaries(&self, task_id: i64) -> StoreResult<Vec<TaskSummary>> {
        self.run("summaries", |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, is_final, summary_json FROM task_summaries WHERE task_id = ?1
                 ORDER BY extension_number",
            )?;
            let rows = stmt.query_map([task_id], summary_from_row)?;
            collect(rows)
        })
    }

    fn upsert_summary(&self, s: &TaskSummary) -> StoreResult<i64> {
        let json = serde_json::to_string(s)?;
        self.run("upsert_summary", |conn| {
            let tx = conn.transaction()?;
            let evaluated: bool = tx.query_row(
                "SELECT EXISTS (
                    SELECT 1 FROM task_evaluations e
                    JOIN task_summaries s ON s.id = e.summary_id
                    WHERE s.task_id = ?1 AND s.extension_number = ?2)",
                params![s.task_id, s.extension_number],
                |row| row.get(0),
            )?;
            if evaluated {
                return Err(StoreError::Invalid(format!(
                    "summary for task {} generation {} is already evaluated",
                    s.task_id, s.extension_number
                )));
            }
            tx.execute(
                "INSERT INTO task_summaries (task_id, extension_number, status, improvement_pct,
                                             is_final, summary_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT (task_id, extension_number) DO UPDATE SET
                    status = excluded.status,
                    improvement_pct = excluded.improvement_pct,
                    is_final = excluded.is_final,
                    summary_json = excluded.summary_json,
                    created_at = excluded.created_at",
                params![
                    s.task_id,
                    s.extension_number,
                    s.status.as_str(),
                    s.improvement_pct,
                    s.is_final,
                    json,
                    fmt_ts(s.created_at),
                ],
            )?;
            let id = tx.query_row(
                "SELECT id FROM task_summaries WHERE task_id = ?1 AND extension_number = ?2",
                params![s.task_id, s.extension_number],
                |row| row.get(0),
            )?;
            tx.commit()?;
            Ok(id)
        })
    }

    fn evaluations(&self, task_id: i64) -> StoreResult<Vec<TaskEvaluation>> {
        self.run("evaluations", |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {EVALUATION_COLUMNS} FROM task_evaluations WHERE task_id = ?1 ORDER BY id"
            ))?;
            let rows = stmt.query_map([task_id], evaluation_from_row)?;
            collect(rows)
        })
    }

    fn insert_evaluation(&self, e: &TaskEvaluation) -> StoreResult<i64> {
        self.run("insert_evaluation", |conn| {
            let tx = conn.transaction()?;
            let is_final: Option<bool> = tx
                .query_row(
                    "SELECT is_final FROM task_summaries WHERE id = ?1 AND task_id = ?2",
                    params![e.summary_id, e.task_id],
                    |row| row.get(0),
                )
                .optional()?;
            match is_final {
                None => {
                    return Err(StoreError::NotFound(format!(
                        "summary {} for task {}",
                        e.summary_id, e.task_id
                    )))
                }
                Some(false) => {
                    return Err(StoreError::Invalid(format!(
                        "summary {} is not final",
                        e.summary_id
                    )))
                }
                Some(true) => {}
            }

            tx.execute(
                "INSERT INTO task_evaluations (task_id, summary_id, decision, confidence, confidence_level,
                                               explanation, recommendation, improvement_pct, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT (summary_id) DO NOTHING",
                params![
                    e.task_id,
                    e.summary_id,
                    e.decision.as_str(),
                    e.confidence,
                    e.confidence_level.as_str(),
                    e.explanation,
                    e.recommendation,
                    e.improvement_pct,
                    fmt_ts(e.created_at),
                ],
            )?;
            let id = tx.query_row(
                "SELECT id FROM task_evaluations WHERE summary_id = ?1",
                [e.summary_id],
                |row| row.get(0),
            )?;
            tx.commit()?;
            Ok(id)
        })
    }

    fn insert_notification(&self, log: &NotificationLog) -> StoreResult<i64> {
        let recipients = serde_json::to_string(&log.recipients)?;
        self.run("insert_notification", |conn| {
            conn.execute(
                "INSERT INTO notification_logs (task_id, evaluation_id, kind, recipients_json, subject,
                                                body, channel, status, error, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    log.task_id,
                    log.evaluation_id,
                    log.kind.as_str(),
                    recipients,
                    log.subject,
                    log.body,
                    log.channel,
                    log.status.as_str(),
                    log.error,
                    fmt_ts(log.created_at),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    fn notifications(&self, task_id: i64) -> StoreResult<Vec<NotificationLog>> {
        self.run("notifications", |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {NOTIFICATION_COLUMNS} FROM notification_logs WHERE task_id = ?1 ORDER BY id"
            ))?;
            let rows = stmt.query_map([task_id], notification_from_row)?;
            collect(rows)
        })
    }

    fn notification_exists(&self, evaluation_id: i64) -> StoreResult<bool> {
        self.run("notification_exists", |conn| {
            let exists = conn.query_row(
                "SELECT EXISTS (SELECT 1 FROM notification_logs WHERE evaluation_id = ?1)",
                [evaluation_id],
                |row| row.get(0),
            )?;
            Ok(exists)
        })
    }

    fn upsert_finding(&self, f: &TimeSeriesFinding) -> StoreResult<bool> {
        let context = serde_json::to_string(&f.context)?;
        self.run("upsert_finding", |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO time_series_results
                    (run_id, entity_kind, entity_id, entity_name, pattern_type, time_dimension, time_value,
                     severity, description, context_json, period_start, period_end, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    f.run_id,
                    f.entity_kind.as_str(),
                    f.entity_id,
                    f.entity_name,
                    f.pattern.as_str(),
                    f.dimension.as_str(),
                    f.time_value,
                    f.severity.as_str(),
                    f.description,
                    context,
                    fmt_date(f.period_start),
                    fmt_date(f.period_end),
                    fmt_ts(f.created_at),
                ],
            )?;
            Ok(inserted == 1)
        })
    }

    fn findings(&self, filter: &FindingFilter) -> StoreResult<Vec<TimeSeriesFinding>> {
        let rows = self.run("findings", |conn| {
            let mut sql = format!("SELECT {FINDING_COLUMNS} FROM time_series_results WHERE 1 = 1");
            let mut args: Vec<Value> = Vec::new();
            push_eq(&mut sql, &mut args, "run_id", &filter.run_id, false);
            push_eq(
                &mut sql,
                &mut args,
                "entity_kind",
                &filter.entity_kind.map(|k| k.as_str().to_string()),
                false,
            );
            push_eq(&mut sql, &mut args, "entity_id", &filter.entity_id, false);
            push_eq(
                &mut sql,
                &mut args,
                "pattern_type",
                &filter.pattern.map(|p| p.as_str().to_string()),
                false,
            );
            push_eq(
                &mut sql,
                &mut args,
                "time_dimension",
                &filter.dimension.map(|d| d.as_str().to_string()),
                false,
            );
            sql.push_str(" ORDER BY id");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(args.iter()), finding_from_row)?;
            collect(rows)
        })?;

        Ok(match filter.min_severity {
            Some(min) => rows.into_iter().filter(|f| f.severity >= min).collect(),
            None => rows,
        })
    }

    fn last_analysis_run(&self, dimension: TimeDimension) -> StoreResult<Option<AnalysisRun>> {
        self.run("last_analysis_run", |conn| {
            let run = conn
                .query_row(
                    &format!(
                        "SELECT {ANALYSIS_RUN_COLUMNS} FROM analysis_runs
                         WHERE time_dimension = ?1 AND status IN (?2, ?3)
                         ORDER BY started_at DESC LIMIT 1"
                    ),
                    params![
                        dimension.as_str(),
                        RunStatus::Completed.as_str(),
                        RunStatus::CompletedWithErrors.as_str(),
                    ],
                    analysis_run_from_row,
                )
                .optional()?;
            Ok(run)
        })
    }

    fn record_analysis_run(&self, run: &AnalysisRun) -> StoreResult<()> {
        self.run("record_analysis_run", |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO analysis_runs ({ANALYSIS_RUN_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                     ON CONFLICT (run_id, time_dimension) DO UPDATE SET
                        status = excluded.status,
                        forced = excluded.forced,
                        findings_count = excluded.findings_count,
                        finished_at = excluded.finished_at"
                ),
                params![
                    run.run_id,
                    run.dimension.as_str(),
                    fmt_date(run.period_start),
                    fmt_date(run.period_end),
                    run.status.as_str(),
                    run.forced,
                    run.findings_count as i64,
                    fmt_ts(run.started_at),
                    run.finished_at.map(fmt_ts),
                ],
            )?;
            Ok(())
        })
    }

    fn record_workflow_run(&self, summary: &RunSummary) -> StoreResult<()> {
        let json = serde_json::to_string(summary)?;
        self.run("record_workflow_run", |conn| {
            conn.execute(
                "INSERT INTO workflow_runs (run_id, mode, run_date, status, processed, succeeded, skipped,
                                            failed, summary_json, started_at, finished_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT (run_id) DO UPDATE SET
                    status = excluded.status,
                    processed = excluded.processed,
                    succeeded = excluded.succeeded,
                    skipped = excluded.skipped,
                    failed = excluded.failed,
                    summary_json = excluded.summary_json,
                    finished_at = excluded.finished_at",
                params![
                    summary.run_id,
                    summary.mode.as_str(),
                    fmt_date(summary.run_date),
                    summary.status.as_str(),
                    summary.processed as i64,
                    summary.succeeded as i64,
                    summary.skipped as i64,
                    summary.failed as i64,
                    json,
                    fmt_ts(summary.started_at),
                    summary.finished_at.map(fmt_ts),
                ],
            )?;
            Ok(())
        })
    }

    fn workflow_runs(&self, limit: usize) -> StoreResult<Vec<RunSummary>> {
        self.run("workflow_runs", |conn| {
            let mut stmt = conn.prepare(
                "SELECT summary_json FROM workflow_runs ORDER BY started_at DESC, rowid DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map([limit as i64], |row| get_json(row, 0))?;
            collect(rows)
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
