//! Database schema and migrations.

use rusqlite::Connection;

/// Current schema version recorded in `schema_version`.
pub const SCHEMA_VERSION: i64 = 2;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS incidents (
            id INTEGER PRIMARY KEY,
            created_at TEXT NOT NULL,
            resolved_at TEXT,
            updated_at TEXT NOT NULL,
            downtime_ms INTEGER NOT NULL DEFAULT 0,
            repair_ms INTEGER NOT NULL DEFAULT 0,
            response_ms INTEGER NOT NULL DEFAULT 0,
            machine_number TEXT NOT NULL,
            machine_type TEXT NOT NULL,
            mechanic_id TEXT NOT NULL,
            mechanic_name TEXT NOT NULL,
            supervisor_id TEXT,
            reason TEXT NOT NULL,
            status TEXT NOT NULL,
            line TEXT NOT NULL,
            product TEXT
        );

        CREATE TABLE IF NOT EXISTS tasks (
            id INTEGER PRIMARY KEY,
            title TEXT NOT NULL,
            entity_kind TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            entity_name TEXT NOT NULL,
            issue_type TEXT NOT NULL,
            machine_type TEXT,
            reason TEXT,
            frequency TEXT NOT NULL,
            start_date TEXT NOT NULL,
            monitor_end_date TEXT NOT NULL,
            extension_count INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'open',
            evaluated_at TEXT,
            evaluation_notes TEXT,
            recommendation TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS measurements (
            id INTEGER PRIMARY KEY,
            task_id INTEGER NOT NULL REFERENCES tasks(id),
            measurement_date TEXT NOT NULL,
            value REAL NOT NULL,
            sample_count INTEGER NOT NULL DEFAULT 0,
            change_pct REAL,
            is_improved INTEGER NOT NULL DEFAULT 0,
            notes TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE (task_id, measurement_date)
        );

        CREATE TABLE IF NOT EXISTS task_summaries (
            id INTEGER PRIMARY KEY,
            task_id INTEGER NOT NULL REFERENCES tasks(id),
            extension_number INTEGER NOT NULL,
            status TEXT NOT NULL,
            improvement_pct REAL,
            is_final INTEGER NOT NULL DEFAULT 1,
            summary_json TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE (task_id, extension_number)
        );

        CREATE TABLE IF NOT EXISTS task_evaluations (
            id INTEGER PRIMARY KEY,
            task_id INTEGER NOT NULL REFERENCES tasks(id),
            summary_id INTEGER NOT NULL UNIQUE REFERENCES task_summaries(id),
            decision TEXT NOT NULL,
            confidence REAL NOT NULL CHECK (confidence >= 0.0 AND confidence <= 1.0),
            confidence_level TEXT NOT NULL,
            explanation TEXT NOT NULL,
            recommendation TEXT NOT NULL,
            improvement_pct REAL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS task_extensions (
            id INTEGER PRIMARY KEY,
            task_id INTEGER NOT NULL REFERENCES tasks(id),
            sequence INTEGER NOT NULL,
            original_end_date TEXT NOT NULL,
            new_end_date TEXT NOT NULL,
            reason TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE (task_id, sequence),
            CHECK (new_end_date > original_end_date)
        );

        CREATE TABLE IF NOT EXISTS notification_logs (
            id INTEGER PRIMARY KEY,
            task_id INTEGER,
            evaluation_id INTEGER,
            kind TEXT NOT NULL,
            recipients_json TEXT NOT NULL,
            subject TEXT NOT NULL,
            body TEXT NOT NULL,
            channel TEXT NOT NULL,
            status TEXT NOT NULL,
            error TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS time_series_results (
            id INTEGER PRIMARY KEY,
            run_id TEXT NOT NULL,
            entity_kind TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            entity_name TEXT NOT NULL,
            pattern_type TEXT NOT NULL,
            time_dimension TEXT NOT NULL,
            time_value TEXT NOT NULL,
            severity TEXT NOT NULL,
            description TEXT NOT NULL,
            context_json TEXT NOT NULL,
            period_start TEXT NOT NULL,
            period_end TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE (run_id, entity_kind, entity_id, pattern_type, time_dimension, time_value)
        );

        CREATE TABLE IF NOT EXISTS analysis_runs (
            run_id TEXT NOT NULL,
            time_dimension TEXT NOT NULL,
            period_start TEXT NOT NULL,
            period_end TEXT NOT NULL,
            status TEXT NOT NULL,
            forced INTEGER NOT NULL DEFAULT 0,
            findings_count INTEGER NOT NULL DEFAULT 0,
            started_at TEXT NOT NULL,
            finished_at TEXT,
            PRIMARY KEY (run_id, time_dimension)
        );

        CREATE TABLE IF NOT EXISTS workflow_runs (
            run_id TEXT PRIMARY KEY,
            mode TEXT NOT NULL,
            run_date TEXT NOT NULL,
            status TEXT NOT NULL,
            processed INTEGER NOT NULL,
            succeeded INTEGER NOT NULL,
            skipped INTEGER NOT NULL,
            failed INTEGER NOT NULL,
            summary_json TEXT NOT NULL,
            started_at TEXT NOT NULL,
            finished_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_incidents_created ON incidents(created_at);
        CREATE INDEX IF NOT EXISTS idx_incidents_mechanic ON incidents(mechanic_id, created_at);
        CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
        CREATE INDEX IF NOT EXISTS idx_notification_logs_task ON notification_logs(task_id);
        CREATE INDEX IF NOT EXISTS idx_time_series_run ON time_series_results(run_id);
        CREATE INDEX IF NOT EXISTS idx_analysis_runs_started ON analysis_runs(time_dimension, started_at);",
    )?;

    // Migration: Add 'assigned_to' to tasks if missing
    let has_assignee: i64 = conn.query_row(
        "SELECT count(*) FROM pragma_table_info('tasks') WHERE name='assigned_to'",
        [],
        |row| row.get(0),
    )?;
    if has_assignee == 0 {
        conn.execute("ALTER TABLE tasks ADD COLUMN assigned_to TEXT", [])?;
    }

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [SCHEMA_VERSION],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        for table in [
            "incidents",
            "tasks",
            "measurements",
            "task_summaries",
            "task_evaluations",
            "task_extensions",
            "notification_logs",
            "time_series_results",
            "analysis_runs",
            "workflow_runs",
        ] {
            let count: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
                .unwrap();
            assert_eq!(count, 0, "table {table} should start empty");
        }
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap(); // Should not error

        let versions: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(versions, 1);
    }

    #[test]
    fn test_extension_dates_must_increase() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        conn.execute(
            "INSERT INTO tasks (id, title, entity_kind, entity_id, entity_name, issue_type,
                                frequency, start_date, monitor_end_date)
             VALUES (1, 't', 'mechanic', 'M1', 'M1', 'repair_time', 'daily', '2024-01-01', '2024-01-15')",
            [],
        )
        .unwrap();

        let bad = conn.execute(
            "INSERT INTO task_extensions (task_id, sequence, original_end_date, new_end_date, reason)
             VALUES (1, 1, '2024-01-15', '2024-01-15', 'no-op')",
            [],
        );
        assert!(bad.is_err());

        conn.execute(
            "INSERT INTO task_extensions (task_id, sequence, original_end_date, new_end_date, reason)
             VALUES (1, 1, '2024-01-15', '2024-01-29', 'partial improvement')",
            [],
        )
        .unwrap();
    }
}
