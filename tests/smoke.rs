//! Smoke tests -- verify the binary runs and key subcommands are wired.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn maintrack(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("maintrack").unwrap();
    cmd.env_remove("MAINTRACK_CONFIG")
        .env("RUST_LOG", "warn")
        .arg("--db")
        .arg(dir.path().join("maintrack.db"));
    cmd
}

#[test]
fn test_cli_help() {
    Command::cargo_bin("maintrack")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains("Repair and maintenance"));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("maintrack")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicates::str::contains("maintrack"));
}

#[test]
fn test_subcommands_exist() {
    for args in [
        vec!["run", "--help"],
        vec!["analyze", "--help"],
        vec!["query", "metric", "--help"],
        vec!["query", "task", "--help"],
        vec!["query", "pareto", "--help"],
        vec!["query", "repeats", "--help"],
        vec!["import", "incidents", "--help"],
        vec!["daemon", "--help"],
    ] {
        Command::cargo_bin("maintrack")
            .unwrap()
            .args(&args)
            .assert()
            .success();
    }
}

#[test]
fn test_init_db_creates_database() {
    let dir = TempDir::new().unwrap();
    maintrack(&dir)
        .arg("init-db")
        .assert()
        .success()
        .stdout(predicates::str::contains("\"workflow_runs\": 0"));
    assert!(dir.path().join("maintrack.db").exists());
}

#[test]
fn test_run_on_empty_database() {
    let dir = TempDir::new().unwrap();
    maintrack(&dir)
        .args(["run", "--mode", "all", "--date", "2024-03-14"])
        .assert()
        .success()
        .stdout(predicates::str::contains("\"status\": \"completed\""))
        .stdout(predicates::str::contains("\"processed\": 0"));
}

#[test]
fn test_import_then_query_metric() {
    let dir = TempDir::new().unwrap();
    let incidents = dir.path().join("incidents.json");
    std::fs::write(
        &incidents,
        r#"[
          {"created_at": "2024-03-04T09:00:00Z", "resolved_at": "2024-03-04T09:30:00Z",
           "updated_at": "2024-03-04T09:30:00Z", "downtime_ms": 1800000, "repair_ms": 1500000,
           "response_ms": 300000, "machine_number": "SW-01", "machine_type": "Sewing",
           "mechanic_id": "M-17", "mechanic_name": "Dana Ortiz", "supervisor_id": null,
           "reason": "Thread break", "status": "closed", "line": "L1", "product": null},
          {"created_at": "2024-03-05T10:00:00Z", "resolved_at": "2024-03-05T10:45:00Z",
           "updated_at": "2024-03-05T10:45:00Z", "downtime_ms": 2700000, "repair_ms": 2400000,
           "response_ms": 300000, "machine_number": "SW-01", "machine_type": "Sewing",
           "mechanic_id": "M-17", "mechanic_name": "Dana Ortiz", "supervisor_id": null,
           "reason": "Thread break", "status": "closed", "line": "L1", "product": null}
        ]"#,
    )
    .unwrap();

    maintrack(&dir)
        .args(["import", "incidents"])
        .arg(&incidents)
        .assert()
        .success()
        .stdout(predicates::str::contains("\"imported\": 2"));

    maintrack(&dir)
        .args([
            "query",
            "metric",
            "--metric",
            "repair_time",
            "--start",
            "2024-03-01",
            "--end",
            "2024-03-31",
        ])
        .assert()
        .success()
        .stdout(predicates::str::contains("\"entity_id\": \"M-17\""))
        .stdout(predicates::str::contains("\"mean\": 32.5"));

    maintrack(&dir)
        .args([
            "query",
            "pareto",
            "--dimension",
            "reason",
            "--start",
            "2024-03-01",
            "--end",
            "2024-03-31",
        ])
        .assert()
        .success()
        .stdout(predicates::str::contains("\"category\": \"Thread break\""))
        .stdout(predicates::str::contains("\"is_contributor\": true"));

    maintrack(&dir)
        .args(["query", "repeats", "--start", "2024-03-01", "--end", "2024-03-31"])
        .assert()
        .success()
        .stdout(predicates::str::contains("No repeat failures found within 120 minutes"));
}

#[test]
fn test_unknown_task_fails() {
    let dir = TempDir::new().unwrap();
    maintrack(&dir)
        .args(["query", "task", "42"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_bad_mode_is_rejected() {
    Command::cargo_bin("maintrack")
        .unwrap()
        .args(["run", "--mode", "hourly"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown run mode 'hourly'"));
}

#[test]
fn test_config_load_warnings_reach_the_log() {
    let dir = TempDir::new().unwrap();
    let broken = dir.path().join("broken.toml");
    std::fs::write(&broken, "[evaluation]\ncycle_days = 0\n").unwrap();

    maintrack(&dir)
        .env("MAINTRACK_CONFIG", &broken)
        .arg("init-db")
        .assert()
        .success()
        .stderr(predicate::str::contains("could not be loaded"));
}

#[test]
fn test_configured_log_level_applies_after_load() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("maintrack.toml");
    std::fs::write(&config, "[logging]\nlevel = \"debug\"\n").unwrap();

    Command::cargo_bin("maintrack")
        .unwrap()
        .env_remove("MAINTRACK_CONFIG")
        .env_remove("RUST_LOG")
        .arg("--config")
        .arg(&config)
        .arg("--db")
        .arg(dir.path().join("maintrack.db"))
        .arg("init-db")
        .assert()
        .success()
        .stderr(predicate::str::contains("loaded tracker configuration"))
        .stderr(predicate::str::contains("DEBUG"));
}
