//! Smoke tests -- verify the binary runs and key subcommands exist.

use assert_cmd::Command;
use predicates::prelude::*;

fn cmd() -> Command {
    Command::cargo_bin("activitymonitor").unwrap()
}

#[test]
fn test_cli_help() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Desktop activity monitor"));
}

#[test]
fn test_cli_version() {
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("activitymonitor"));
}

#[test]
fn test_subcommands_exist() {
    for sub in [
        "serve",
        "query",
        "results",
        "timeline",
        "detailed",
        "summary",
        "report",
        "export",
        "stats",
        "compact",
        "check-backend",
    ] {
        cmd().args([sub, "--help"]).assert().success();
    }
}

#[test]
fn test_query_rejects_bad_date() {
    cmd()
        .args(["query", "--from", "last tuesday"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("YYYY-MM-DD"));
}

fn fresh_config(dir: &std::path::Path) -> (std::path::PathBuf, std::path::PathBuf) {
    let config = dir.join("activitymonitor.toml");
    let db = dir.join("activity.db");
    std::fs::write(
        &config,
        format!("[storage]\ndatabase_path = {:?}\n", db.display().to_string()),
    )
    .unwrap();
    (config, db)
}

#[test]
fn test_stats_on_fresh_database() {
    let dir = tempfile::tempdir().unwrap();
    let (config, db) = fresh_config(dir.path());

    cmd()
        .arg("--config")
        .arg(&config)
        .arg("stats")
        .assert()
        .success()
        .stdout(predicate::str::contains("Total events:     0"));
    assert!(db.exists());
}

#[test]
fn test_summary_on_fresh_database() {
    let dir = tempfile::tempdir().unwrap();
    let (config, _) = fresh_config(dir.path());

    cmd()
        .arg("--config")
        .arg(&config)
        .args(["summary", "--date", "2024-03-01"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Daily Summary: 2024-03-01"));
}

#[test]
fn test_report_writes_json_file() {
    let dir = tempfile::tempdir().unwrap();
    let (config, _) = fresh_config(dir.path());
    let out = dir.path().join("reports").join("r.json");

    cmd()
        .arg("--config")
        .arg(&config)
        .args(["report", "--from", "2024-03-01", "--to", "2024-03-02", "--output"])
        .arg(&out)
        .assert()
        .success()
        .stdout(predicate::str::contains("No activity events found"));

    let body = std::fs::read_to_string(&out).unwrap();
    assert!(body.contains("\"schema_version\""));
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["total_tracked_secs"], 0);
}

#[test]
fn test_report_rejects_unknown_format() {
    cmd()
        .args(["export", "--format", "xlsx"])
        .assert()
        .failure();
}

#[test]
fn test_missing_config_file_fails() {
    cmd()
        .args(["--config", "/nonexistent/activitymonitor.toml", "stats"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to read config file"));
}
