use std::fs;
use std::path::Path;
use std::process::Command;

use assert_cmd::prelude::*;
use predicates::str::contains;
use serde_json::Value;
use tempfile::TempDir;

fn checkpoint(home: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_checkpoint"));
    cmd.env("HOME", home)
        .env("USERPROFILE", home)
        .env_remove("RUST_LOG");
    cmd
}

fn json_stdout(cmd: &mut Command) -> Value {
    let output = cmd.output().expect("run checkpoint");
    assert!(
        output.status.success(),
        "command failed: status={} stderr={}",
        output.status,
        String::from_utf8_lossy(&output.stderr),
    );
    serde_json::from_slice(&output.stdout).expect("stdout JSON")
}

#[test]
fn status_without_projects_suggests_init() {
    let home = TempDir::new().unwrap();
    checkpoint(home.path())
        .arg("status")
        .assert()
        .success()
        .stdout(contains("checkpoint init"));
}

#[test]
fn status_reports_last_backup_and_heartbeat() {
    let home = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();
    let root = work.path().join("web");
    fs::create_dir_all(&root).unwrap();
    fs::write(root.join("index.html"), "<html></html>").unwrap();
    fs::write(root.join("notes.md"), "todo").unwrap();

    checkpoint(home.path())
        .arg("init")
        .arg(&root)
        .arg("--backup-dir")
        .arg(work.path().join("backups"))
        .assert()
        .success();
    checkpoint(home.path()).args(["run", "web"]).assert().success();

    let json = json_stdout(checkpoint(home.path()).args(["status", "--json"]));
    let project = &json["projects"][0];
    assert_eq!(project["project"], "web");
    assert_eq!(project["root_exists"], true);
    assert_eq!(project["last_backup_files"], 2);
    assert!(project["running_pid"].is_null());

    let heartbeat = &json["heartbeat"];
    assert_eq!(heartbeat["status"], "healthy");
    assert_eq!(heartbeat["project"], "web");
    assert_eq!(heartbeat["last_backup_files"], 2);
    assert_eq!(heartbeat["stale"], false);
    assert!(json["watchdog"].is_null());
}

#[test]
fn watchdog_once_without_installed_daemons() {
    let home = TempDir::new().unwrap();
    let json = json_stdout(checkpoint(home.path()).args(["watchdog", "--once", "--json"]));

    assert_eq!(json["status"], "no_daemons");
    assert_eq!(json["daemon_count"], 0);
    assert!(home.path().join(".checkpoint/state/watchdog.json").is_file());

    let status = json_stdout(checkpoint(home.path()).args(["status", "--json"]));
    assert_eq!(status["watchdog"]["status"], "no_daemons");
}

#[test]
fn daemon_logs_tolerate_missing_files() {
    let home = TempDir::new().unwrap();
    checkpoint(home.path())
        .args(["daemon", "logs", "--stderr-only"])
        .assert()
        .success()
        .stdout(contains("log file not found"));
}

#[test]
fn daemon_start_without_projects_fails() {
    let home = TempDir::new().unwrap();
    checkpoint(home.path())
        .args(["daemon", "start"])
        .assert()
        .failure()
        .stderr(contains("no projects registered"));
}
