use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, SystemTime};

use assert_cmd::prelude::*;
use filetime::{set_file_mtime, FileTime};
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

struct Fixture {
    home: TempDir,
    work: TempDir,
}

impl Fixture {
    /// A registered project `api` with two fresh files.
    fn new() -> Self {
        let home = TempDir::new().expect("home");
        let work = TempDir::new().expect("work");
        let root = work.path().join("api");
        fs::create_dir_all(root.join("src")).unwrap();
        fs::write(root.join("src/main.rs"), "fn main() {}\n").unwrap();
        fs::write(root.join(".env"), "TOKEN=abc\n").unwrap();

        let fixture = Self { home, work };
        checkpoint(fixture.home.path())
            .arg("init")
            .arg(&root)
            .arg("--backup-dir")
            .arg(fixture.backup_dir())
            .assert()
            .success()
            .stdout(contains("Registered 'api'"));
        fixture
    }

    fn backup_dir(&self) -> PathBuf {
        self.work.path().join("backups")
    }

    fn run_json(&self) -> (i32, Value) {
        let output = checkpoint(self.home.path())
            .args(["run", "api", "--json"])
            .output()
            .expect("run checkpoint");
        let json = serde_json::from_slice(&output.stdout).unwrap_or_else(|e| {
            panic!(
                "invalid JSON ({e}); stderr: {}",
                String::from_utf8_lossy(&output.stderr)
            )
        });
        (output.status.code().expect("exit code"), json)
    }
}

fn age(path: &Path, days: u64) {
    let when = SystemTime::now() - Duration::from_secs(days * 24 * 60 * 60);
    set_file_mtime(path, FileTime::from_system_time(when)).unwrap();
}

#[test]
fn init_is_idempotent() {
    let fixture = Fixture::new();
    let root = fixture.work.path().join("api");
    checkpoint(fixture.home.path())
        .arg("init")
        .arg(&root)
        .assert()
        .success()
        .stdout(contains(fixture.backup_dir().display().to_string()));
}

#[test]
fn run_backs_up_changed_files_and_exits_zero() {
    let fixture = Fixture::new();
    let (code, json) = fixture.run_json();

    assert_eq!(code, 0);
    assert_eq!(json["status"], "success");
    assert_eq!(json["changes"], 2);
    assert_eq!(json["failed"], 0);
    assert!(json["failures"].as_array().unwrap().is_empty());

    let files = fixture.backup_dir().join("files");
    assert_eq!(fs::read_to_string(files.join(".env")).unwrap(), "TOKEN=abc\n");
    assert!(files.join("src/main.rs").is_file());
    assert!(fixture.backup_dir().join("manifests/latest.json").is_file());
}

#[test]
fn second_run_archives_only_real_changes() {
    let fixture = Fixture::new();
    assert_eq!(fixture.run_json().0, 0);

    let (code, json) = fixture.run_json();
    assert_eq!(code, 0);
    assert_eq!(json["archived"], 0);

    fs::write(fixture.work.path().join("api/src/main.rs"), "fn main() { run() }\n").unwrap();
    let (code, json) = fixture.run_json();
    assert_eq!(code, 0);
    assert_eq!(json["archived"], 1);
    let archived: Vec<_> = fs::read_dir(fixture.backup_dir().join("archived/src"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(archived.len(), 1);
    assert!(archived[0].starts_with("main.rs."));
}

#[test]
fn held_lock_exits_three() {
    let fixture = Fixture::new();
    let lock_dir = fixture.home.path().join(".checkpoint/locks/api.lock");
    fs::create_dir_all(&lock_dir).unwrap();
    // This test process is alive, so the lock is not stale.
    fs::write(lock_dir.join("pid"), std::process::id().to_string()).unwrap();

    let (code, json) = fixture.run_json();
    assert_eq!(code, 3);
    assert_eq!(json["status"], "lock_contention");
    assert_eq!(json["holder_pid"], std::process::id());
    assert!(!fixture.backup_dir().join("files").exists());
}

#[test]
fn missing_project_root_exits_two() {
    let fixture = Fixture::new();
    fs::remove_dir_all(fixture.work.path().join("api")).unwrap();

    checkpoint(fixture.home.path())
        .args(["run", "api"])
        .assert()
        .code(2)
        .stderr(contains("backup of 'api' failed"));

    let (code, json) = fixture.run_json();
    assert_eq!(code, 2);
    assert_eq!(json["status"], "total_failure");
    assert!(json["error"].as_str().is_some());
}

#[test]
fn unknown_project_fails_with_hint() {
    let home = TempDir::new().unwrap();
    checkpoint(home.path())
        .args(["run", "ghost"])
        .assert()
        .failure()
        .stderr(contains("checkpoint init"));
}

#[test]
fn cleanup_dry_run_then_delete() {
    let fixture = Fixture::new();
    let databases = fixture.backup_dir().join("databases");
    fs::create_dir_all(&databases).unwrap();
    let old = databases.join("api-old.sql");
    let recent = databases.join("api-recent.sql");
    fs::write(&old, "old dump").unwrap();
    fs::write(&recent, "recent dump").unwrap();
    age(&old, 40);
    age(&recent, 5);

    let output = checkpoint(fixture.home.path())
        .args(["cleanup", "api", "--dry-run", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let json: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["report"]["dry_run"], true);
    assert_eq!(json["report"]["deleted_count"], 1);
    assert_eq!(json["report"]["bytes_freed"], 8);
    assert_eq!(json["plan"]["expired_db"][0]["reason"], "expired");
    assert!(old.exists(), "dry run must not delete");

    checkpoint(fixture.home.path())
        .args(["cleanup", "api"])
        .assert()
        .success()
        .stdout(contains("deleted 1 file(s)"));
    assert!(!old.exists());
    assert!(recent.exists());
    assert!(fixture
        .home
        .path()
        .join(".checkpoint/state/api.last-cleanup")
        .is_file());
}

#[test]
fn cleanup_waits_for_a_running_backup() {
    let fixture = Fixture::new();
    let databases = fixture.backup_dir().join("databases");
    fs::create_dir_all(&databases).unwrap();
    let old = databases.join("api-old.sql");
    fs::write(&old, "old dump").unwrap();
    age(&old, 40);

    let lock_dir = fixture.home.path().join(".checkpoint/locks/api.lock");
    fs::create_dir_all(&lock_dir).unwrap();
    fs::write(lock_dir.join("pid"), std::process::id().to_string()).unwrap();

    let output = checkpoint(fixture.home.path())
        .args(["cleanup", "api", "--json"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(3));
    let json: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["status"], "lock_contention");
    assert_eq!(json["holder_pid"], std::process::id());
    assert!(old.exists());

    // Planning alone does not need the lock.
    checkpoint(fixture.home.path())
        .args(["cleanup", "api", "--dry-run"])
        .assert()
        .success()
        .stdout(contains("would delete 1 file(s)"));
    assert!(lock_dir.join("pid").exists());
}
