//! End-to-end backup cycle tests. Each test gets its own home and project
//! directories; projects are plain directories so the mtime detector runs.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use checkpoint_core::{BackupConfig, ProjectName};
use checkpoint_engine::heartbeat::{self, HeartbeatStatus};
use checkpoint_engine::{
    manifest, AcquireOutcome, BackupCycle, BackupLock, Copier, CycleStatus, FailureCode, FsCopier,
};
use filetime::{set_file_mtime, FileTime};
use tempfile::TempDir;

struct Env {
    home: TempDir,
    _work: TempDir,
    config: BackupConfig,
}

fn env() -> Env {
    let _ = env_logger::builder().is_test(true).try_init();
    let home = TempDir::new().expect("home");
    let work = TempDir::new().expect("work");
    let root = work.path().join("shop");
    fs::create_dir_all(&root).expect("mkdir project");
    let mut config = BackupConfig::new(ProjectName::from("shop"), root, work.path().join("backup"));
    config.archive.retry_delay_ms = 0;
    Env {
        home,
        _work: work,
        config,
    }
}

fn write(config: &BackupConfig, rel: &str, content: &str) -> PathBuf {
    let path = config.project_root.join(rel);
    fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    fs::write(&path, content).expect("write");
    path
}

fn age_days(path: &Path, days: u64) {
    let when = SystemTime::now() - Duration::from_secs(days * 24 * 3600);
    set_file_mtime(path, FileTime::from_system_time(when)).expect("set mtime");
}

fn archived_versions(config: &BackupConfig) -> Vec<PathBuf> {
    let root = config.archive_root();
    if !root.exists() {
        return vec![];
    }
    walkdir_files(&root)
}

fn walkdir_files(root: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    for entry in fs::read_dir(root).expect("read_dir") {
        let path = entry.expect("entry").path();
        if path.is_dir() {
            out.extend(walkdir_files(&path));
        } else {
            out.push(path);
        }
    }
    out.sort();
    out
}

#[test]
fn two_modified_one_new_one_unchanged() {
    let env = env();
    let cfg = &env.config;
    write(cfg, "src/app.py", "print('v1')");
    write(cfg, "src/models.py", "class A: pass");
    let stable = write(cfg, "README.md", "hello");

    let first = BackupCycle::new(env.home.path(), cfg).run().expect("first cycle");
    assert_eq!(first.status, CycleStatus::Success);
    assert_eq!(first.archive.as_ref().expect("archive").succeeded, 3);

    age_days(&stable, 2);
    write(cfg, "src/app.py", "print('v2')  # edited");
    write(cfg, "src/models.py", "class A:\n    x = 1\n");
    write(cfg, "src/views.py", "def index(): ...");

    let second = BackupCycle::new(env.home.path(), cfg).run().expect("second cycle");
    let archive = second.archive.as_ref().expect("archive");
    assert_eq!(second.changes, 3);
    assert_eq!(archive.archived, 2);
    assert_eq!(archive.succeeded, 3);
    assert_eq!(archive.failed, 0);
    assert!(archive.failures.is_empty(), "verification must pass");
    assert_eq!(second.status, CycleStatus::Success);

    let versions = archived_versions(cfg);
    assert_eq!(versions.len(), 2);
    let contents: Vec<String> = versions
        .iter()
        .map(|p| fs::read_to_string(p).expect("read version"))
        .collect();
    assert!(contents.contains(&"print('v1')".to_string()));
    assert_eq!(
        fs::read_to_string(cfg.snapshot_root().join("src/app.py")).expect("snapshot"),
        "print('v2')  # edited"
    );

    let latest = manifest::load_latest(&cfg.manifest_root())
        .expect("load manifest")
        .expect("manifest persisted");
    assert_eq!(latest.files.len(), 3);
}

#[test]
fn second_run_without_changes_copies_nothing() {
    let env = env();
    let cfg = &env.config;
    write(cfg, "a.txt", "a");
    write(cfg, ".env", "SECRET=1");

    BackupCycle::new(env.home.path(), cfg).run().expect("first");
    let again = BackupCycle::new(env.home.path(), cfg).run().expect("second");
    let archive = again.archive.expect("archive");
    assert_eq!(archive.succeeded, 0);
    assert_eq!(archive.archived, 0);
    assert_eq!(archive.unchanged, 2);
    assert_eq!(again.status, CycleStatus::Success);
    assert!(archived_versions(cfg).is_empty());
}

#[test]
fn contention_exits_3_and_refreshes_heartbeat() {
    let env = env();
    let cfg = &env.config;
    write(cfg, "a.txt", "a");
    BackupCycle::new(env.home.path(), cfg).run().expect("first");
    let before = heartbeat::read_at(env.home.path()).expect("read").expect("heartbeat");

    let held = BackupLock::acquire_at(env.home.path(), &cfg.project_name).expect("acquire");
    assert!(matches!(held, AcquireOutcome::Acquired(_)));

    let report = BackupCycle::new(env.home.path(), cfg).run().expect("contended");
    assert_eq!(report.status, CycleStatus::LockContention);
    assert_eq!(report.status.exit_code(), 3);
    assert_eq!(report.holder_pid, Some(std::process::id()));

    let after = heartbeat::read_at(env.home.path()).expect("read").expect("heartbeat");
    assert_eq!(after.last_backup, before.last_backup);
    assert_eq!(after.last_backup_files, before.last_backup_files);
    assert_eq!(after.status, before.status);
}

#[test]
fn successful_cycle_writes_healthy_heartbeat_and_releases_lock() {
    let env = env();
    let cfg = &env.config;
    write(cfg, "a.txt", "a");
    BackupCycle::new(env.home.path(), cfg).run().expect("cycle");

    let hb = heartbeat::read_at(env.home.path()).expect("read").expect("heartbeat");
    assert_eq!(hb.status, HeartbeatStatus::Healthy);
    assert_eq!(hb.project, "shop");
    assert_eq!(hb.last_backup_files, 1);
    assert!(hb.error.is_none());
    assert!(matches!(
        BackupLock::acquire_at(env.home.path(), &cfg.project_name).expect("acquire"),
        AcquireOutcome::Acquired(_)
    ));
}

/// Every copy fails.
struct DeadDisk;

impl Copier for DeadDisk {
    fn copy(&self, _src: &Path, _dest: &Path) -> std::io::Result<u64> {
        Err(std::io::Error::other("device not ready"))
    }
}

/// Fails for one file name only.
struct FailsFor(&'static str);

impl Copier for FailsFor {
    fn copy(&self, src: &Path, dest: &Path) -> std::io::Result<u64> {
        if src.file_name().and_then(|n| n.to_str()) == Some(self.0) {
            return Err(std::io::Error::other("injected"));
        }
        FsCopier.copy(src, dest)
    }
}

#[test]
fn total_failure_reports_codes_in_heartbeat() {
    let env = env();
    let cfg = &env.config;
    write(cfg, "a.txt", "a");

    let report = BackupCycle::new(env.home.path(), cfg)
        .with_copier(Box::new(DeadDisk))
        .run()
        .expect("cycle");
    assert_eq!(report.status, CycleStatus::TotalFailure);
    assert_eq!(report.status.exit_code(), 2);

    let hb = heartbeat::read_at(env.home.path()).expect("read").expect("heartbeat");
    assert_eq!(hb.status, HeartbeatStatus::Error);
    let message = hb.error.expect("error message");
    assert!(message.contains("COPY_FAILED"), "got: {message}");
}

#[test]
fn partial_failure_exits_1() {
    let env = env();
    let cfg = &env.config;
    write(cfg, "good.txt", "g");
    write(cfg, "bad.txt", "b");

    let report = BackupCycle::new(env.home.path(), cfg)
        .with_copier(Box::new(FailsFor("bad.txt")))
        .run()
        .expect("cycle");
    assert_eq!(report.status, CycleStatus::Partial);
    assert_eq!(report.status.exit_code(), 1);
    let archive = report.archive.expect("archive");
    assert_eq!(archive.failures.len(), 1);
    assert_eq!(archive.failures[0].code, FailureCode::CopyFailed);
}

#[test]
fn cancelled_cycle_copies_nothing_and_releases_lock() {
    let env = env();
    let cfg = &env.config;
    write(cfg, "a.txt", "a");

    let report = BackupCycle::new(env.home.path(), cfg)
        .with_cancel(Arc::new(AtomicBool::new(true)))
        .run()
        .expect("cycle");
    assert_eq!(report.status, CycleStatus::Partial);
    assert_eq!(report.status.exit_code(), 1);
    assert!(report.archive.expect("archive").cancelled);
    assert!(!cfg.snapshot_root().join("a.txt").exists());

    let hb = heartbeat::read_at(env.home.path()).expect("read").expect("heartbeat");
    assert_eq!(hb.status, HeartbeatStatus::Error);
    assert!(hb.error.expect("error text").contains("1 file(s) unprocessed"));
    assert!(matches!(
        BackupLock::acquire_at(env.home.path(), &cfg.project_name).expect("acquire"),
        AcquireOutcome::Acquired(_)
    ));
}

#[test]
fn backup_dir_inside_project_is_not_backed_up() {
    let mut env = env();
    env.config.backup_dir = env.config.project_root.join(".backups");
    let cfg = &env.config;
    write(cfg, "a.txt", "a");

    BackupCycle::new(env.home.path(), cfg).run().expect("first");
    let second = BackupCycle::new(env.home.path(), cfg).run().expect("second");
    assert_eq!(second.changes, 1);
    assert!(!cfg.snapshot_root().join(".backups").exists());
}

#[test]
fn missing_project_root_is_an_error_with_error_heartbeat() {
    let env = env();
    let mut cfg = env.config.clone();
    cfg.project_root = cfg.project_root.join("does-not-exist");

    assert!(BackupCycle::new(env.home.path(), &cfg).run().is_err());
    let hb = heartbeat::read_at(env.home.path()).expect("read").expect("heartbeat");
    assert_eq!(hb.status, HeartbeatStatus::Error);
}
