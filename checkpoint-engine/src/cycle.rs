//! Backup cycle entrypoint shared by the CLI and the daemon.
//!
//! lock → heartbeat `syncing` → detect → archive → persist manifest →
//! cleanup (when due) → heartbeat `healthy`/`error` → unlock.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use checkpoint_core::BackupConfig;
use checkpoint_detector::{detect_changes, select_detector};

use crate::archive::{ArchiveReport, Archiver, Copier, FileFailure, RunOutcome};
use crate::error::EngineError;
use crate::heartbeat::HeartbeatWriter;
use crate::lock::{AcquireOutcome, BackupLock};
use crate::manifest;
use crate::retention::{self, CleanupReport};

/// Final state of a cycle, mapped onto the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    Success,
    Partial,
    TotalFailure,
    LockContention,
}

impl CycleStatus {
    pub fn exit_code(self) -> i32 {
        match self {
            CycleStatus::Success => 0,
            CycleStatus::Partial => 1,
            CycleStatus::TotalFailure => 2,
            CycleStatus::LockContention => 3,
        }
    }
}

impl From<RunOutcome> for CycleStatus {
    fn from(outcome: RunOutcome) -> Self {
        match outcome {
            RunOutcome::Success => CycleStatus::Success,
            RunOutcome::Partial => CycleStatus::Partial,
            RunOutcome::TotalFailure => CycleStatus::TotalFailure,
        }
    }
}

/// Outcome of one cycle.
#[derive(Debug)]
pub struct CycleReport {
    pub status: CycleStatus,
    /// Size of the change set.
    pub changes: usize,
    pub detector: &'static str,
    pub archive: Option<ArchiveReport>,
    pub manifest_path: Option<PathBuf>,
    pub cleanup: Option<CleanupReport>,
    pub holder_pid: Option<u32>,
}

impl CycleReport {
    fn contended(holder_pid: Option<u32>) -> Self {
        Self {
            status: CycleStatus::LockContention,
            changes: 0,
            detector: "none",
            archive: None,
            manifest_path: None,
            cleanup: None,
            holder_pid,
        }
    }
}

/// Configurable backup cycle for one project.
pub struct BackupCycle<'a> {
    home: &'a Path,
    config: &'a BackupConfig,
    cancel: Arc<AtomicBool>,
    copier: Option<Box<dyn Copier>>,
    force_cleanup: bool,
}

impl<'a> BackupCycle<'a> {
    pub fn new(home: &'a Path, config: &'a BackupConfig) -> Self {
        Self {
            home,
            config,
            cancel: Arc::new(AtomicBool::new(false)),
            copier: None,
            force_cleanup: false,
        }
    }

    /// Flag checked between files; set by signal handlers.
    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_copier(mut self, copier: Box<dyn Copier>) -> Self {
        self.copier = Some(copier);
        self
    }

    /// Run cleanup regardless of the cadence marker.
    pub fn force_cleanup(mut self, force: bool) -> Self {
        self.force_cleanup = force;
        self
    }

    pub fn run(mut self) -> Result<CycleReport, EngineError> {
        let (home, config) = (self.home, self.config);
        let project = &config.project_name;
        let beat = HeartbeatWriter::new(home, project);

        let mut lock = match BackupLock::acquire_at(home, project)? {
            AcquireOutcome::Acquired(lock) => lock,
            AcquireOutcome::Held { holder_pid } => {
                tracing::info!(
                    "{project}: backup already running (pid {}), skipping",
                    holder_pid.map_or_else(|| "unknown".to_string(), |p| p.to_string())
                );
                if let Err(e) = beat.contended() {
                    tracing::warn!("{project}: heartbeat refresh failed: {e}");
                }
                return Ok(CycleReport::contended(holder_pid));
            }
        };

        if let Err(e) = beat.syncing() {
            tracing::warn!("{project}: heartbeat write failed: {e}");
        }
        let result = self.run_locked();
        let report = match result {
            Ok(report) => report,
            Err(e) => {
                if let Err(hb) = beat.finished(0, Some(e.to_string())) {
                    tracing::warn!("{project}: heartbeat write failed: {hb}");
                }
                return Err(e);
            }
        };

        let (files, error) = match &report.archive {
            Some(archive) => (archive.succeeded as u64, heartbeat_error(archive)),
            None => (0, None),
        };
        if let Err(e) = beat.finished(files, error) {
            tracing::warn!("{project}: heartbeat write failed: {e}");
        }
        lock.release()?;

        tracing::info!(
            "{project}: cycle finished {:?} ({} change(s))",
            report.status,
            report.changes
        );
        Ok(report)
    }

    fn run_locked(&mut self) -> Result<CycleReport, EngineError> {
        let config = self.config;
        if !config.project_root.is_dir() {
            return Err(EngineError::MissingProjectRoot {
                path: config.project_root.clone(),
            });
        }

        let mut excluded = vec![config.backup_dir.clone()];
        excluded.extend(config.secondary_backup_dir.clone());
        let detector = select_detector(&config.project_root, &config.detection, &excluded);
        let changes = detect_changes(&config.project_root, &config.detection, detector.as_ref(), &excluded)?;
        tracing::info!(
            "{}: {} change(s) via {} detector",
            config.project_name,
            changes.len(),
            detector.name()
        );

        let mut archiver = Archiver::new(config).with_cancel(Arc::clone(&self.cancel));
        if let Some(copier) = self.copier.take() {
            archiver = archiver.with_copier(copier);
        }
        let archive = archiver.run(&changes);

        let manifest_path = if archive.manifest.is_empty() {
            None
        } else {
            Some(manifest::persist(&config.manifest_root(), &archive.manifest)?)
        };

        let cleanup = if archive.cancelled {
            None
        } else {
            self.cleanup_if_due()
        };

        Ok(CycleReport {
            status: archive.outcome().into(),
            changes: changes.len(),
            detector: detector.name(),
            archive: Some(archive),
            manifest_path,
            cleanup,
            holder_pid: None,
        })
    }

    /// Cleanup problems are logged; they never fail the cycle.
    fn cleanup_if_due(&self) -> Option<CleanupReport> {
        let config = self.config;
        let now = Utc::now();
        let due = self.force_cleanup
            || retention::cleanup_due_at(
                self.home,
                &config.project_name,
                config.retention.cleanup_interval_hours,
                now,
            );
        if !due {
            return None;
        }
        let plan = match retention::plan_cleanup(config) {
            Ok(plan) => plan,
            Err(e) => {
                tracing::warn!("{}: cleanup planning failed: {e}", config.project_name);
                return None;
            }
        };
        let report = retention::execute_cleanup(&plan, false);
        if let Err(e) = retention::mark_cleanup_at(self.home, &config.project_name, now) {
            tracing::warn!("{}: cleanup marker not written: {e}", config.project_name);
        }
        Some(report)
    }
}

/// Heartbeat error text: failure count plus each distinct code with its
/// remediation. `None` when nothing failed.
pub fn failure_summary(failures: &[FileFailure]) -> Option<String> {
    if failures.is_empty() {
        return None;
    }
    let codes: BTreeSet<_> = failures.iter().map(|f| f.code).collect();
    let parts: Vec<String> = codes
        .into_iter()
        .map(|code| format!("{code} ({})", code.remediation()))
        .collect();
    Some(format!("{} file(s) failed: {}", failures.len(), parts.join("; ")))
}

/// Failure summary plus a note when cancellation left files unprocessed.
fn heartbeat_error(archive: &ArchiveReport) -> Option<String> {
    let cancelled = (archive.unprocessed > 0)
        .then(|| format!("cancelled with {} file(s) unprocessed", archive.unprocessed));
    match (failure_summary(&archive.failures), cancelled) {
        (Some(failures), Some(cancelled)) => Some(format!("{failures}; {cancelled}")),
        (failures, cancelled) => failures.or(cancelled),
    }
}

/// `BackupCycle::new(home, config).run()`.
pub fn run_backup_cycle_at(home: &Path, config: &BackupConfig) -> Result<CycleReport, EngineError> {
    BackupCycle::new(home, config).run()
}

/// `run_backup_cycle_at` with the home directory resolved from the
/// environment.
pub fn run_backup_cycle(config: &BackupConfig) -> Result<CycleReport, EngineError> {
    let home = dirs::home_dir().ok_or(EngineError::HomeNotFound)?;
    run_backup_cycle_at(&home, config)
}
