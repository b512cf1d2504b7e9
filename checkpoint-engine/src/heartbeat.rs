//! Heartbeat file: the liveness signal the watchdog polls.
//!
//! Persists a [`Heartbeat`] JSON document at
//! `<home>/.checkpoint/state/heartbeat.json`. Every write goes through its
//! own temp file and a rename, so readers never see a torn document and
//! concurrent writers in one process never share a temp path.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use checkpoint_core::{paths, ProjectName};

use crate::error::{io_err, EngineError};

static WRITE_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeartbeatStatus {
    Healthy,
    Syncing,
    Error,
    Stopped,
}

/// Daemon progress through the registered projects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncProgress {
    pub projects_total: usize,
    pub projects_done: usize,
    pub current_project: Option<String>,
}

/// On-disk heartbeat payload. Timestamps are Unix seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub timestamp: i64,
    pub status: HeartbeatStatus,
    pub project: String,
    pub last_backup: i64,
    pub last_backup_files: u64,
    pub error: Option<String>,
    pub pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_progress: Option<SyncProgress>,
}

impl Heartbeat {
    /// A fresh heartbeat for `project` with no backup history.
    pub fn new(project: &ProjectName, status: HeartbeatStatus) -> Self {
        Self {
            timestamp: Utc::now().timestamp(),
            status,
            project: project.to_string(),
            last_backup: 0,
            last_backup_files: 0,
            error: None,
            pid: std::process::id(),
            sync_progress: None,
        }
    }

    /// Seconds since the heartbeat was written, clamped at zero.
    pub fn age_secs(&self, now: i64) -> u64 {
        u64::try_from(now - self.timestamp).unwrap_or(0)
    }

    pub fn is_stale(&self, now: i64, stale_after_secs: u64) -> bool {
        self.age_secs(now) > stale_after_secs
    }
}

// ---------------------------------------------------------------------------
// Read / write
// ---------------------------------------------------------------------------

/// Load the heartbeat, or `None` if it was never written.
pub fn read_at(home: &Path) -> Result<Option<Heartbeat>, EngineError> {
    let path = paths::heartbeat_path(home);
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_err(&path, e)),
    };
    Ok(Some(serde_json::from_str(&contents)?))
}

/// Atomically replace the heartbeat file.
pub fn write_at(home: &Path, heartbeat: &Heartbeat) -> Result<(), EngineError> {
    let path = paths::heartbeat_path(home);
    let Some(dir) = path.parent() else {
        return Err(io_err(path, std::io::Error::other("invalid heartbeat path")));
    };
    std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;

    let json = serde_json::to_string_pretty(heartbeat)?;
    // Backup processes and the daemon's tasks may write concurrently.
    let seq = WRITE_SEQ.fetch_add(1, Ordering::Relaxed);
    let tmp = dir.join(format!("heartbeat.json.{}.{seq}.tmp", std::process::id()));
    std::fs::write(&tmp, json).map_err(|e| io_err(&tmp, e))?;
    if let Err(e) = std::fs::rename(&tmp, &path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(io_err(&path, e));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Transitions
// ---------------------------------------------------------------------------

/// Writes the heartbeat transitions of one project's runs.
#[derive(Debug, Clone)]
pub struct HeartbeatWriter<'a> {
    home: &'a Path,
    project: &'a ProjectName,
}

impl<'a> HeartbeatWriter<'a> {
    pub fn new(home: &'a Path, project: &'a ProjectName) -> Self {
        Self { home, project }
    }

    /// Previous heartbeat (any project) or a blank one for ours.
    fn previous(&self, status: HeartbeatStatus) -> Heartbeat {
        match read_at(self.home) {
            Ok(Some(hb)) => hb,
            Ok(None) => Heartbeat::new(self.project, status),
            Err(e) => {
                tracing::warn!("unreadable heartbeat, starting fresh: {e}");
                Heartbeat::new(self.project, status)
            }
        }
    }

    /// A run started.
    pub fn syncing(&self) -> Result<Heartbeat, EngineError> {
        let mut hb = self.previous(HeartbeatStatus::Syncing);
        hb.timestamp = Utc::now().timestamp();
        hb.status = HeartbeatStatus::Syncing;
        hb.project = self.project.to_string();
        hb.pid = std::process::id();
        write_at(self.home, &hb)?;
        Ok(hb)
    }

    /// A run finished. `error` is `None` for a clean run.
    pub fn finished(&self, files: u64, error: Option<String>) -> Result<Heartbeat, EngineError> {
        let now = Utc::now().timestamp();
        let mut hb = self.previous(HeartbeatStatus::Healthy);
        hb.timestamp = now;
        hb.status = if error.is_some() {
            HeartbeatStatus::Error
        } else {
            HeartbeatStatus::Healthy
        };
        hb.project = self.project.to_string();
        hb.last_backup = now;
        hb.last_backup_files = files;
        hb.error = error;
        hb.pid = std::process::id();
        write_at(self.home, &hb)?;
        Ok(hb)
    }

    /// Another process holds the lock: refresh the timestamp and keep the
    /// previous outcome fields.
    pub fn contended(&self) -> Result<Heartbeat, EngineError> {
        let mut hb = self.previous(HeartbeatStatus::Syncing);
        hb.timestamp = Utc::now().timestamp();
        write_at(self.home, &hb)?;
        Ok(hb)
    }
}

/// Liveness tick between runs: refresh timestamp and PID only.
pub fn touch_at(home: &Path, project: &ProjectName) -> Result<Heartbeat, EngineError> {
    let mut hb = match read_at(home) {
        Ok(Some(hb)) => hb,
        _ => Heartbeat::new(project, HeartbeatStatus::Healthy),
    };
    hb.timestamp = Utc::now().timestamp();
    hb.pid = std::process::id();
    if hb.status == HeartbeatStatus::Stopped {
        hb.status = HeartbeatStatus::Healthy;
    }
    write_at(home, &hb)?;
    Ok(hb)
}

/// Record daemon progress through its project list.
pub fn set_progress_at(
    home: &Path,
    project: &ProjectName,
    progress: Option<SyncProgress>,
) -> Result<(), EngineError> {
    let mut hb = match read_at(home) {
        Ok(Some(hb)) => hb,
        _ => Heartbeat::new(project, HeartbeatStatus::Syncing),
    };
    hb.timestamp = Utc::now().timestamp();
    hb.sync_progress = progress;
    write_at(home, &hb)
}

/// The daemon is shutting down.
pub fn stopped_at(home: &Path, project: &ProjectName) -> Result<(), EngineError> {
    let mut hb = match read_at(home) {
        Ok(Some(hb)) => hb,
        _ => Heartbeat::new(project, HeartbeatStatus::Stopped),
    };
    hb.timestamp = Utc::now().timestamp();
    hb.status = HeartbeatStatus::Stopped;
    hb.pid = std::process::id();
    hb.sync_progress = None;
    write_at(home, &hb)
}
