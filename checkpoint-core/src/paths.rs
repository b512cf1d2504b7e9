//! Layout of the per-user state directory.
//!
//! ```text
//! ~/.checkpoint/
//!   projects/<project>.yaml      backup configuration, one per project
//!   watchdog.yaml                optional watchdog overrides
//!   locks/<project>.lock/pid     cross-process run lock
//!   state/heartbeat.json         daemon heartbeat
//!   state/watchdog.json          watchdog status
//!   state/<project>.last-cleanup cleanup cadence marker
//!   logs/                        daemon and watchdog logs
//! ```

use std::path::{Path, PathBuf};

pub fn checkpoint_root(home: &Path) -> PathBuf {
    home.join(".checkpoint")
}

pub fn projects_dir(home: &Path) -> PathBuf {
    checkpoint_root(home).join("projects")
}

pub fn config_path(home: &Path, project: &str) -> PathBuf {
    projects_dir(home).join(format!("{project}.yaml"))
}

pub fn watchdog_config_path(home: &Path) -> PathBuf {
    checkpoint_root(home).join("watchdog.yaml")
}

pub fn locks_dir(home: &Path) -> PathBuf {
    checkpoint_root(home).join("locks")
}

pub fn state_dir(home: &Path) -> PathBuf {
    checkpoint_root(home).join("state")
}

pub fn heartbeat_path(home: &Path) -> PathBuf {
    state_dir(home).join("heartbeat.json")
}

pub fn watchdog_status_path(home: &Path) -> PathBuf {
    state_dir(home).join("watchdog.json")
}

pub fn cleanup_marker_path(home: &Path, project: &str) -> PathBuf {
    state_dir(home).join(format!("{project}.last-cleanup"))
}

pub fn logs_dir(home: &Path) -> PathBuf {
    checkpoint_root(home).join("logs")
}
