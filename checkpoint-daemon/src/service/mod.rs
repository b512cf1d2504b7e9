//! Platform service managers for the backup daemon and the watchdog.
//!
//! The watchdog only ever talks to a [`DaemonManager`]; it never signals
//! daemon processes directly.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{io_err, DaemonError};
use crate::paths::{self, DAEMON_LABEL, WATCHDOG_LABEL};

mod launchd;
mod systemd;

pub use launchd::{generate_plist, LaunchdManager};
pub use systemd::{generate_unit, SystemdManager};

/// One installed backup daemon as seen by the service manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonInfo {
    pub label: String,
    /// The plist or unit file that defines it.
    pub definition: PathBuf,
}

/// What to install: a label, a command line and where its output goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    pub label: String,
    pub description: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

impl ServiceSpec {
    /// `checkpoint daemon start`, restarted by the platform when it exits.
    pub fn backup_daemon(home: &Path, program: &Path) -> Self {
        Self {
            label: DAEMON_LABEL.to_string(),
            description: "Checkpoint backup daemon".to_string(),
            program: program.to_path_buf(),
            args: vec!["daemon".to_string(), "start".to_string()],
            stdout: paths::stdout_log_path(home),
            stderr: paths::stderr_log_path(home),
        }
    }

    /// `checkpoint watchdog`, polling the heartbeat of the daemons above.
    pub fn watchdog(home: &Path, program: &Path) -> Self {
        let logs = paths::logs_dir(home);
        Self {
            label: WATCHDOG_LABEL.to_string(),
            description: "Checkpoint backup watchdog".to_string(),
            program: program.to_path_buf(),
            args: vec!["watchdog".to_string()],
            stdout: logs.join(paths::WATCHDOG_STDOUT_LOG),
            stderr: logs.join(paths::WATCHDOG_STDERR_LOG),
        }
    }
}

/// Lists, restarts, installs and removes backup daemons.
pub trait DaemonManager: Send + Sync {
    fn name(&self) -> &'static str;

    /// Installed backup daemons. The watchdog itself is never listed.
    fn list(&self) -> Result<Vec<DaemonInfo>, DaemonError>;

    fn restart(&self, daemon: &DaemonInfo) -> Result<(), DaemonError>;

    /// Write the service definition, load it and start it. Returns the path
    /// of the definition file.
    fn install(&self, spec: &ServiceSpec) -> Result<PathBuf, DaemonError>;

    fn uninstall(&self, label: &str) -> Result<(), DaemonError>;
}

/// Platforms without a supported service manager: no daemons, nothing to
/// restart.
#[derive(Debug, Default)]
pub struct UnsupportedManager;

impl DaemonManager for UnsupportedManager {
    fn name(&self) -> &'static str {
        "unsupported"
    }

    fn list(&self) -> Result<Vec<DaemonInfo>, DaemonError> {
        Ok(Vec::new())
    }

    fn restart(&self, daemon: &DaemonInfo) -> Result<(), DaemonError> {
        Err(DaemonError::Service(format!(
            "cannot restart {}: no service manager on this platform",
            daemon.label
        )))
    }

    fn install(&self, _spec: &ServiceSpec) -> Result<PathBuf, DaemonError> {
        Err(DaemonError::Service(
            "service installation requires launchd (macOS) or systemd (Linux)".to_string(),
        ))
    }

    fn uninstall(&self, _label: &str) -> Result<(), DaemonError> {
        Ok(())
    }
}

/// Pick the manager for the running platform.
pub fn detect_manager(home: &Path) -> Box<dyn DaemonManager> {
    if cfg!(target_os = "macos") {
        return Box::new(LaunchdManager::new(home));
    }
    if cfg!(target_os = "linux") && command_available("systemctl") {
        return Box::new(SystemdManager::new(home));
    }
    Box::new(UnsupportedManager)
}

fn command_available(program: &str) -> bool {
    Command::new(program)
        .arg("--version")
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

/// Definition files in `dir` whose names pass `select`, sorted by name.
/// A missing directory means nothing is installed.
pub(crate) fn scan_definitions(
    dir: &Path,
    select: impl Fn(&str) -> Option<String>,
) -> Result<Vec<DaemonInfo>, DaemonError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_err(dir, e)),
    };

    let mut found = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| io_err(dir, e))?;
        let name = entry.file_name();
        let Some(label) = name.to_str().and_then(&select) else {
            continue;
        };
        found.push(DaemonInfo {
            label,
            definition: entry.path(),
        });
    }
    found.sort_by(|a, b| a.label.cmp(&b.label));
    Ok(found)
}

pub(crate) fn run_tool(program: &str, args: &[&str], ignore_failure: bool) -> Result<(), DaemonError> {
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| io_err(program, e))?;

    if output.status.success() || ignore_failure {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    Err(DaemonError::Service(format!(
        "{program} {} failed (status {}): {stdout} {stderr}",
        args.join(" "),
        output.status
    )))
}

pub(crate) fn ensure_parent(path: &Path) -> Result<(), DaemonError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_manager_reports_no_daemons() {
        let manager = UnsupportedManager;
        assert!(manager.list().unwrap().is_empty());
        let spec = ServiceSpec::backup_daemon(Path::new("/home/dev"), Path::new("/usr/bin/checkpoint"));
        assert!(matches!(manager.install(&spec), Err(DaemonError::Service(_))));
    }

    #[test]
    fn specs_route_output_to_checkpoint_logs() {
        let home = Path::new("/home/dev");
        let daemon = ServiceSpec::backup_daemon(home, Path::new("/usr/bin/checkpoint"));
        assert_eq!(daemon.args, vec!["daemon", "start"]);
        assert!(daemon.stdout.ends_with(".checkpoint/logs/daemon.log"));

        let watchdog = ServiceSpec::watchdog(home, Path::new("/usr/bin/checkpoint"));
        assert_eq!(watchdog.label, WATCHDOG_LABEL);
        assert!(watchdog.stderr.ends_with(".checkpoint/logs/watchdog-err.log"));
    }
}
