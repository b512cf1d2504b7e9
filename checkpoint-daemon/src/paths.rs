use std::path::{Path, PathBuf};

pub use checkpoint_core::paths::logs_dir;

pub const DAEMON_LABEL: &str = "dev.checkpoint.daemon";
pub const WATCHDOG_LABEL: &str = "dev.checkpoint.watchdog";

pub const DAEMON_STDOUT_LOG: &str = "daemon.log";
pub const DAEMON_STDERR_LOG: &str = "daemon-err.log";
pub const WATCHDOG_STDOUT_LOG: &str = "watchdog.log";
pub const WATCHDOG_STDERR_LOG: &str = "watchdog-err.log";

pub fn stdout_log_path(home: &Path) -> PathBuf {
    logs_dir(home).join(DAEMON_STDOUT_LOG)
}

pub fn stderr_log_path(home: &Path) -> PathBuf {
    logs_dir(home).join(DAEMON_STDERR_LOG)
}

/// Every log file the rotation task looks after.
pub fn log_files(home: &Path) -> [PathBuf; 4] {
    let logs = logs_dir(home);
    [
        logs.join(DAEMON_STDOUT_LOG),
        logs.join(DAEMON_STDERR_LOG),
        logs.join(WATCHDOG_STDOUT_LOG),
        logs.join(WATCHDOG_STDERR_LOG),
    ]
}

pub fn launch_agents_dir(home: &Path) -> PathBuf {
    home.join("Library").join("LaunchAgents")
}

pub fn launchd_plist_path(home: &Path, label: &str) -> PathBuf {
    launch_agents_dir(home).join(format!("{label}.plist"))
}

pub fn systemd_user_dir(home: &Path) -> PathBuf {
    home.join(".config").join("systemd").join("user")
}

/// `dev.checkpoint.daemon` → `checkpoint-daemon.service`.
pub fn systemd_unit_name(label: &str) -> String {
    let short = label.strip_prefix("dev.").unwrap_or(label);
    format!("{}.service", short.replace('.', "-"))
}

pub fn systemd_unit_path(home: &Path, label: &str) -> PathBuf {
    systemd_user_dir(home).join(systemd_unit_name(label))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_names_follow_labels() {
        assert_eq!(systemd_unit_name(DAEMON_LABEL), "checkpoint-daemon.service");
        assert_eq!(systemd_unit_name(WATCHDOG_LABEL), "checkpoint-watchdog.service");
        assert!(launchd_plist_path(Path::new("/Users/dev"), DAEMON_LABEL)
            .ends_with("Library/LaunchAgents/dev.checkpoint.daemon.plist"));
    }
}
