use std::fs;
use std::path::{Path, PathBuf};

use super::{ensure_parent, run_tool, scan_definitions, DaemonInfo, DaemonManager, ServiceSpec};
use crate::error::{io_err, DaemonError};
use crate::paths::{systemd_unit_name, systemd_unit_path, systemd_user_dir, WATCHDOG_LABEL};

/// Linux user units under `~/.config/systemd/user`, driven through
/// `systemctl --user`.
#[derive(Debug, Clone)]
pub struct SystemdManager {
    home: PathBuf,
}

impl SystemdManager {
    pub fn new(home: &Path) -> Self {
        Self {
            home: home.to_path_buf(),
        }
    }
}

/// Render the user unit for `spec`.
pub fn generate_unit(spec: &ServiceSpec) -> String {
    let mut exec = quote_arg(&spec.program.display().to_string());
    for arg in &spec.args {
        exec.push(' ');
        exec.push_str(&quote_arg(arg));
    }

    format!(
        "[Unit]\n\
         Description={description}\n\
         \n\
         [Service]\n\
         Type=simple\n\
         ExecStart={exec}\n\
         Restart=always\n\
         RestartSec=10\n\
         StandardOutput=append:{stdout}\n\
         StandardError=append:{stderr}\n\
         \n\
         [Install]\n\
         WantedBy=default.target\n",
        description = spec.description,
        stdout = spec.stdout.display(),
        stderr = spec.stderr.display(),
    )
}

fn quote_arg(arg: &str) -> String {
    if arg.contains(char::is_whitespace) || arg.contains('"') {
        format!("\"{}\"", arg.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        arg.to_string()
    }
}

fn systemctl(args: &[&str], ignore_failure: bool) -> Result<(), DaemonError> {
    let mut full = vec!["--user"];
    full.extend_from_slice(args);
    run_tool("systemctl", &full, ignore_failure)
}

impl DaemonManager for SystemdManager {
    fn name(&self) -> &'static str {
        "systemd"
    }

    fn list(&self) -> Result<Vec<DaemonInfo>, DaemonError> {
        let watchdog_unit = systemd_unit_name(WATCHDOG_LABEL);
        scan_definitions(&systemd_user_dir(&self.home), |name| {
            let stem = name.strip_suffix(".service")?;
            (stem.starts_with("checkpoint-") && name != watchdog_unit)
                .then(|| format!("dev.{}", stem.replacen('-', ".", 1)))
        })
    }

    fn restart(&self, daemon: &DaemonInfo) -> Result<(), DaemonError> {
        systemctl(&["restart", &systemd_unit_name(&daemon.label)], false)
    }

    fn install(&self, spec: &ServiceSpec) -> Result<PathBuf, DaemonError> {
        let unit_path = systemd_unit_path(&self.home, &spec.label);
        ensure_parent(&unit_path)?;
        ensure_parent(&spec.stdout)?;
        ensure_parent(&spec.stderr)?;
        fs::write(&unit_path, generate_unit(spec)).map_err(|e| io_err(&unit_path, e))?;

        let unit = systemd_unit_name(&spec.label);
        systemctl(&["daemon-reload"], false)?;
        systemctl(&["enable", "--now", &unit], false)?;
        systemctl(&["restart", &unit], false)?;
        Ok(unit_path)
    }

    fn uninstall(&self, label: &str) -> Result<(), DaemonError> {
        let unit_path = systemd_unit_path(&self.home, label);
        if unit_path.exists() {
            systemctl(&["disable", "--now", &systemd_unit_name(label)], true)?;
            fs::remove_file(&unit_path).map_err(|e| io_err(&unit_path, e))?;
            systemctl(&["daemon-reload"], true)?;
        }
        Ok(())
    }
}
