use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use super::{ensure_parent, run_tool, scan_definitions, DaemonInfo, DaemonManager, ServiceSpec};
use crate::error::{io_err, DaemonError};
use crate::paths::{launch_agents_dir, launchd_plist_path, WATCHDOG_LABEL};

const LABEL_PREFIX: &str = "dev.checkpoint.";

/// Per-user LaunchAgents in the `gui/<uid>` domain.
#[derive(Debug, Clone)]
pub struct LaunchdManager {
    home: PathBuf,
}

impl LaunchdManager {
    pub fn new(home: &Path) -> Self {
        Self {
            home: home.to_path_buf(),
        }
    }
}

/// Render the LaunchAgent plist for `spec`.
pub fn generate_plist(spec: &ServiceSpec) -> String {
    let mut arguments = format!("    <string>{}</string>\n", xml_escape(&spec.program.display().to_string()));
    for arg in &spec.args {
        arguments.push_str(&format!("    <string>{}</string>\n", xml_escape(arg)));
    }

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
  <key>Label</key>
  <string>{label}</string>
  <key>ProgramArguments</key>
  <array>
{arguments}  </array>
  <key>RunAtLoad</key>
  <true/>
  <key>KeepAlive</key>
  <true/>
  <key>ProcessType</key>
  <string>Background</string>
  <key>StandardOutPath</key>
  <string>{stdout}</string>
  <key>StandardErrorPath</key>
  <string>{stderr}</string>
</dict>
</plist>
"#,
        label = xml_escape(&spec.label),
        stdout = xml_escape(&spec.stdout.display().to_string()),
        stderr = xml_escape(&spec.stderr.display().to_string()),
    )
}

fn xml_escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

impl DaemonManager for LaunchdManager {
    fn name(&self) -> &'static str {
        "launchd"
    }

    fn list(&self) -> Result<Vec<DaemonInfo>, DaemonError> {
        scan_definitions(&launch_agents_dir(&self.home), |name| {
            let label = name.strip_suffix(".plist")?;
            (label.starts_with(LABEL_PREFIX) && label != WATCHDOG_LABEL).then(|| label.to_string())
        })
    }

    fn restart(&self, daemon: &DaemonInfo) -> Result<(), DaemonError> {
        ensure_macos()?;
        let service = format!("{}/{}", launchctl_domain()?, daemon.label);
        run_tool("launchctl", &["kickstart", "-k", &service], false)
    }

    fn install(&self, spec: &ServiceSpec) -> Result<PathBuf, DaemonError> {
        ensure_macos()?;

        let plist = launchd_plist_path(&self.home, &spec.label);
        ensure_parent(&plist)?;
        ensure_parent(&spec.stdout)?;
        ensure_parent(&spec.stderr)?;
        fs::write(&plist, generate_plist(spec)).map_err(|e| io_err(&plist, e))?;

        let domain = launchctl_domain()?;
        let service = format!("{domain}/{}", spec.label);
        let plist_arg = plist.display().to_string();

        run_tool("launchctl", &["bootout", &service], true)?;
        run_tool("launchctl", &["bootstrap", &domain, &plist_arg], false)?;
        run_tool("launchctl", &["kickstart", "-k", &service], false)?;

        Ok(plist)
    }

    fn uninstall(&self, label: &str) -> Result<(), DaemonError> {
        ensure_macos()?;

        let plist = launchd_plist_path(&self.home, label);
        if plist.exists() {
            let service = format!("{}/{label}", launchctl_domain()?);
            run_tool("launchctl", &["bootout", &service], true)?;
            fs::remove_file(&plist).map_err(|e| io_err(&plist, e))?;
        }
        Ok(())
    }
}

#[cfg(target_os = "macos")]
fn ensure_macos() -> Result<(), DaemonError> {
    Ok(())
}

#[cfg(not(target_os = "macos"))]
fn ensure_macos() -> Result<(), DaemonError> {
    Err(DaemonError::Service(
        "launchd management is only supported on macOS".to_string(),
    ))
}

fn launchctl_domain() -> Result<String, DaemonError> {
    let output = Command::new("id")
        .arg("-u")
        .output()
        .map_err(|e| io_err("id -u", e))?;
    if !output.status.success() {
        return Err(DaemonError::Service(format!(
            "failed to resolve current uid (status {})",
            output.status
        )));
    }

    let uid = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if uid.is_empty() {
        return Err(DaemonError::Service(
            "current uid from `id -u` was empty".to_string(),
        ));
    }
    Ok(format!("gui/{uid}"))
}
