//! `checkpoint status`: daemon health and per-project backup state.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use checkpoint_core::{config, BackupConfig, WatchdogSettings};
use checkpoint_daemon::watchdog::{self, WatchdogStatus, WatchdogStatusFile};
use checkpoint_engine::heartbeat::{self, Heartbeat, HeartbeatStatus};
use checkpoint_engine::{lock, manifest, retention};

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Serialize)]
struct StatusJson {
    heartbeat: Option<HeartbeatJson>,
    watchdog: Option<WatchdogStatusFile>,
    projects: Vec<ProjectStatus>,
}

#[derive(Serialize)]
struct HeartbeatJson {
    #[serde(flatten)]
    heartbeat: Heartbeat,
    age_secs: u64,
    stale: bool,
}

#[derive(Debug, Serialize)]
struct ProjectStatus {
    project: String,
    project_root: String,
    root_exists: bool,
    backup_dir: String,
    /// PID of the run holding the lock, if any.
    running_pid: Option<u32>,
    last_backup_at: Option<String>,
    last_backup_age_secs: Option<u64>,
    last_backup_files: Option<usize>,
    last_cleanup_at: Option<String>,
}

#[derive(Tabled)]
struct ProjectRow {
    #[tabled(rename = "project")]
    project: String,
    #[tabled(rename = "state")]
    state: String,
    #[tabled(rename = "last backup")]
    last_backup: String,
    #[tabled(rename = "files")]
    files: String,
    #[tabled(rename = "last cleanup")]
    last_cleanup: String,
}

impl StatusArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home_dir()?;
        let configs = config::list_at(&home).context("failed to load project configs")?;
        let stale_after = config::load_watchdog_settings_at(&home)
            .unwrap_or_else(|_| WatchdogSettings::default())
            .stale_after_secs;

        let now = Utc::now().timestamp();
        let heartbeat = heartbeat::read_at(&home)
            .context("failed to read heartbeat")?
            .map(|hb| HeartbeatJson {
                age_secs: hb.age_secs(now),
                stale: hb.is_stale(now, stale_after),
                heartbeat: hb,
            });
        let watchdog = watchdog::read_status_at(&home).context("failed to read watchdog status")?;
        let projects = configs.iter().map(|c| project_status(&home, c, now)).collect();

        let report = StatusJson {
            heartbeat,
            watchdog,
            projects,
        };
        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("failed to serialize status JSON")?
            );
        } else {
            print_report(report);
        }
        Ok(())
    }
}

fn project_status(home: &Path, config: &BackupConfig, now: i64) -> ProjectStatus {
    let latest = match manifest::load_latest(&config.manifest_root()) {
        Ok(latest) => latest,
        Err(e) => {
            tracing::warn!(project = %config.project_name, error = %e, "unreadable manifest");
            None
        }
    };

    ProjectStatus {
        project: config.project_name.to_string(),
        project_root: config.project_root.display().to_string(),
        root_exists: config.project_root.is_dir(),
        backup_dir: config.backup_dir.display().to_string(),
        running_pid: lock::current_holder_at(home, &config.project_name),
        last_backup_at: latest.as_ref().map(|m| m.captured_at.to_rfc3339()),
        last_backup_age_secs: latest
            .as_ref()
            .map(|m| u64::try_from(now - m.captured_at.timestamp()).unwrap_or(0)),
        last_backup_files: latest.as_ref().map(|m| m.len()),
        last_cleanup_at: retention::last_cleanup_at(home, &config.project_name)
            .map(|t| t.to_rfc3339()),
    }
}

fn print_report(report: StatusJson) {
    let daemon = match &report.heartbeat {
        None => "no heartbeat".bright_black().to_string(),
        Some(hb) if hb.stale => format!("{} ({})", "STALE".red().bold(), super::format_age(hb.age_secs)),
        Some(hb) => format!(
            "{} ({})",
            heartbeat_label(hb.heartbeat.status),
            super::format_age(hb.age_secs)
        ),
    };
    let watchdog = match &report.watchdog {
        None => "not running".bright_black().to_string(),
        Some(w) => watchdog_label(w.status),
    };
    println!(
        "Checkpoint v{} | {} projects | daemon: {daemon} | watchdog: {watchdog}",
        env!("CARGO_PKG_VERSION"),
        report.projects.len(),
    );

    if let Some(error) = report.heartbeat.as_ref().and_then(|hb| hb.heartbeat.error.as_deref()) {
        println!("  last error: {}", error.red());
    }

    if report.projects.is_empty() {
        println!("No projects registered. Run `checkpoint init <path>` first.");
        return;
    }

    let rows: Vec<ProjectRow> = report
        .projects
        .into_iter()
        .map(|p| ProjectRow {
            state: match (p.running_pid, p.root_exists) {
                (Some(pid), _) => format!("running (pid {pid})"),
                (None, false) => "root missing".to_string(),
                (None, true) => "idle".to_string(),
            },
            last_backup: p
                .last_backup_age_secs
                .map_or_else(|| "never".to_string(), super::format_age),
            files: p
                .last_backup_files
                .map_or_else(|| "-".to_string(), |n| n.to_string()),
            last_cleanup: p.last_cleanup_at.unwrap_or_else(|| "never".to_string()),
            project: p.project,
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
}

fn heartbeat_label(status: HeartbeatStatus) -> String {
    match status {
        HeartbeatStatus::Healthy => "healthy".green().bold().to_string(),
        HeartbeatStatus::Syncing => "syncing".cyan().bold().to_string(),
        HeartbeatStatus::Error => "error".red().bold().to_string(),
        HeartbeatStatus::Stopped => "stopped".yellow().bold().to_string(),
    }
}

pub(crate) fn watchdog_label(status: WatchdogStatus) -> String {
    match status {
        WatchdogStatus::Healthy => "healthy".green().to_string(),
        WatchdogStatus::Warning => "warning".yellow().to_string(),
        WatchdogStatus::Error => "error".red().to_string(),
        WatchdogStatus::NoDaemons => "no daemons".bright_black().to_string(),
        WatchdogStatus::Unknown => "unknown".bright_black().to_string(),
    }
}
