//! `checkpoint run <project>`: one backup cycle, exit code per outcome.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde::Serialize;

use checkpoint_engine::{BackupCycle, CycleReport, CycleStatus, FailureCode};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Registered project name.
    pub project: String,

    /// Run retention now instead of waiting for the cleanup interval.
    #[arg(long)]
    pub cleanup: bool,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Serialize)]
struct RunJson<'a> {
    project: &'a str,
    status: CycleStatus,
    exit_code: i32,
    detector: &'a str,
    changes: usize,
    succeeded: usize,
    failed: usize,
    archived: usize,
    unchanged: usize,
    skipped: usize,
    holder_pid: Option<u32>,
    manifest: Option<String>,
    failures: Vec<FailureJson<'a>>,
}

#[derive(Serialize)]
struct RunErrorJson<'a> {
    project: &'a str,
    status: CycleStatus,
    exit_code: i32,
    error: String,
}

#[derive(Serialize)]
struct FailureJson<'a> {
    path: String,
    code: FailureCode,
    detail: &'a str,
    remediation: &'a str,
}

impl RunArgs {
    /// Returns the process exit code.
    pub fn run(self) -> Result<i32> {
        let home = super::home_dir()?;
        let config = super::load_project(&home, &self.project)?;

        let report = match BackupCycle::new(&home, &config)
            .force_cleanup(self.cleanup)
            .run()
        {
            Ok(report) => report,
            Err(e) => {
                let status = CycleStatus::TotalFailure;
                if self.json {
                    let payload = RunErrorJson {
                        project: &self.project,
                        status,
                        exit_code: status.exit_code(),
                        error: e.to_string(),
                    };
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&payload)
                            .context("failed to serialize run JSON")?
                    );
                }
                eprintln!("{} backup of '{}' failed: {e}", "✗".red(), self.project);
                return Ok(status.exit_code());
            }
        };

        if self.json {
            print_json(&self.project, &report)?;
        } else {
            print_summary(&self.project, &report);
        }
        Ok(report.status.exit_code())
    }
}

fn print_json(project: &str, report: &CycleReport) -> Result<()> {
    let archive = report.archive.as_ref();
    let payload = RunJson {
        project,
        status: report.status,
        exit_code: report.status.exit_code(),
        detector: report.detector,
        changes: report.changes,
        succeeded: archive.map_or(0, |a| a.succeeded),
        failed: archive.map_or(0, |a| a.failed),
        archived: archive.map_or(0, |a| a.archived),
        unchanged: archive.map_or(0, |a| a.unchanged),
        skipped: archive.map_or(0, |a| a.skipped),
        holder_pid: report.holder_pid,
        manifest: report.manifest_path.as_ref().map(|p| p.display().to_string()),
        failures: archive
            .map(|a| {
                a.failures
                    .iter()
                    .map(|f| FailureJson {
                        path: f.path.display().to_string(),
                        code: f.code,
                        detail: &f.detail,
                        remediation: &f.remediation,
                    })
                    .collect()
            })
            .unwrap_or_default(),
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&payload).context("failed to serialize run JSON")?
    );
    Ok(())
}

fn print_summary(project: &str, report: &CycleReport) {
    let Some(archive) = report.archive.as_ref() else {
        let holder = report
            .holder_pid
            .map_or_else(|| "unknown pid".to_string(), |pid| format!("pid {pid}"));
        println!("{} '{project}' skipped: backup already running ({holder})", "·".yellow());
        return;
    };

    let mark = match report.status {
        CycleStatus::Success => "✓".green(),
        CycleStatus::Partial => "!".yellow(),
        CycleStatus::TotalFailure | CycleStatus::LockContention => "✗".red(),
    };
    println!(
        "{mark} '{project}': {} change(s) via {}, {} saved, {} archived, {} unchanged, {} failed",
        report.changes,
        report.detector,
        archive.succeeded,
        archive.archived,
        archive.unchanged,
        archive.failed,
    );
    if archive.secondary_writes > 0 {
        println!("  {} file(s) written to the secondary destination", archive.secondary_writes);
    }
    for failure in &archive.failures {
        println!(
            "  {} {} {}: {}",
            "✗".red(),
            failure.code,
            failure.path.display(),
            failure.detail
        );
        println!("      {}", failure.remediation.bright_black());
    }
    if let Some(cleanup) = &report.cleanup {
        println!(
            "  cleanup: {} deleted, {} freed",
            cleanup.deleted_count,
            super::format_bytes(cleanup.bytes_freed)
        );
    }
}
