//! `checkpoint cleanup <project> [--dry-run] [--json]`

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Args;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use checkpoint_engine::retention::{self, CleanupPlan, CleanupReport};
use checkpoint_engine::{AcquireOutcome, BackupLock, CycleStatus};

#[derive(Args, Debug)]
pub struct CleanupArgs {
    /// Registered project name.
    pub project: String,

    /// Report what would be deleted without deleting anything.
    #[arg(long)]
    pub dry_run: bool,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Serialize)]
struct CleanupJson<'a> {
    project: &'a str,
    plan: &'a CleanupPlan,
    report: &'a CleanupReport,
}

#[derive(Serialize)]
struct ContentionJson<'a> {
    project: &'a str,
    status: CycleStatus,
    holder_pid: Option<u32>,
}

#[derive(Tabled)]
struct CandidateRow {
    #[tabled(rename = "category")]
    category: String,
    #[tabled(rename = "reason")]
    reason: String,
    #[tabled(rename = "size")]
    size: String,
    #[tabled(rename = "path")]
    path: String,
}

impl CleanupArgs {
    /// Returns the process exit code: 1 when any deletion failed, 3 when a
    /// backup holds the project lock.
    pub fn run(self) -> Result<i32> {
        let home = super::home_dir()?;
        let config = super::load_project(&home, &self.project)?;

        // Deleting races with a backup archiving into the same tree.
        let lock = if self.dry_run {
            None
        } else {
            match BackupLock::acquire_at(&home, &config.project_name)
                .with_context(|| format!("cannot lock '{}'", self.project))?
            {
                AcquireOutcome::Acquired(lock) => Some(lock),
                AcquireOutcome::Held { holder_pid } => {
                    return self.report_contention(holder_pid);
                }
            }
        };

        let plan = retention::plan_cleanup(&config)
            .with_context(|| format!("cleanup planning failed for '{}'", self.project))?;
        let report = retention::execute_cleanup(&plan, self.dry_run);
        if !self.dry_run {
            retention::mark_cleanup_at(&home, &config.project_name, Utc::now())
                .context("failed to record cleanup time")?;
        }

        if self.json {
            let payload = CleanupJson {
                project: &self.project,
                plan: &plan,
                report: &report,
            };
            println!(
                "{}",
                serde_json::to_string_pretty(&payload).context("failed to serialize cleanup JSON")?
            );
        } else {
            print_table(&self.project, &plan, &report);
        }
        drop(lock);

        Ok(if report.failures.is_empty() { 0 } else { 1 })
    }

    fn report_contention(&self, holder_pid: Option<u32>) -> Result<i32> {
        let status = CycleStatus::LockContention;
        if self.json {
            let payload = ContentionJson {
                project: &self.project,
                status,
                holder_pid,
            };
            println!(
                "{}",
                serde_json::to_string_pretty(&payload).context("failed to serialize cleanup JSON")?
            );
        } else {
            let holder =
                holder_pid.map_or_else(|| "unknown pid".to_string(), |pid| format!("pid {pid}"));
            println!("· '{}' skipped: backup running ({holder})", self.project);
        }
        Ok(status.exit_code())
    }
}

fn print_table(project: &str, plan: &CleanupPlan, report: &CleanupReport) {
    let prefix = if report.dry_run { "[dry-run] " } else { "" };
    if plan.is_empty() {
        println!("{prefix}✓ '{project}': nothing to clean up");
        return;
    }

    let rows: Vec<CandidateRow> = plan
        .candidates()
        .map(|c| CandidateRow {
            category: c.category.to_string(),
            reason: format!("{:?}", c.reason).to_lowercase(),
            size: super::format_bytes(c.size_bytes),
            path: c.path.display().to_string(),
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");

    let verb = if report.dry_run { "would delete" } else { "deleted" };
    println!(
        "{prefix}'{project}': {verb} {} file(s), {} freed, {} empty dir(s)",
        report.deleted_count,
        super::format_bytes(report.bytes_freed),
        report.dirs_removed,
    );
    for failure in &report.failures {
        println!("  ✗ {}: {}", failure.path.display(), failure.message);
    }
}
