//! `checkpoint watchdog [--once]`

use anyhow::{Context, Result};
use clap::Args;

use checkpoint_daemon::watchdog::{self, WatchdogStatus};

#[derive(Args, Debug)]
pub struct WatchdogArgs {
    /// Run a single poll and exit.
    #[arg(long)]
    pub once: bool,

    /// With `--once`, emit the poll result as JSON.
    #[arg(long, requires = "once")]
    pub json: bool,
}

impl WatchdogArgs {
    /// Returns the process exit code. A single poll exits 1 unless the
    /// daemon is healthy or none is installed.
    pub fn run(self) -> Result<i32> {
        let home = super::home_dir()?;
        if !self.once {
            checkpoint_daemon::init_tracing();
        }

        let Some(report) = watchdog::start_blocking(&home, self.once).context("watchdog failed")? else {
            return Ok(0);
        };

        if self.json {
            let status = watchdog::read_status_at(&home)
                .context("failed to read watchdog status")?
                .context("watchdog status file missing after poll")?;
            println!(
                "{}",
                serde_json::to_string_pretty(&status).context("failed to serialize watchdog JSON")?
            );
        } else {
            println!(
                "watchdog: {} ({} daemon(s), {} restarted)",
                super::status::watchdog_label(report.status),
                report.daemon_count,
                report.restarted
            );
        }

        Ok(match report.status {
            WatchdogStatus::Healthy | WatchdogStatus::NoDaemons => 0,
            _ => 1,
        })
    }
}
