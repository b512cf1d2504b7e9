//! `checkpoint daemon`: foreground runtime and service installation.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};

use checkpoint_core::ProjectName;
use checkpoint_daemon::paths::{self, DAEMON_LABEL, WATCHDOG_LABEL};
use checkpoint_daemon::{detect_manager, start_blocking, ServiceSpec};

#[derive(Subcommand, Debug)]
pub enum DaemonCommand {
    /// Run the daemon in the foreground.
    Start {
        /// Serve only this project instead of every registered one.
        project: Option<String>,
    },
    /// Install and start the daemon and watchdog as user services.
    Install {
        /// Skip the watchdog service.
        #[arg(long)]
        no_watchdog: bool,
    },
    /// Stop and remove the daemon and watchdog services.
    Uninstall,
    /// Print recent daemon and watchdog log lines.
    Logs(DaemonLogsArgs),
}

#[derive(Args, Debug)]
pub struct DaemonLogsArgs {
    /// Number of trailing lines to show.
    #[arg(long, default_value_t = 100)]
    pub lines: usize,

    /// Show only the stderr logs.
    #[arg(long)]
    pub stderr_only: bool,
}

pub fn run(command: DaemonCommand) -> Result<()> {
    let home = super::home_dir()?;

    match command {
        DaemonCommand::Start { project } => {
            let project = project.map(ProjectName::from);
            start_blocking(&home, project.as_ref()).context("daemon exited with error")?;
        }
        DaemonCommand::Install { no_watchdog } => {
            let manager = detect_manager(&home);
            let binary = std::env::current_exe().context("cannot locate the checkpoint binary")?;

            let path = manager
                .install(&ServiceSpec::backup_daemon(&home, &binary))
                .with_context(|| format!("failed to install {} service", manager.name()))?;
            println!("installed {} service: {}", manager.name(), path.display());

            if !no_watchdog {
                let path = manager
                    .install(&ServiceSpec::watchdog(&home, &binary))
                    .with_context(|| format!("failed to install {} watchdog", manager.name()))?;
                println!("installed {} watchdog: {}", manager.name(), path.display());
            }
        }
        DaemonCommand::Uninstall => {
            let manager = detect_manager(&home);
            for label in [WATCHDOG_LABEL, DAEMON_LABEL] {
                manager
                    .uninstall(label)
                    .with_context(|| format!("failed to uninstall {label}"))?;
            }
            println!("uninstalled {} services", manager.name());
        }
        DaemonCommand::Logs(args) => {
            let logs = paths::logs_dir(&home);
            let names: &[&str] = if args.stderr_only {
                &[paths::DAEMON_STDERR_LOG, paths::WATCHDOG_STDERR_LOG]
            } else {
                &[
                    paths::DAEMON_STDOUT_LOG,
                    paths::DAEMON_STDERR_LOG,
                    paths::WATCHDOG_STDOUT_LOG,
                    paths::WATCHDOG_STDERR_LOG,
                ]
            };
            for name in names {
                print_tail(&logs.join(name), args.lines)?;
            }
        }
    }

    Ok(())
}

fn print_tail(path: &Path, lines: usize) -> Result<()> {
    if !path.exists() {
        println!("log file not found: {}", path.display());
        return Ok(());
    }

    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut tail = VecDeque::<String>::with_capacity(lines);
    for line in reader.lines() {
        let line = line.with_context(|| format!("read {}", path.display()))?;
        if lines == 0 {
            continue;
        }
        if tail.len() == lines {
            tail.pop_front();
        }
        tail.push_back(line);
    }

    println!("==> {} <==", path.display());
    for line in tail {
        println!("{line}");
    }
    Ok(())
}
