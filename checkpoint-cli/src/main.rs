//! Checkpoint: local backup orchestration.
//!
//! # Usage
//!
//! ```text
//! checkpoint init <path> [--name <project>] [--backup-dir <dir>]
//! checkpoint run <project> [--cleanup] [--json]
//! checkpoint cleanup <project> [--dry-run] [--json]
//! checkpoint status [--json]
//! checkpoint watchdog [--once [--json]]
//! checkpoint daemon start [project] | install [--no-watchdog] | uninstall | logs
//! ```
//!
//! `run` exits 0 on success, 1 on partial failure, 2 on total failure and 3
//! when another run holds the project lock.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    cleanup::CleanupArgs, daemon::DaemonCommand, init::InitArgs, run::RunArgs,
    status::StatusArgs, watchdog::WatchdogArgs,
};

#[derive(Parser, Debug)]
#[command(
    name = "checkpoint",
    version,
    about = "Incremental local backups with locking, retention and a self-healing daemon",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register a project for backups.
    Init(InitArgs),

    /// Run one backup cycle for a project.
    Run(RunArgs),

    /// Apply the retention policy to a project's backups.
    Cleanup(CleanupArgs),

    /// Show daemon health and per-project backup state.
    Status(StatusArgs),

    /// Poll the daemon heartbeat and restart stuck daemons.
    Watchdog(WatchdogArgs),

    /// Run or manage the background backup daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

/// One-shot commands log warnings to stderr so stdout stays parseable.
fn init_cli_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Init(args) => {
            init_cli_tracing();
            args.run().map(|()| 0)?
        }
        Commands::Run(args) => {
            init_cli_tracing();
            args.run()?
        }
        Commands::Cleanup(args) => {
            init_cli_tracing();
            args.run()?
        }
        Commands::Status(args) => {
            init_cli_tracing();
            args.run().map(|()| 0)?
        }
        Commands::Watchdog(args) => {
            if args.once {
                init_cli_tracing();
            }
            args.run()?
        }
        Commands::Daemon { command } => {
            if !matches!(command, DaemonCommand::Start { .. }) {
                init_cli_tracing();
            }
            commands::daemon::run(command).map(|()| 0)?
        }
    };
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
