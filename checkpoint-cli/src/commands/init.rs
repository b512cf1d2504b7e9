//! `checkpoint init <path> [--name <project>] [--backup-dir <dir>]`

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use checkpoint_core::{config, paths, ProjectName};

/// Register a project for backups.
#[derive(Args, Debug)]
pub struct InitArgs {
    /// Root directory of the project to back up.
    pub path: PathBuf,

    /// Project name; defaults to the directory name.
    #[arg(long, short = 'n')]
    pub name: Option<String>,

    /// Backup destination; defaults to ~/.checkpoint/backups/<project>.
    #[arg(long)]
    pub backup_dir: Option<PathBuf>,
}

impl InitArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home_dir()?;
        let path = self
            .path
            .canonicalize()
            .with_context(|| format!("cannot resolve path '{}'", self.path.display()))?;

        let config = config::init_at(
            &home,
            path.clone(),
            self.name.map(ProjectName::from),
            self.backup_dir,
        )
        .with_context(|| format!("failed to init '{}'", path.display()))?;

        println!("✓ Registered '{}'", config.project_name);
        println!("  Root:    {}", config.project_root.display());
        println!("  Backups: {}", config.backup_dir.display());
        println!(
            "  Config:  {}",
            paths::config_path(&home, config.project_name.as_str()).display()
        );
        Ok(())
    }
}
