pub mod cleanup;
pub mod daemon;
pub mod init;
pub mod run;
pub mod status;
pub mod watchdog;

use std::path::PathBuf;

use anyhow::{Context, Result};

use checkpoint_core::{config, BackupConfig, ProjectName};

pub(crate) fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().context("could not determine home directory")
}

pub(crate) fn load_project(home: &std::path::Path, name: &str) -> Result<BackupConfig> {
    config::load_at(home, &ProjectName::from(name))
        .with_context(|| format!("cannot load project '{name}'; run `checkpoint init` first"))
}

/// "42s ago", "5m ago", "3h ago", "2d ago".
pub(crate) fn format_age(secs: u64) -> String {
    match secs {
        0..=59 => format!("{secs}s ago"),
        60..=3_599 => format!("{}m ago", secs / 60),
        3_600..=86_399 => format!("{}h ago", secs / 3_600),
        _ => format!("{}d ago", secs / 86_400),
    }
}

pub(crate) fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ages_pick_the_largest_whole_unit() {
        assert_eq!(format_age(5), "5s ago");
        assert_eq!(format_age(600), "10m ago");
        assert_eq!(format_age(7_200), "2h ago");
        assert_eq!(format_age(3 * 86_400 + 5), "3d ago");
    }

    #[test]
    fn bytes_are_humanized() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(10 * 1024 * 1024), "10.0 MiB");
    }
}
