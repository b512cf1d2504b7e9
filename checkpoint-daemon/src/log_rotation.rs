//! Size-based rotation for the daemon and watchdog logs under
//! `~/.checkpoint/logs/`.
//!
//! A log over 10 MiB is shifted down a numbered chain capped at 5 copies:
//!   watchdog.log → watchdog.log.1 → … → watchdog.log.5

use std::fs;
use std::io;
use std::path::Path;

/// Maximum log file size before rotation (10 MiB).
pub const MAX_LOG_BYTES: u64 = 10 * 1024 * 1024;

/// Maximum number of rotated backup files to keep.
pub const MAX_ROTATED_FILES: usize = 5;

/// Rotate `log_path` once it reaches `max_bytes`. Returns `true` when a
/// rotation happened; a missing log is not an error.
///
/// The live file is recreated empty so launchd/systemd keep a writable
/// target.
pub fn rotate_if_needed(
    log_path: &Path,
    max_bytes: u64,
    max_files: usize,
) -> io::Result<bool> {
    let size = match fs::metadata(log_path) {
        Ok(meta) => meta.len(),
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err),
    };

    if size < max_bytes {
        return Ok(false);
    }

    let oldest = numbered_path(log_path, max_files);
    if oldest.exists() {
        fs::remove_file(&oldest)?;
    }

    for n in (1..max_files).rev() {
        let src = numbered_path(log_path, n);
        let dst = numbered_path(log_path, n + 1);
        if src.exists() {
            fs::rename(&src, &dst)?;
        }
    }

    fs::rename(log_path, numbered_path(log_path, 1))?;

    let _ = fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(log_path)?;

    Ok(true)
}

/// Rotate every daemon and watchdog log under `home`. A failure on one file
/// is logged and the rest are still checked.
pub fn rotate_logs(home: &Path) -> usize {
    let mut rotated = 0;
    for log_path in crate::paths::log_files(home) {
        match rotate_if_needed(&log_path, MAX_LOG_BYTES, MAX_ROTATED_FILES) {
            Ok(true) => {
                tracing::info!(path = %log_path.display(), "log file rotated");
                rotated += 1;
            }
            Ok(false) => {}
            Err(err) => tracing::warn!(path = %log_path.display(), error = %err, "log rotation failed"),
        }
    }
    rotated
}

/// `daemon.log` → `daemon.log.<n>`.
fn numbered_path(base: &Path, n: usize) -> std::path::PathBuf {
    let name = base
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("daemon.log");
    base.with_file_name(format!("{name}.{n}"))
}
