//! Backup manifest: expected sizes captured before the copy phase.
//!
//! The manifest drives post-copy verification for the run that built it and
//! is then persisted as a JSON audit record:
//!
//! ```text
//! <backup_dir>/manifests/
//!   manifest-<YYYYMMDD_HHMMSS>.json
//!   latest.json
//! ```
//!
//! Writes use the same atomic `.tmp` + rename pattern as the config files.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use checkpoint_core::ProjectName;

use crate::archive::{FailureCode, FileFailure};
use crate::error::{io_err, EngineError};

pub const LATEST_MANIFEST: &str = "latest.json";

/// One processable file and its size at capture time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: PathBuf,
    pub size: u64,
}

/// On-disk manifest payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub captured_at: DateTime<Utc>,
    pub project: ProjectName,
    pub files: Vec<ManifestEntry>,
}

impl BackupManifest {
    pub fn new(project: ProjectName) -> Self {
        Self {
            captured_at: Utc::now(),
            project,
            files: Vec::new(),
        }
    }

    pub fn record(&mut self, rel: &Path, size: u64) {
        self.files.push(ManifestEntry {
            path: rel.to_path_buf(),
            size,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Re-stat every file that landed and compare with the captured size.
    ///
    /// `landed` maps relative paths to the live snapshot they were written to
    /// (primary or secondary). Entries that never landed are not checked; the
    /// archival engine has already recorded why.
    pub fn verify(&self, landed: &BTreeMap<PathBuf, PathBuf>) -> Vec<FileFailure> {
        let mut failures = Vec::new();
        for entry in &self.files {
            let Some(dest) = landed.get(&entry.path) else {
                continue;
            };
            match std::fs::metadata(dest) {
                Ok(meta) if meta.len() == entry.size => {}
                Ok(meta) => failures.push(FileFailure::new(
                    &entry.path,
                    FailureCode::VerifySizeMismatch,
                    format!("expected {} bytes, found {}", entry.size, meta.len()),
                )),
                Err(e) => failures.push(FileFailure::new(
                    &entry.path,
                    FailureCode::VerifyMissing,
                    format!("{}: {e}", dest.display()),
                )),
            }
        }
        failures
    }
}

/// Persist `manifest` under `manifest_root` and update `latest.json`.
///
/// Returns the path of the timestamped manifest.
pub fn persist(manifest_root: &Path, manifest: &BackupManifest) -> Result<PathBuf, EngineError> {
    std::fs::create_dir_all(manifest_root).map_err(|e| io_err(manifest_root, e))?;
    let json = serde_json::to_string_pretty(manifest)?;

    let stamp = manifest
        .captured_at
        .with_timezone(&chrono::Local)
        .format("%Y%m%d_%H%M%S");
    let path = manifest_root.join(format!("manifest-{stamp}.json"));
    write_atomic(&path, &json)?;
    write_atomic(&manifest_root.join(LATEST_MANIFEST), &json)?;
    Ok(path)
}

/// Load `latest.json`, or `None` if no manifest has been persisted yet.
pub fn load_latest(manifest_root: &Path) -> Result<Option<BackupManifest>, EngineError> {
    let path = manifest_root.join(LATEST_MANIFEST);
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
    Ok(Some(serde_json::from_str(&contents)?))
}

fn write_atomic(path: &Path, contents: &str) -> Result<(), EngineError> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, contents).map_err(|e| io_err(&tmp, e))?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(io_err(path, e));
    }
    Ok(())
}
