//! Incremental archival engine.
//!
//! ## Per-file protocol
//!
//! 1. Classify: symlinks, oversized files and vanished sources are skipped.
//! 2. Record the size of every processable file in the [`BackupManifest`].
//! 3. No snapshot yet → copy (New).
//! 4. Snapshot differs → rename it into `archived/` first, then copy (Update).
//!    The copy never starts unless the old content is safely archived.
//! 5. Snapshot identical → nothing to do (Unchanged).
//! 6. Copies retry `copy_attempts` times, then fall back to the secondary
//!    destination when one is configured.
//! 7. Re-stat every landed snapshot against the manifest.
//!
//! One file's failure never aborts the batch. A cancellation flag is checked
//! between files.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use checkpoint_core::BackupConfig;
use checkpoint_detector::ChangeSet;

use crate::manifest::BackupManifest;

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

/// Machine-readable reason a file did not make it into the backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureCode {
    CopyFailed,
    ArchiveFailed,
    ArchiveCollision,
    SourceUnreadable,
    VerifyMissing,
    VerifySizeMismatch,
}

impl FailureCode {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureCode::CopyFailed => "COPY_FAILED",
            FailureCode::ArchiveFailed => "ARCHIVE_FAILED",
            FailureCode::ArchiveCollision => "ARCHIVE_COLLISION",
            FailureCode::SourceUnreadable => "SOURCE_UNREADABLE",
            FailureCode::VerifyMissing => "VERIFY_MISSING",
            FailureCode::VerifySizeMismatch => "VERIFY_SIZE_MISMATCH",
        }
    }

    /// What an operator should do about it.
    pub fn remediation(self) -> &'static str {
        match self {
            FailureCode::CopyFailed => {
                "check free space and write permissions on the backup destination"
            }
            FailureCode::ArchiveFailed => {
                "check permissions on the archived/ directory of the backup destination"
            }
            FailureCode::ArchiveCollision => {
                "two versions were archived in the same second; rerun the backup"
            }
            FailureCode::SourceUnreadable => "check read permissions on the source file",
            FailureCode::VerifyMissing => {
                "the snapshot vanished after copying; check the backup volume"
            }
            FailureCode::VerifySizeMismatch => {
                "the file changed while copying or the volume is failing; rerun the backup"
            }
        }
    }
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A file the run could not back up or verify.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFailure {
    pub path: PathBuf,
    pub code: FailureCode,
    pub detail: String,
    pub remediation: String,
}

impl FileFailure {
    pub fn new(path: &Path, code: FailureCode, detail: impl Into<String>) -> Self {
        Self {
            path: path.to_path_buf(),
            code,
            detail: detail.into(),
            remediation: code.remediation().to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Copier seam
// ---------------------------------------------------------------------------

/// Writes one source file to a destination path.
pub trait Copier: Send + Sync {
    fn copy(&self, src: &Path, dest: &Path) -> std::io::Result<u64>;
}

/// Suffix of in-flight copies; leftovers from killed runs are swept by
/// retention.
pub const COPY_TMP_SUFFIX: &str = ".checkpoint.tmp";

/// Copy into `<dest>.checkpoint.tmp` in the destination directory, then
/// rename over `dest`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsCopier;

impl Copier for FsCopier {
    fn copy(&self, src: &Path, dest: &Path) -> std::io::Result<u64> {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = PathBuf::from(format!("{}{COPY_TMP_SUFFIX}", dest.display()));
        let bytes = std::fs::copy(src, &tmp)?;
        if let Err(e) = std::fs::rename(&tmp, dest) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e);
        }
        Ok(bytes)
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// Three-way run outcome derived from succeeded / failed counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    Partial,
    TotalFailure,
}

/// Counters and failures of one archival pass.
#[derive(Debug, Clone)]
pub struct ArchiveReport {
    /// Files written to a live snapshot (primary or secondary).
    pub succeeded: usize,
    pub failed: usize,
    /// Previous snapshots moved into `archived/`.
    pub archived: usize,
    pub unchanged: usize,
    pub skipped: usize,
    /// Subset of `succeeded` that landed on the secondary destination.
    pub secondary_writes: usize,
    pub cancelled: bool,
    /// Files never reached because the run was cancelled.
    pub unprocessed: usize,
    pub failures: Vec<FileFailure>,
    pub manifest: BackupManifest,
}

impl ArchiveReport {
    fn new(manifest: BackupManifest) -> Self {
        Self {
            succeeded: 0,
            failed: 0,
            archived: 0,
            unchanged: 0,
            skipped: 0,
            secondary_writes: 0,
            cancelled: false,
            unprocessed: 0,
            failures: Vec::new(),
            manifest,
        }
    }

    /// Cancelled work counts against success: a run that stopped early is
    /// at best partial.
    pub fn outcome(&self) -> RunOutcome {
        if self.failed == 0 && self.unprocessed == 0 {
            RunOutcome::Success
        } else if self.failed > 0 && self.succeeded == 0 {
            RunOutcome::TotalFailure
        } else {
            RunOutcome::Partial
        }
    }

    fn fail(&mut self, failure: FileFailure) {
        tracing::warn!(
            "{}: {} ({})",
            failure.path.display(),
            failure.code,
            failure.detail
        );
        self.failed += 1;
        self.failures.push(failure);
    }
}

// ---------------------------------------------------------------------------
// Archiver
// ---------------------------------------------------------------------------

/// Where a processed file lives now, and whether this run wrote it.
struct Landing {
    dest: PathBuf,
    written: bool,
}

enum Plan {
    Process { size: u64 },
    Skip(&'static str),
    Unreadable(std::io::Error),
}

/// Runs the per-file protocol for one project.
pub struct Archiver<'a> {
    config: &'a BackupConfig,
    copier: Box<dyn Copier>,
    cancel: Arc<AtomicBool>,
}

impl<'a> Archiver<'a> {
    pub fn new(config: &'a BackupConfig) -> Self {
        Self {
            config,
            copier: Box::new(FsCopier),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_copier(mut self, copier: Box<dyn Copier>) -> Self {
        self.copier = copier;
        self
    }

    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Archive and copy every path in `changes`, then verify.
    pub fn run(&self, changes: &ChangeSet) -> ArchiveReport {
        let root = &self.config.project_root;
        let mut report = ArchiveReport::new(BackupManifest::new(self.config.project_name.clone()));

        // Capture phase: sizes of everything we intend to copy.
        let mut work = Vec::new();
        for rel in changes.iter() {
            match self.classify(&root.join(rel)) {
                Plan::Process { size } => {
                    report.manifest.record(rel, size);
                    work.push(rel.clone());
                }
                Plan::Skip(why) => {
                    tracing::debug!("skipped {}: {why}", rel.display());
                    report.skipped += 1;
                }
                Plan::Unreadable(e) => {
                    report.fail(FileFailure::new(rel, FailureCode::SourceUnreadable, e.to_string()))
                }
            }
        }

        // Copy phase.
        let mut landed = BTreeMap::new();
        let mut written = BTreeSet::new();
        for (done, rel) in work.iter().enumerate() {
            if self.cancel.load(Ordering::SeqCst) {
                tracing::info!("archival cancelled before {}", rel.display());
                report.cancelled = true;
                report.unprocessed = work.len() - done;
                break;
            }
            if let Some(landing) = self.process(rel, &mut report) {
                if landing.written {
                    written.insert(rel.clone());
                }
                landed.insert(rel.clone(), landing.dest);
            }
        }

        // Verify phase. Only files written by this run count as succeeded.
        for failure in report.manifest.verify(&landed) {
            if written.contains(&failure.path) {
                report.succeeded = report.succeeded.saturating_sub(1);
            }
            report.fail(failure);
        }
        report
    }

    fn classify(&self, src: &Path) -> Plan {
        let meta = match std::fs::symlink_metadata(src) {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => return Plan::Skip("source vanished"),
            Err(e) => return Plan::Unreadable(e),
        };
        if meta.file_type().is_symlink() {
            return Plan::Skip("symlink");
        }
        if !meta.is_file() {
            return Plan::Skip("not a regular file");
        }
        if let Some(ceiling) = self.config.archive.max_file_size_bytes {
            if meta.len() > ceiling {
                return Plan::Skip("larger than max_file_size_bytes");
            }
        }
        Plan::Process { size: meta.len() }
    }

    /// `Some` when the file is backed up after this call (written or already
    /// identical).
    fn process(&self, rel: &Path, report: &mut ArchiveReport) -> Option<Landing> {
        let src = self.config.project_root.join(rel);
        let snapshot = self.config.snapshot_root().join(rel);

        if snapshot.exists() {
            match files_differ(&src, &snapshot, self.config.archive.hash_compare) {
                Ok(false) => {
                    report.unchanged += 1;
                    return Some(Landing {
                        dest: snapshot,
                        written: false,
                    });
                }
                Ok(true) => {}
                Err(e) => {
                    report.fail(FileFailure::new(rel, FailureCode::SourceUnreadable, e.to_string()));
                    return None;
                }
            }
            match self.archive_existing(rel, &snapshot) {
                Ok(version) => {
                    tracing::debug!("archived {} -> {}", rel.display(), version.display());
                    report.archived += 1;
                }
                Err(failure) => {
                    report.fail(failure);
                    return None;
                }
            }
        }

        match self.copy_with_retry(&src, &snapshot) {
            Ok(()) => {
                report.succeeded += 1;
                return Some(Landing {
                    dest: snapshot,
                    written: true,
                });
            }
            Err(e) => tracing::warn!("copy of {} to primary failed: {e}", rel.display()),
        }

        let detail = match self.config.secondary_snapshot_root() {
            Some(secondary_root) => {
                let fallback = secondary_root.join(rel);
                match self.copy_with_retry(&src, &fallback) {
                    Ok(()) => {
                        tracing::warn!("{} written to secondary destination", rel.display());
                        report.succeeded += 1;
                        report.secondary_writes += 1;
                        return Some(Landing {
                            dest: fallback,
                            written: true,
                        });
                    }
                    Err(e) => format!("primary and secondary destinations failed: {e}"),
                }
            }
            None => format!("{} attempts failed", self.config.archive.copy_attempts),
        };
        report.fail(FileFailure::new(rel, FailureCode::CopyFailed, detail));
        None
    }

    /// Move the current snapshot to `archived/<rel>.<YYYYMMDD_HHMMSS>[_<pid>]`.
    fn archive_existing(&self, rel: &Path, snapshot: &Path) -> Result<PathBuf, FileFailure> {
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();
        let base = self.config.archive_root().join(rel);
        let Some(name) = base.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            return Err(FileFailure::new(rel, FailureCode::ArchiveFailed, "path has no file name"));
        };

        let candidates = [
            base.with_file_name(format!("{name}.{stamp}")),
            base.with_file_name(format!("{name}.{stamp}_{}", std::process::id())),
        ];
        let Some(version) = candidates.into_iter().find(|c| !self.version_exists(c)) else {
            return Err(FileFailure::new(
                rel,
                FailureCode::ArchiveCollision,
                format!("archive slot {name}.{stamp} is taken"),
            ));
        };

        if let Some(parent) = version.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                FileFailure::new(rel, FailureCode::ArchiveFailed, format!("{}: {e}", parent.display()))
            })?;
        }
        std::fs::rename(snapshot, &version)
            .map_err(|e| FileFailure::new(rel, FailureCode::ArchiveFailed, e.to_string()))?;
        Ok(version)
    }

    fn version_exists(&self, version: &Path) -> bool {
        if version.exists() {
            return true;
        }
        match &self.config.archive.encryption_suffix {
            Some(suffix) => PathBuf::from(format!("{}{suffix}", version.display())).exists(),
            None => false,
        }
    }

    fn copy_with_retry(&self, src: &Path, dest: &Path) -> std::io::Result<()> {
        let attempts = self.config.archive.copy_attempts.max(1);
        let delay = Duration::from_millis(self.config.archive.retry_delay_ms);
        let mut last = None;
        for attempt in 1..=attempts {
            match self.copier.copy(src, dest) {
                Ok(_) => return Ok(()),
                Err(e) => {
                    tracing::debug!(
                        "copy {} attempt {attempt}/{attempts} failed: {e}",
                        src.display()
                    );
                    last = Some(e);
                }
            }
            if attempt < attempts && !delay.is_zero() {
                std::thread::sleep(delay);
            }
        }
        Err(last.unwrap_or_else(|| std::io::Error::other("no copy attempted")))
    }
}

// ---------------------------------------------------------------------------
// Comparison
// ---------------------------------------------------------------------------

/// Whether `a` and `b` hold different content. A size mismatch short-circuits.
pub fn files_differ(a: &Path, b: &Path, hash_compare: bool) -> std::io::Result<bool> {
    if std::fs::metadata(a)?.len() != std::fs::metadata(b)?.len() {
        return Ok(true);
    }
    if hash_compare {
        return Ok(sha256_file(a)? != sha256_file(b)?);
    }
    bytes_differ(a, b)
}

/// Hex SHA-256 of a file's content.
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

fn bytes_differ(a: &Path, b: &Path) -> std::io::Result<bool> {
    let mut ra = BufReader::new(File::open(a)?);
    let mut rb = BufReader::new(File::open(b)?);
    let mut buf_a = [0u8; 8192];
    let mut buf_b = [0u8; 8192];
    loop {
        let n = ra.read(&mut buf_a)?;
        if n == 0 {
            let mut extra = [0u8; 1];
            return Ok(rb.read(&mut extra)? != 0);
        }
        rb.read_exact(&mut buf_b[..n]).map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                std::io::Error::new(ErrorKind::UnexpectedEof, "file shrank while comparing")
            } else {
                e
            }
        })?;
        if buf_a[..n] != buf_b[..n] {
            return Ok(true);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
