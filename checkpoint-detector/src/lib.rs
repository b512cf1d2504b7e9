//! Change detection for `checkpoint-detector`.
//!
//! A [`ChangeDetector`] computes the relative paths modified since the previous
//! run. Two strategies exist and one is picked per project by
//! [`select_detector`]:
//!
//! - [`GitChangeDetector`]: modified, staged and untracked-but-not-ignored
//!   paths reported by `git`.
//! - [`MtimeFallbackDetector`]: files modified inside the backup interval,
//!   skipping build and dependency directories.
//!
//! [`detect_changes`] runs the selected strategy, unions in the always-include
//! classes (env files, credentials, IDE settings, local notes, local
//! databases) and returns a sorted, deduplicated [`ChangeSet`].

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, SystemTime};

use checkpoint_core::DetectionSettings;
use thiserror::Error;
use walkdir::WalkDir;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Directory names never descended into by the mtime and always-include scans.
pub const DEFAULT_EXCLUDED_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "target",
    "build",
    "dist",
    "vendor",
    ".venv",
    "venv",
    "__pycache__",
    ".next",
    ".cache",
    "coverage",
];

/// Sorted, deduplicated relative paths judged changed since the last run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    paths: BTreeSet<PathBuf>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<PathBuf>) -> bool {
        self.paths.insert(path.into())
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.paths.contains(path)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Paths in deterministic (lexicographic) order.
    pub fn iter(&self) -> impl Iterator<Item = &PathBuf> {
        self.paths.iter()
    }
}

impl FromIterator<PathBuf> for ChangeSet {
    fn from_iter<I: IntoIterator<Item = PathBuf>>(iter: I) -> Self {
        Self {
            paths: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for ChangeSet {
    type Item = PathBuf;
    type IntoIter = std::collections::btree_set::IntoIter<PathBuf>;

    fn into_iter(self) -> Self::IntoIter {
        self.paths.into_iter()
    }
}

/// Classes of files backed up on every run regardless of the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncludeClass {
    EnvFile,
    Credentials,
    IdeSettings,
    LocalNotes,
    LocalDatabase,
}

/// Errors from change detection.
#[derive(Debug, Error)]
pub enum DetectError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("git {args} failed in {root}: {message}")]
    Git {
        root: PathBuf,
        args: String,
        message: String,
    },

    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("project root does not exist: {path}")]
    MissingRoot { path: PathBuf },
}

/// Strategy interface for computing changed paths relative to a project root.
pub trait ChangeDetector: Send + Sync {
    /// Short name for logs (`"git"`, `"mtime"`).
    fn name(&self) -> &'static str;

    /// Relative paths considered modified. May include deleted paths; callers
    /// filter on existence.
    fn detect(&self, root: &Path) -> Result<BTreeSet<PathBuf>, DetectError>;
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Pick the detection strategy for `root` once, at startup.
///
/// `excluded_roots` are absolute directories (typically the backup directory)
/// that must never be reported even if they live inside the project.
pub fn select_detector(
    root: &Path,
    settings: &DetectionSettings,
    excluded_roots: &[PathBuf],
) -> Box<dyn ChangeDetector> {
    if is_git_work_tree(root) {
        Box::new(GitChangeDetector)
    } else {
        Box::new(MtimeFallbackDetector::from_settings(settings, excluded_roots))
    }
}

/// Run `detector`, union in always-include files and return the change set.
///
/// Only paths that currently exist (regular files or symlinks) are kept, so
/// deletions reported by git never reach the archival engine.
pub fn detect_changes(
    root: &Path,
    settings: &DetectionSettings,
    detector: &dyn ChangeDetector,
    excluded_roots: &[PathBuf],
) -> Result<ChangeSet, DetectError> {
    if !root.is_dir() {
        return Err(DetectError::MissingRoot {
            path: root.to_path_buf(),
        });
    }

    let mut candidates = detector.detect(root)?;
    candidates.extend(always_include(
        root,
        settings.always_include_depth,
        &excluded_dir_names(settings),
        excluded_roots,
    )?);

    Ok(candidates
        .into_iter()
        .filter(|rel| !is_under_any(&root.join(rel), excluded_roots))
        .filter(|rel| {
            std::fs::symlink_metadata(root.join(rel))
                .map(|meta| !meta.is_dir())
                .unwrap_or(false)
        })
        .collect())
}

/// Classify `rel` against the always-include classes.
pub fn include_class(rel: &Path) -> Option<IncludeClass> {
    let name = rel.file_name()?.to_str()?;
    let lower = name.to_ascii_lowercase();
    let ext = rel
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    if lower == ".env" || lower.starts_with(".env.") || lower.ends_with(".env") {
        return Some(IncludeClass::EnvFile);
    }
    if matches!(
        lower.as_str(),
        "credentials.json"
            | "service-account.json"
            | "secrets.json"
            | "secrets.yaml"
            | "secrets.yml"
            | ".npmrc"
            | ".pypirc"
            | ".netrc"
    ) || matches!(ext.as_deref(), Some("pem" | "key" | "p12" | "pfx"))
    {
        return Some(IncludeClass::Credentials);
    }
    let in_ide_dir = rel.components().any(|c| {
        matches!(
            c.as_os_str().to_str(),
            Some(".vscode" | ".idea" | ".cursor" | ".zed")
        )
    });
    if in_ide_dir {
        return Some(IncludeClass::IdeSettings);
    }
    if matches!(lower.as_str(), "notes.md" | "todo.md" | "scratch.md")
        || lower.ends_with(".local.md")
        || lower.ends_with(".notes.md")
    {
        return Some(IncludeClass::LocalNotes);
    }
    if matches!(
        ext.as_deref(),
        Some("db" | "sqlite" | "sqlite3" | "duckdb")
    ) {
        return Some(IncludeClass::LocalDatabase);
    }
    None
}

/// True when `git` reports `root` is inside a work tree.
pub fn is_git_work_tree(root: &Path) -> bool {
    Command::new("git")
        .arg("-C")
        .arg(root)
        .args(["rev-parse", "--is-inside-work-tree"])
        .output()
        .map(|out| out.status.success() && String::from_utf8_lossy(&out.stdout).trim() == "true")
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Git strategy
// ---------------------------------------------------------------------------

/// Union of modified tracked, staged and untracked-not-ignored paths.
#[derive(Debug, Clone, Copy, Default)]
pub struct GitChangeDetector;

impl GitChangeDetector {
    const QUERIES: [&'static [&'static str]; 3] = [
        &["diff", "--name-only", "--relative", "-z"],
        &["diff", "--cached", "--name-only", "--relative", "-z"],
        &["ls-files", "--others", "--exclude-standard", "-z"],
    ];
}

impl ChangeDetector for GitChangeDetector {
    fn name(&self) -> &'static str {
        "git"
    }

    fn detect(&self, root: &Path) -> Result<BTreeSet<PathBuf>, DetectError> {
        let mut paths = BTreeSet::new();
        for args in Self::QUERIES {
            paths.extend(run_git_paths(root, args)?);
        }
        Ok(paths)
    }
}

fn run_git_paths(root: &Path, args: &[&str]) -> Result<Vec<PathBuf>, DetectError> {
    let output = Command::new("git")
        .arg("-C")
        .arg(root)
        .args(args)
        .output()
        .map_err(|e| DetectError::Io {
            path: root.to_path_buf(),
            source: e,
        })?;
    if !output.status.success() {
        return Err(DetectError::Git {
            root: root.to_path_buf(),
            args: args.join(" "),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output
        .stdout
        .split(|b| *b == 0)
        .filter(|chunk| !chunk.is_empty())
        .map(|chunk| PathBuf::from(String::from_utf8_lossy(chunk).into_owned()))
        .collect())
}

// ---------------------------------------------------------------------------
// Mtime strategy
// ---------------------------------------------------------------------------

/// Files whose mtime falls inside `window`, outside excluded directories.
#[derive(Debug, Clone)]
pub struct MtimeFallbackDetector {
    pub window: Duration,
    pub excluded_dirs: Vec<String>,
    pub excluded_roots: Vec<PathBuf>,
}

impl MtimeFallbackDetector {
    pub fn from_settings(settings: &DetectionSettings, excluded_roots: &[PathBuf]) -> Self {
        Self {
            window: Duration::from_secs(settings.backup_interval_secs),
            excluded_dirs: excluded_dir_names(settings),
            excluded_roots: excluded_roots.to_vec(),
        }
    }

    fn detect_since(&self, root: &Path, cutoff: SystemTime) -> Result<BTreeSet<PathBuf>, DetectError> {
        let mut paths = BTreeSet::new();
        let walker = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| !is_excluded_entry(e, &self.excluded_dirs, &self.excluded_roots));
        for entry in walker {
            let Some(entry) = readable(entry)? else {
                continue;
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let modified = match entry
                .metadata()
                .map_err(std::io::Error::from)
                .and_then(|m| m.modified())
            {
                Ok(modified) => modified,
                Err(e) => {
                    tracing::warn!("skipping {}: {e}", entry.path().display());
                    continue;
                }
            };
            if modified >= cutoff {
                paths.insert(relative(entry.path(), root));
            }
        }
        Ok(paths)
    }
}

impl ChangeDetector for MtimeFallbackDetector {
    fn name(&self) -> &'static str {
        "mtime"
    }

    fn detect(&self, root: &Path) -> Result<BTreeSet<PathBuf>, DetectError> {
        let cutoff = SystemTime::now()
            .checked_sub(self.window)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        self.detect_since(root, cutoff)
    }
}

// ---------------------------------------------------------------------------
// Always-include scan
// ---------------------------------------------------------------------------

fn always_include(
    root: &Path,
    max_depth: usize,
    excluded_dirs: &[String],
    excluded_roots: &[PathBuf],
) -> Result<Vec<PathBuf>, DetectError> {
    let mut found = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .max_depth(max_depth)
        .into_iter()
        .filter_entry(|e| !is_excluded_entry(e, excluded_dirs, excluded_roots));
    for entry in walker {
        let Some(entry) = readable(entry)? else {
            continue;
        };
        if entry.file_type().is_dir() {
            continue;
        }
        let rel = relative(entry.path(), root);
        if include_class(&rel).is_some() {
            found.push(rel);
        }
    }
    Ok(found)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Unreadable entries below the root are logged and skipped; an unreadable
/// root is an error.
fn readable(
    entry: walkdir::Result<walkdir::DirEntry>,
) -> Result<Option<walkdir::DirEntry>, DetectError> {
    match entry {
        Ok(entry) => Ok(Some(entry)),
        Err(e) if e.depth() > 0 => {
            tracing::warn!(
                "skipping unreadable entry {}: {e}",
                e.path().map_or_else(|| "?".to_string(), |p| p.display().to_string())
            );
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

fn excluded_dir_names(settings: &DetectionSettings) -> Vec<String> {
    DEFAULT_EXCLUDED_DIRS
        .iter()
        .map(|s| s.to_string())
        .chain(settings.extra_excluded_dirs.iter().cloned())
        .collect()
}

fn is_excluded_entry(
    entry: &walkdir::DirEntry,
    excluded_dirs: &[String],
    excluded_roots: &[PathBuf],
) -> bool {
    if entry.depth() == 0 {
        return false;
    }
    if entry.file_type().is_dir() {
        let name = entry.file_name().to_string_lossy();
        if excluded_dirs.iter().any(|d| d.as_str() == name.as_ref()) {
            return true;
        }
    }
    is_under_any(entry.path(), excluded_roots)
}

fn is_under_any(path: &Path, roots: &[PathBuf]) -> bool {
    roots.iter().any(|root| path.starts_with(root))
}

fn relative(path: &Path, root: &Path) -> PathBuf {
    path.strip_prefix(root).unwrap_or(path).to_path_buf()
}
