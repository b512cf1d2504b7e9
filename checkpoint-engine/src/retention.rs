//! Retention and cleanup.
//!
//! [`Planner::plan`] walks the backup directory exactly once and buckets every
//! entry against all active policies at the same time:
//!
//! | Area          | Category   | Policies                               |
//! |---------------|------------|----------------------------------------|
//! | `databases/`  | database   | age, duplicates (opt-in)               |
//! | `archived/`   | files      | age or tiers, orphans (opt-in)         |
//! | `manifests/`  | files      | age (`latest.json` is always kept)     |
//! | `files/`      | snapshots never pruned; leftover copy temp files only |
//!
//! Age is measured from the entry's mtime. A category marked `never_delete`
//! contributes no candidates at all. Temp files of interrupted copies
//! (`*.checkpoint.tmp`) older than an hour are swept regardless of policy.
//! Entries that cannot be read are logged and skipped.
//!
//! [`execute_cleanup`] deletes the planned candidates, logging and skipping
//! per-file failures, then removes directories left empty, deepest first.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use walkdir::WalkDir;

use checkpoint_core::{paths, BackupConfig, Category, ProjectName, RetentionSettings, TieredPolicy};

use crate::archive::{sha256_file, COPY_TMP_SUFFIX};
use crate::error::{io_err, EngineError};
use crate::manifest::LATEST_MANIFEST;

const DAY: u64 = 24 * 60 * 60;
/// Copy temp files younger than this may belong to a copy in progress.
const INTERRUPTED_COPY_GRACE: Duration = Duration::from_secs(60 * 60);

/// Encryption suffixes recognised when none is configured.
pub const KNOWN_ENCRYPTION_SUFFIXES: &[&str] = &[".age", ".gpg", ".enc"];

// ---------------------------------------------------------------------------
// Plan types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PruneReason {
    Expired,
    Duplicate,
    Orphaned,
    /// Temp file left behind by a killed copy.
    Interrupted,
}

/// One file selected for deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PruneCandidate {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub category: Category,
    pub reason: PruneReason,
}

/// Everything a cleanup would delete.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupPlan {
    pub expired_db: Vec<PruneCandidate>,
    pub expired_files: Vec<PruneCandidate>,
    /// Directories that are empty once the candidates are gone, deepest first.
    pub empty_dirs: Vec<PathBuf>,
}

impl CleanupPlan {
    pub fn candidates(&self) -> impl Iterator<Item = &PruneCandidate> {
        self.expired_db.iter().chain(self.expired_files.iter())
    }

    pub fn len(&self) -> usize {
        self.expired_db.len() + self.expired_files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0 && self.empty_dirs.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.candidates().map(|c| c.size_bytes).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupFailure {
    pub path: PathBuf,
    pub message: String,
}

/// Totals of an executed (or simulated) cleanup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub dry_run: bool,
    pub deleted_count: usize,
    pub bytes_freed: u64,
    pub dirs_removed: usize,
    pub failures: Vec<CleanupFailure>,
}

// ---------------------------------------------------------------------------
// Archive names
// ---------------------------------------------------------------------------

/// Parsed `<name>.<YYYYMMDD_HHMMSS>[_<pid>][<suffix>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveName {
    pub original: String,
    pub timestamp: NaiveDateTime,
    pub pid: Option<u32>,
    pub encrypted_suffix: Option<String>,
}

/// Parse an archived version's file name.
///
/// `encryption_suffix` is the configured suffix; when `None` the
/// [`KNOWN_ENCRYPTION_SUFFIXES`] are tried.
pub fn parse_archive_name(file_name: &str, encryption_suffix: Option<&str>) -> Option<ArchiveName> {
    let suffixes: Vec<&str> = match encryption_suffix {
        Some(s) => vec![s],
        None => KNOWN_ENCRYPTION_SUFFIXES.to_vec(),
    };
    let (stem, encrypted_suffix) = suffixes
        .iter()
        .find_map(|s| file_name.strip_suffix(s).map(|stem| (stem, Some(s.to_string()))))
        .unwrap_or((file_name, None));

    let (original, stamp) = stem.rsplit_once('.')?;
    if original.is_empty() {
        return None;
    }
    let timestamp = NaiveDateTime::parse_from_str(stamp.get(..15)?, "%Y%m%d_%H%M%S").ok()?;
    let pid = match stamp.get(15..)? {
        "" => None,
        rest => Some(rest.strip_prefix('_')?.parse().ok()?),
    };
    Some(ArchiveName {
        original: original.to_string(),
        timestamp,
        pid,
        encrypted_suffix,
    })
}

// ---------------------------------------------------------------------------
// Planning
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Area {
    Databases,
    Archived,
    Manifests,
    Snapshots,
}

impl Area {
    fn from_dir_name(name: &str) -> Option<Self> {
        match name {
            "databases" => Some(Area::Databases),
            "archived" => Some(Area::Archived),
            "manifests" => Some(Area::Manifests),
            "files" => Some(Area::Snapshots),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct Scanned {
    path: PathBuf,
    /// Relative to the area root.
    rel: PathBuf,
    area: Area,
    size: u64,
    modified: SystemTime,
}

/// Computes a [`CleanupPlan`] for one backup directory.
#[derive(Debug, Clone)]
pub struct Planner<'a> {
    backup_dir: &'a Path,
    project_root: &'a Path,
    settings: &'a RetentionSettings,
    encryption_suffix: Option<&'a str>,
    now: SystemTime,
}

impl<'a> Planner<'a> {
    pub fn new(backup_dir: &'a Path, project_root: &'a Path, settings: &'a RetentionSettings) -> Self {
        Self {
            backup_dir,
            project_root,
            settings,
            encryption_suffix: None,
            now: SystemTime::now(),
        }
    }

    pub fn for_config(config: &'a BackupConfig) -> Self {
        Self::new(&config.backup_dir, &config.project_root, &config.retention)
            .with_encryption_suffix(config.archive.encryption_suffix.as_deref())
    }

    pub fn with_encryption_suffix(mut self, suffix: Option<&'a str>) -> Self {
        self.encryption_suffix = suffix;
        self
    }

    /// Evaluate ages relative to `now` instead of the wall clock.
    pub fn at(mut self, now: SystemTime) -> Self {
        self.now = now;
        self
    }

    pub fn plan(&self) -> Result<CleanupPlan, EngineError> {
        let (files, dirs) = self.scan()?;
        let mut plan = CleanupPlan::default();

        let mut databases = Vec::new();
        let mut archived = Vec::new();
        let mut manifests = Vec::new();
        let mut leftovers = Vec::new();
        for file in &files {
            match file.area {
                Area::Databases => databases.push(file),
                Area::Archived => archived.push(file),
                Area::Manifests => manifests.push(file),
                Area::Snapshots => leftovers.push(file),
            }
        }

        plan.expired_files.extend(
            leftovers
                .into_iter()
                .filter(|f| self.age(f) > INTERRUPTED_COPY_GRACE)
                .map(|f| candidate(f, PruneReason::Interrupted)),
        );

        if !self.settings.database.never_delete {
            let limit = days(self.settings.database.days);
            let (expired, live): (Vec<&Scanned>, Vec<&Scanned>) =
                databases.into_iter().partition(|f| self.age(f) > limit);
            plan.expired_db
                .extend(expired.into_iter().map(|f| candidate(f, PruneReason::Expired)));
            if self.settings.detect_duplicates {
                plan.expired_db.extend(duplicates(&live));
            }
        }

        if !self.settings.files.never_delete {
            let selected = match &self.settings.tiered {
                Some(tiered) => self.tiered(&archived, tiered),
                None => {
                    let limit = days(self.settings.files.days);
                    archived
                        .iter()
                        .copied()
                        .filter(|f| self.age(f) > limit)
                        .map(|f| candidate(f, PruneReason::Expired))
                        .collect()
                }
            };
            plan.expired_files.extend(selected);

            if self.settings.detect_orphans {
                let already: HashSet<PathBuf> =
                    plan.expired_files.iter().map(|c| c.path.clone()).collect();
                let remaining: Vec<&Scanned> = archived
                    .iter()
                    .copied()
                    .filter(|f| !already.contains(&f.path))
                    .collect();
                plan.expired_files.extend(self.orphans(&remaining));
            }

            let limit = days(self.settings.files.days);
            plan.expired_files.extend(
                manifests
                    .into_iter()
                    .filter(|f| f.path.file_name().and_then(|n| n.to_str()) != Some(LATEST_MANIFEST))
                    .filter(|f| self.age(f) > limit)
                    .map(|f| candidate(f, PruneReason::Expired)),
            );
        }

        plan.expired_db.sort_by(|a, b| a.path.cmp(&b.path));
        plan.expired_files.sort_by(|a, b| a.path.cmp(&b.path));
        plan.empty_dirs = self.empty_dirs_after(&plan, &files, dirs);

        tracing::debug!(
            "cleanup plan for {}: {} database, {} files, {} empty dirs",
            self.backup_dir.display(),
            plan.expired_db.len(),
            plan.expired_files.len(),
            plan.empty_dirs.len()
        );
        Ok(plan)
    }

    /// Single traversal of the prunable areas.
    fn scan(&self) -> Result<(Vec<Scanned>, Vec<PathBuf>), EngineError> {
        let mut files = Vec::new();
        let mut dirs = Vec::new();
        if !self.backup_dir.is_dir() {
            return Ok((files, dirs));
        }

        let walker = WalkDir::new(self.backup_dir)
            .min_depth(1)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| {
                e.depth() != 1
                    || (e.file_type().is_dir()
                        && e.file_name().to_str().and_then(Area::from_dir_name).is_some())
            });

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(
                        "cleanup: skipping unreadable entry {}: {e}",
                        e.path().map_or_else(|| "?".to_string(), |p| p.display().to_string())
                    );
                    continue;
                }
            };
            if entry.depth() == 1 {
                continue;
            }
            let Ok(top) = entry.path().strip_prefix(self.backup_dir) else {
                continue;
            };
            let mut components = top.components();
            let Some(area) = components
                .next()
                .and_then(|c| c.as_os_str().to_str())
                .and_then(Area::from_dir_name)
            else {
                continue;
            };
            if entry.file_type().is_dir() {
                // Live snapshot directories are never removed.
                if area != Area::Snapshots {
                    dirs.push(entry.path().to_path_buf());
                }
                continue;
            }
            if area == Area::Snapshots
                && !entry.file_name().to_string_lossy().ends_with(COPY_TMP_SUFFIX)
            {
                continue;
            }
            let stat = entry
                .metadata()
                .map_err(std::io::Error::from)
                .and_then(|meta| meta.modified().map(|modified| (meta.len(), modified)));
            let (size, modified) = match stat {
                Ok(stat) => stat,
                Err(e) => {
                    tracing::warn!("cleanup: skipping {}: {e}", entry.path().display());
                    continue;
                }
            };
            files.push(Scanned {
                path: entry.path().to_path_buf(),
                rel: components.as_path().to_path_buf(),
                area,
                size,
                modified,
            });
        }
        Ok((files, dirs))
    }

    fn age(&self, file: &Scanned) -> Duration {
        self.now.duration_since(file.modified).unwrap_or(Duration::ZERO)
    }

    /// Versions of one logical file fill tiers newest first; overflow and
    /// versions older than every tier are selected.
    fn tiered(&self, archived: &[&Scanned], tiered: &TieredPolicy) -> Vec<PruneCandidate> {
        let mut groups: BTreeMap<PathBuf, Vec<&Scanned>> = BTreeMap::new();
        for file in archived {
            groups.entry(self.logical_path(file)).or_default().push(*file);
        }

        let mut selected = Vec::new();
        for versions in groups.values_mut() {
            versions.sort_by(|a, b| b.modified.cmp(&a.modified));
            let mut used = vec![0usize; tiered.tiers.len()];
            for version in versions.iter() {
                let age = self.age(version);
                match tiered.tiers.iter().position(|t| age <= days(t.max_age_days)) {
                    Some(i) => {
                        used[i] += 1;
                        if used[i] > tiered.tiers[i].keep {
                            selected.push(candidate(version, PruneReason::Expired));
                        }
                    }
                    None => selected.push(candidate(version, PruneReason::Expired)),
                }
            }
        }
        selected
    }

    fn orphans(&self, archived: &[&Scanned]) -> Vec<PruneCandidate> {
        if !self.project_root.is_dir() {
            tracing::warn!(
                "skipping orphan detection: project root {} is missing",
                self.project_root.display()
            );
            return Vec::new();
        }
        archived
            .iter()
            .filter(|f| {
                let Some(name) = f.rel.file_name().and_then(|n| n.to_str()) else {
                    return false;
                };
                if parse_archive_name(name, self.encryption_suffix).is_none() {
                    return false;
                }
                !self.project_root.join(self.logical_path(f)).exists()
            })
            .map(|f| candidate(f, PruneReason::Orphaned))
            .collect()
    }

    /// Relative source path an archived version belongs to.
    fn logical_path(&self, file: &Scanned) -> PathBuf {
        let parsed = file
            .rel
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| parse_archive_name(n, self.encryption_suffix));
        match parsed {
            Some(name) => file.rel.with_file_name(name.original),
            None => file.rel.clone(),
        }
    }

    fn empty_dirs_after(
        &self,
        plan: &CleanupPlan,
        files: &[Scanned],
        dirs: Vec<PathBuf>,
    ) -> Vec<PathBuf> {
        let doomed: HashSet<&Path> = plan.candidates().map(|c| c.path.as_path()).collect();
        let mut occupied: HashSet<PathBuf> = HashSet::new();
        for file in files.iter().filter(|f| !doomed.contains(f.path.as_path())) {
            for ancestor in file.path.ancestors().skip(1) {
                if ancestor == self.backup_dir || !occupied.insert(ancestor.to_path_buf()) {
                    break;
                }
            }
        }
        let mut empty: Vec<PathBuf> = dirs.into_iter().filter(|d| !occupied.contains(d)).collect();
        empty.sort_by(|a, b| {
            b.components()
                .count()
                .cmp(&a.components().count())
                .then_with(|| a.cmp(b))
        });
        empty
    }
}

fn candidate(file: &Scanned, reason: PruneReason) -> PruneCandidate {
    PruneCandidate {
        path: file.path.clone(),
        size_bytes: file.size,
        category: match file.area {
            Area::Databases => Category::Database,
            Area::Archived | Area::Manifests | Area::Snapshots => Category::Files,
        },
        reason,
    }
}

/// Identical database dumps, keeping the newest of each group. Only files
/// sharing a size are hashed.
fn duplicates(live: &[&Scanned]) -> Vec<PruneCandidate> {
    let mut by_size: HashMap<u64, Vec<&Scanned>> = HashMap::new();
    for file in live {
        by_size.entry(file.size).or_default().push(*file);
    }

    let mut selected = Vec::new();
    for group in by_size.into_values().filter(|g| g.len() > 1) {
        let mut by_hash: HashMap<String, Vec<&Scanned>> = HashMap::new();
        for file in group {
            match sha256_file(&file.path) {
                Ok(digest) => by_hash.entry(digest).or_default().push(file),
                Err(e) => tracing::warn!("cannot hash {}: {e}", file.path.display()),
            }
        }
        for mut same in by_hash.into_values().filter(|g| g.len() > 1) {
            same.sort_by(|a, b| b.modified.cmp(&a.modified));
            selected.extend(same.iter().skip(1).map(|f| candidate(f, PruneReason::Duplicate)));
        }
    }
    selected
}

fn days(n: u64) -> Duration {
    Duration::from_secs(n.saturating_mul(DAY))
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// `Planner::for_config(config).plan()`.
pub fn plan_cleanup(config: &BackupConfig) -> Result<CleanupPlan, EngineError> {
    Planner::for_config(config).plan()
}

/// Delete everything in `plan`. With `dry_run` only the totals are computed.
pub fn execute_cleanup(plan: &CleanupPlan, dry_run: bool) -> CleanupReport {
    let mut report = CleanupReport {
        dry_run,
        ..CleanupReport::default()
    };
    if dry_run {
        report.deleted_count = plan.len();
        report.bytes_freed = plan.total_bytes();
        report.dirs_removed = plan.empty_dirs.len();
        return report;
    }

    for c in plan.candidates() {
        match std::fs::remove_file(&c.path) {
            Ok(()) => {
                tracing::debug!("deleted {} ({:?})", c.path.display(), c.reason);
                report.deleted_count += 1;
                report.bytes_freed += c.size_bytes;
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!("already gone: {}", c.path.display());
            }
            Err(e) => {
                tracing::warn!("cannot delete {}: {e}", c.path.display());
                report.failures.push(CleanupFailure {
                    path: c.path.clone(),
                    message: e.to_string(),
                });
            }
        }
    }

    for dir in &plan.empty_dirs {
        match std::fs::remove_dir(dir) {
            Ok(()) => report.dirs_removed += 1,
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            // Still holds a file whose deletion failed.
            Err(e) => tracing::debug!("kept directory {}: {e}", dir.display()),
        }
    }

    tracing::info!(
        "cleanup deleted {} file(s), freed {} bytes, removed {} dir(s), {} failure(s)",
        report.deleted_count,
        report.bytes_freed,
        report.dirs_removed,
        report.failures.len()
    );
    report
}

// ---------------------------------------------------------------------------
// Cadence marker
// ---------------------------------------------------------------------------

/// Time of the last completed cleanup for `project`, if recorded.
pub fn last_cleanup_at(home: &Path, project: &ProjectName) -> Option<DateTime<Utc>> {
    let contents = std::fs::read_to_string(paths::cleanup_marker_path(home, project.as_str())).ok()?;
    let secs: i64 = contents.trim().parse().ok()?;
    DateTime::from_timestamp(secs, 0)
}

/// True when no cleanup ran within the last `interval_hours`.
pub fn cleanup_due_at(
    home: &Path,
    project: &ProjectName,
    interval_hours: u64,
    now: DateTime<Utc>,
) -> bool {
    match last_cleanup_at(home, project) {
        Some(last) => {
            let hours = i64::try_from(interval_hours.min(1_000_000)).unwrap_or(1_000_000);
            now - last >= chrono::Duration::hours(hours)
        }
        None => true,
    }
}

/// Record a completed cleanup.
pub fn mark_cleanup_at(
    home: &Path,
    project: &ProjectName,
    now: DateTime<Utc>,
) -> Result<(), EngineError> {
    let path = paths::cleanup_marker_path(home, project.as_str());
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
    }
    let tmp = path.with_extension("last-cleanup.tmp");
    std::fs::write(&tmp, now.timestamp().to_string()).map_err(|e| io_err(&tmp, e))?;
    std::fs::rename(&tmp, &path).map_err(|e| io_err(&path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use checkpoint_core::{RetentionPolicy, RetentionTier};
    use filetime::{set_file_mtime, FileTime};
    use std::fs;
    use tempfile::TempDir;

    fn now() -> SystemTime {
        SystemTime::now()
    }

    fn put(path: &Path, content: &str, age_days: u64) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
        let when = now() - Duration::from_secs(age_days * DAY);
        set_file_mtime(path, FileTime::from_system_time(when)).unwrap();
    }

    #[test]
    fn parses_archive_names() {
        let plain = parse_archive_name("app.py.20260101_120000", None).unwrap();
        assert_eq!(plain.original, "app.py");
        assert_eq!(plain.pid, None);

        let with_pid = parse_archive_name("app.py.20260101_120000_4242", None).unwrap();
        assert_eq!(with_pid.pid, Some(4242));

        let encrypted = parse_archive_name("app.py.20260101_120000.age", None).unwrap();
        assert_eq!(encrypted.original, "app.py");
        assert_eq!(encrypted.encrypted_suffix.as_deref(), Some(".age"));

        let custom = parse_archive_name("app.py.20260101_120000.crypt", Some(".crypt")).unwrap();
        assert_eq!(custom.original, "app.py");

        assert!(parse_archive_name("app.py", None).is_none());
        assert!(parse_archive_name("app.py.2026", None).is_none());
        assert!(parse_archive_name("app.py.20260101_120000_x", None).is_none());
    }

    #[test]
    fn files_snapshot_tree_is_never_pruned() {
        let tmp = TempDir::new().unwrap();
        let backup = tmp.path();
        put(&backup.join("files/old.txt"), "x", 400);
        let settings = RetentionSettings::default();
        let plan = Planner::new(backup, backup, &settings).at(now()).plan().unwrap();
        assert!(plan.candidates().next().is_none());
    }

    #[test]
    fn interrupted_copy_leftovers_are_swept() {
        let tmp = TempDir::new().unwrap();
        let backup = tmp.path();
        put(&backup.join("files/src/app.py"), "x", 400);
        put(&backup.join("files/src/app.py.checkpoint.tmp"), "partial", 2);
        put(&backup.join("files/src/new.py.checkpoint.tmp"), "in flight", 0);

        let mut settings = RetentionSettings::default();
        settings.files.never_delete = true;
        let plan = Planner::new(backup, backup, &settings).at(now()).plan().unwrap();
        let selected: Vec<_> = plan.candidates().map(|c| (c.path.clone(), c.reason)).collect();
        assert_eq!(
            selected,
            vec![(backup.join("files/src/app.py.checkpoint.tmp"), PruneReason::Interrupted)]
        );
        assert!(plan.empty_dirs.is_empty());

        let report = execute_cleanup(&plan, false);
        assert_eq!(report.deleted_count, 1);
        assert!(backup.join("files/src/app.py").exists());
        assert!(backup.join("files/src/new.py.checkpoint.tmp").exists());
    }

    #[test]
    fn latest_manifest_survives_expiry() {
        let tmp = TempDir::new().unwrap();
        let backup = tmp.path();
        put(&backup.join("manifests/latest.json"), "{}", 400);
        put(&backup.join("manifests/manifest-20250101_000000.json"), "{}", 400);
        let settings = RetentionSettings::default();
        let plan = Planner::new(backup, backup, &settings).at(now()).plan().unwrap();
        let paths: Vec<_> = plan.candidates().map(|c| c.path.clone()).collect();
        assert_eq!(paths, vec![backup.join("manifests/manifest-20250101_000000.json")]);
    }

    #[test]
    fn tiers_keep_newest_versions_per_file() {
        let tmp = TempDir::new().unwrap();
        let backup = tmp.path().join("backup");
        let project = tmp.path().join("project");
        fs::create_dir_all(&project).unwrap();
        for (i, age) in [0u64, 0, 0, 3, 3, 400].iter().enumerate() {
            put(
                &backup.join(format!("archived/app.py.2026010{}_000000", i + 1)),
                "v",
                *age,
            );
        }
        let settings = RetentionSettings {
            tiered: Some(TieredPolicy {
                tiers: vec![
                    RetentionTier { max_age_days: 1, keep: 2 },
                    RetentionTier { max_age_days: 7, keep: 1 },
                ],
            }),
            ..RetentionSettings::default()
        };
        let plan = Planner::new(&backup, &project, &settings).at(now()).plan().unwrap();
        // One of three day-old versions, one of two 3-day-old versions and
        // the version older than every tier.
        assert_eq!(plan.expired_files.len(), 3);
        assert!(plan
            .expired_files
            .iter()
            .any(|c| c.path.ends_with("app.py.20260106_000000")));
    }

    #[test]
    fn duplicate_dumps_keep_the_newest() {
        let tmp = TempDir::new().unwrap();
        let backup = tmp.path();
        put(&backup.join("databases/db-1.sql"), "same", 3);
        put(&backup.join("databases/db-2.sql"), "same", 2);
        put(&backup.join("databases/db-3.sql"), "same", 1);
        put(&backup.join("databases/db-4.sql"), "diff", 1);
        let settings = RetentionSettings {
            detect_duplicates: true,
            ..RetentionSettings::default()
        };
        let plan = Planner::new(backup, backup, &settings).at(now()).plan().unwrap();
        let mut dupes: Vec<_> = plan
            .expired_db
            .iter()
            .filter(|c| c.reason == PruneReason::Duplicate)
            .map(|c| c.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        dupes.sort();
        assert_eq!(dupes, vec!["db-1.sql", "db-2.sql"]);
    }

    #[test]
    fn orphans_are_versions_without_a_source() {
        let tmp = TempDir::new().unwrap();
        let backup = tmp.path().join("backup");
        let project = tmp.path().join("project");
        put(&project.join("src/kept.rs"), "k", 0);
        put(&backup.join("archived/src/kept.rs.20260101_000000"), "k", 1);
        put(&backup.join("archived/src/gone.rs.20260101_000000.gpg"), "g", 1);
        let settings = RetentionSettings {
            detect_orphans: true,
            ..RetentionSettings::default()
        };
        let plan = Planner::new(&backup, &project, &settings).at(now()).plan().unwrap();
        assert_eq!(plan.expired_files.len(), 1);
        assert_eq!(plan.expired_files[0].reason, PruneReason::Orphaned);
        assert!(plan.expired_files[0].path.ends_with("gone.rs.20260101_000000.gpg"));
    }

    #[test]
    fn execute_removes_files_then_empty_dirs_but_not_roots() {
        let tmp = TempDir::new().unwrap();
        let backup = tmp.path();
        put(&backup.join("archived/deep/nested/old.txt.20250101_000000"), "old", 90);
        put(&backup.join("archived/kept/new.txt.20260101_000000"), "new", 1);
        let settings = RetentionSettings::default();
        let plan = Planner::new(backup, backup, &settings).at(now()).plan().unwrap();
        assert_eq!(
            plan.empty_dirs,
            vec![backup.join("archived/deep/nested"), backup.join("archived/deep")]
        );

        let dry = execute_cleanup(&plan, true);
        assert_eq!(dry.deleted_count, 1);
        assert_eq!(dry.bytes_freed, 3);
        assert!(backup.join("archived/deep/nested").exists());

        let report = execute_cleanup(&plan, false);
        assert_eq!(report.deleted_count, 1);
        assert_eq!(report.dirs_removed, 2);
        assert!(report.failures.is_empty());
        assert!(!backup.join("archived/deep").exists());
        assert!(backup.join("archived/kept").exists());
        assert!(backup.join("archived").exists());
    }

    #[test]
    fn vanished_candidates_do_not_count_as_failures() {
        let tmp = TempDir::new().unwrap();
        let backup = tmp.path();
        put(&backup.join("databases/old.sql"), "x", 90);
        let settings = RetentionSettings {
            database: RetentionPolicy { days: 30, never_delete: false },
            ..RetentionSettings::default()
        };
        let plan = Planner::new(backup, backup, &settings).at(now()).plan().unwrap();
        fs::remove_file(backup.join("databases/old.sql")).unwrap();
        let report = execute_cleanup(&plan, false);
        assert_eq!(report.deleted_count, 0);
        assert!(report.failures.is_empty());
    }

    #[test]
    fn cleanup_cadence_marker() {
        let home = TempDir::new().unwrap();
        let project = ProjectName::from("api");
        let t0 = Utc::now();
        assert!(cleanup_due_at(home.path(), &project, 24, t0));
        mark_cleanup_at(home.path(), &project, t0).unwrap();
        assert!(!cleanup_due_at(home.path(), &project, 24, t0 + chrono::Duration::hours(23)));
        assert!(cleanup_due_at(home.path(), &project, 24, t0 + chrono::Duration::hours(25)));
    }
}
