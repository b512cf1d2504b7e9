//! Per-project backup configuration.
//!
//! # Storage layout
//!
//! ```text
//! ~/.checkpoint/
//!   projects/
//!     <project>.yaml   (mode 0600; directory mode 0700)
//!   watchdog.yaml      (optional)
//! ```
//!
//! A [`BackupConfig`] is loaded once per invocation and handed by reference to
//! every component; nothing reads configuration from process-wide state.
//!
//! # API pattern
//!
//! Every function touching disk has two forms:
//! - `fn_at(home: &Path, …)`: explicit home; used in tests with `TempDir`
//! - `fn(…)`: derives home from `dirs::home_dir()`, delegates to `_at`

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{io_err, ConfigError};
use crate::paths;
use crate::types::{Category, ProjectName};

// ---------------------------------------------------------------------------
// 1. Types
// ---------------------------------------------------------------------------

/// Complete configuration of one backed-up project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupConfig {
    pub project_name: ProjectName,
    /// Absolute path of the project being backed up.
    pub project_root: PathBuf,
    /// Primary backup destination (`files/`, `archived/`, `databases/`, `manifests/`).
    pub backup_dir: PathBuf,
    /// Fallback destination used when copies to `backup_dir` keep failing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_backup_dir: Option<PathBuf>,
    #[serde(default)]
    pub detection: DetectionSettings,
    #[serde(default)]
    pub archive: ArchiveSettings,
    #[serde(default)]
    pub retention: RetentionSettings,
    #[serde(default)]
    pub daemon: DaemonSettings,
}

/// Change detection inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionSettings {
    /// Window used by the mtime fallback detector.
    pub backup_interval_secs: u64,
    /// Maximum directory depth searched for always-include files.
    pub always_include_depth: usize,
    /// Additional directory names skipped by the mtime detector.
    pub extra_excluded_dirs: Vec<String>,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            backup_interval_secs: 60 * 60,
            always_include_depth: 5,
            extra_excluded_dirs: Vec::new(),
        }
    }
}

/// Copy / archive behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveSettings {
    /// Compare by SHA-256 digest instead of a byte-by-byte read.
    pub hash_compare: bool,
    /// Files larger than this are skipped. `None` disables the ceiling.
    pub max_file_size_bytes: Option<u64>,
    pub copy_attempts: u32,
    pub retry_delay_ms: u64,
    /// Suffix appended by the external encryption step (e.g. `.age`).
    pub encryption_suffix: Option<String>,
}

impl Default for ArchiveSettings {
    fn default() -> Self {
        Self {
            hash_compare: true,
            max_file_size_bytes: Some(100 * 1024 * 1024),
            copy_attempts: 3,
            retry_delay_ms: 500,
            encryption_suffix: None,
        }
    }
}

/// Time-based policy for one category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub days: u64,
    #[serde(default)]
    pub never_delete: bool,
}

/// One tier of the tiered retention mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionTier {
    /// Versions no older than this many days fall in the tier.
    pub max_age_days: u64,
    /// Number of most recent versions kept in the tier.
    pub keep: usize,
}

/// Keep more recent history and less old history for archived files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TieredPolicy {
    /// Ordered by ascending `max_age_days`.
    pub tiers: Vec<RetentionTier>,
}

impl Default for TieredPolicy {
    fn default() -> Self {
        Self {
            tiers: vec![
                RetentionTier { max_age_days: 1, keep: 24 },
                RetentionTier { max_age_days: 7, keep: 7 },
                RetentionTier { max_age_days: 30, keep: 4 },
                RetentionTier { max_age_days: 365, keep: 12 },
            ],
        }
    }
}

/// Retention/cleanup engine inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionSettings {
    pub database: RetentionPolicy,
    pub files: RetentionPolicy,
    /// When set, archived file versions are pruned per tier instead of by age.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tiered: Option<TieredPolicy>,
    pub detect_duplicates: bool,
    pub detect_orphans: bool,
    /// Minimum spacing between cleanups triggered from a backup cycle.
    pub cleanup_interval_hours: u64,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            database: RetentionPolicy { days: 30, never_delete: false },
            files: RetentionPolicy { days: 60, never_delete: false },
            tiered: None,
            detect_duplicates: false,
            detect_orphans: false,
            cleanup_interval_hours: 24,
        }
    }
}

impl RetentionSettings {
    pub fn policy(&self, category: Category) -> &RetentionPolicy {
        match category {
            Category::Database => &self.database,
            Category::Files => &self.files,
        }
    }
}

/// Daemon runtime knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSettings {
    /// Quiet period after the last filesystem event before a run fires.
    pub debounce_secs: u64,
    /// Liveness heartbeat cadence between runs.
    pub heartbeat_interval_secs: u64,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            debounce_secs: 60,
            heartbeat_interval_secs: 60,
        }
    }
}

/// Watchdog knobs, read from `~/.checkpoint/watchdog.yaml` when present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogSettings {
    pub poll_interval_secs: u64,
    /// Heartbeats older than this are considered stale.
    pub stale_after_secs: u64,
    /// Consecutive stale polls before daemons are restarted.
    pub failure_threshold: u32,
    pub notify_cooldown_secs: u64,
    /// Command used to deliver notifications; the message is appended as the
    /// last argument. Notifications go to the log when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notify_command: Option<Vec<String>>,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            stale_after_secs: 5 * 60,
            failure_threshold: 3,
            notify_cooldown_secs: 60 * 60,
            notify_command: None,
        }
    }
}

impl BackupConfig {
    /// Build a config with default settings for `project_root`.
    pub fn new(project_name: ProjectName, project_root: PathBuf, backup_dir: PathBuf) -> Self {
        Self {
            project_name,
            project_root,
            backup_dir,
            secondary_backup_dir: None,
            detection: DetectionSettings::default(),
            archive: ArchiveSettings::default(),
            retention: RetentionSettings::default(),
            daemon: DaemonSettings::default(),
        }
    }

    /// `<backup_dir>/files`: live snapshots.
    pub fn snapshot_root(&self) -> PathBuf {
        self.backup_dir.join("files")
    }

    /// `<backup_dir>/archived`: superseded versions.
    pub fn archive_root(&self) -> PathBuf {
        self.backup_dir.join("archived")
    }

    /// `<backup_dir>/databases`: externally produced database dumps.
    pub fn database_root(&self) -> PathBuf {
        self.backup_dir.join("databases")
    }

    /// `<backup_dir>/manifests`: persisted run manifests.
    pub fn manifest_root(&self) -> PathBuf {
        self.backup_dir.join("manifests")
    }

    /// `<secondary_backup_dir>/files`, when a secondary destination is set.
    pub fn secondary_snapshot_root(&self) -> Option<PathBuf> {
        self.secondary_backup_dir.as_ref().map(|dir| dir.join("files"))
    }

    /// Check invariants that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::Invalid {
            project: self.project_name.0.clone(),
            reason: reason.to_string(),
        };
        if self.project_name.0.is_empty()
            || self.project_name.0.contains(|c| c == '/' || c == '\\')
            || self.project_name.0.starts_with('.')
        {
            return Err(invalid("project_name must be a plain, non-hidden file name"));
        }
        if self.backup_dir == self.project_root {
            return Err(invalid("backup_dir must differ from project_root"));
        }
        if self.project_root.starts_with(&self.backup_dir) {
            return Err(invalid("project_root must not live inside backup_dir"));
        }
        if self.archive.copy_attempts == 0 {
            return Err(invalid("archive.copy_attempts must be at least 1"));
        }
        if let Some(tiered) = &self.retention.tiered {
            if tiered.tiers.is_empty() {
                return Err(invalid("retention.tiered.tiers must not be empty"));
            }
            let ascending = tiered
                .tiers
                .windows(2)
                .all(|pair| pair[0].max_age_days < pair[1].max_age_days);
            if !ascending {
                return Err(invalid(
                    "retention.tiered.tiers must be ordered by ascending max_age_days",
                ));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 2. Load
// ---------------------------------------------------------------------------

/// Load `<home>/.checkpoint/projects/<project>.yaml` and validate it.
///
/// Returns `ConfigError::ConfigNotFound` if absent,
/// `ConfigError::Parse` (with path + line context) if malformed YAML.
pub fn load_at(home: &Path, project: &ProjectName) -> Result<BackupConfig, ConfigError> {
    load_file(&paths::config_path(home, &project.0))
}

/// `load_at` convenience wrapper.
pub fn load(project: &ProjectName) -> Result<BackupConfig, ConfigError> {
    load_at(&home()?, project)
}

/// Load and validate a config from an explicit file path.
pub fn load_file(path: &Path) -> Result<BackupConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::ConfigNotFound {
            path: path.to_path_buf(),
        });
    }
    let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    let config: BackupConfig =
        serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
    config.validate()?;
    Ok(config)
}

/// Load every project config under `<home>/.checkpoint/projects/`, sorted by
/// project name.
pub fn list_at(home: &Path) -> Result<Vec<BackupConfig>, ConfigError> {
    let dir = paths::projects_dir(home);
    if !dir.exists() {
        return Ok(vec![]);
    }
    let mut entries: Vec<_> = std::fs::read_dir(&dir)
        .map_err(|e| io_err(&dir, e))?
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.path()
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| ext == "yaml")
                .unwrap_or(false)
        })
        .collect();
    entries.sort_by_key(|e| e.file_name());

    let mut configs = Vec::with_capacity(entries.len());
    for entry in entries {
        configs.push(load_file(&entry.path())?);
    }
    Ok(configs)
}

/// `list_at` convenience wrapper.
pub fn list() -> Result<Vec<BackupConfig>, ConfigError> {
    list_at(&home()?)
}

/// Load watchdog overrides, falling back to defaults when the file is absent.
pub fn load_watchdog_settings_at(home: &Path) -> Result<WatchdogSettings, ConfigError> {
    let path = paths::watchdog_config_path(home);
    if !path.exists() {
        return Ok(WatchdogSettings::default());
    }
    let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
    serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse { path, source: e })
}

// ---------------------------------------------------------------------------
// 3. Save (atomic)
// ---------------------------------------------------------------------------

/// Atomically save a config to `<home>/.checkpoint/projects/<project>.yaml`.
///
/// Write flow: serialize → `.yaml.tmp` sibling → `chmod 0600` → `rename`.
pub fn save_at(home: &Path, config: &BackupConfig) -> Result<PathBuf, ConfigError> {
    config.validate()?;
    let dir = paths::projects_dir(home);
    if !dir.exists() {
        std::fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        set_dir_permissions(&dir)?;
    }
    let path = paths::config_path(home, &config.project_name.0);
    let tmp_path = path.with_file_name(format!("{}.yaml.tmp", config.project_name.0));

    let yaml = serde_yaml::to_string(config)?;
    std::fs::write(&tmp_path, yaml).map_err(|e| io_err(&tmp_path, e))?;
    set_file_permissions(&tmp_path)?;
    std::fs::rename(&tmp_path, &path).map_err(|e| io_err(&path, e))?;
    Ok(path)
}

// ---------------------------------------------------------------------------
// 4. Init
// ---------------------------------------------------------------------------

/// Register `project_root` with default settings.
///
/// Idempotent: if the config already exists, loads and returns it unchanged.
pub fn init_at(
    home: &Path,
    project_root: PathBuf,
    project_name: Option<ProjectName>,
    backup_dir: Option<PathBuf>,
) -> Result<BackupConfig, ConfigError> {
    let name = project_name.unwrap_or_else(|| {
        ProjectName::from(
            project_root
                .file_name()
                .unwrap_or_else(|| project_root.as_os_str())
                .to_string_lossy()
                .into_owned(),
        )
    });

    if paths::config_path(home, &name.0).exists() {
        return load_at(home, &name);
    }

    let backup_dir = backup_dir
        .unwrap_or_else(|| paths::checkpoint_root(home).join("backups").join(&name.0));
    let config = BackupConfig::new(name, project_root, backup_dir);
    save_at(home, &config)?;
    Ok(config)
}

/// `init_at` convenience wrapper.
pub fn init(
    project_root: PathBuf,
    project_name: Option<ProjectName>,
    backup_dir: Option<PathBuf>,
) -> Result<BackupConfig, ConfigError> {
    init_at(&home()?, project_root, project_name, backup_dir)
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn home() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::HomeNotFound)
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample(home: &Path) -> BackupConfig {
        BackupConfig::new(
            ProjectName::from("api"),
            PathBuf::from("/code/api"),
            home.join("backups/api"),
        )
    }

    #[test]
    fn save_and_load_roundtrip() {
        let home = TempDir::new().unwrap();
        let config = sample(home.path());
        save_at(home.path(), &config).expect("save");
        let loaded = load_at(home.path(), &config.project_name).expect("load");
        assert_eq!(loaded, config);
    }

    #[test]
    fn save_cleans_up_tmp_and_sets_permissions() {
        let home = TempDir::new().unwrap();
        let path = save_at(home.path(), &sample(home.path())).expect("save");
        assert!(!path.with_file_name("api.yaml.tmp").exists());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o600);
        }
    }

    #[test]
    fn minimal_yaml_gets_defaults() {
        let yaml = "project_name: api\nproject_root: /code/api\nbackup_dir: /backups/api\n";
        let config: BackupConfig = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(config.archive.copy_attempts, 3);
        assert_eq!(config.daemon.debounce_secs, 60);
        assert_eq!(config.retention.database.days, 30);
        assert!(config.retention.tiered.is_none());
        assert!(config.secondary_backup_dir.is_none());
    }

    #[test]
    fn validate_rejects_zero_copy_attempts() {
        let home = TempDir::new().unwrap();
        let mut config = sample(home.path());
        config.archive.copy_attempts = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("copy_attempts"));
    }

    #[test]
    fn validate_rejects_unordered_tiers() {
        let home = TempDir::new().unwrap();
        let mut config = sample(home.path());
        config.retention.tiered = Some(TieredPolicy {
            tiers: vec![
                RetentionTier { max_age_days: 30, keep: 4 },
                RetentionTier { max_age_days: 7, keep: 7 },
            ],
        });
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn watchdog_settings_default_when_file_missing() {
        let home = TempDir::new().unwrap();
        let settings = load_watchdog_settings_at(home.path()).expect("load");
        assert_eq!(settings, WatchdogSettings::default());
    }

    #[test]
    fn home_not_found_error_message() {
        assert!(ConfigError::HomeNotFound.to_string().contains("home directory"));
    }
}
