//! Checkpoint core library: configuration, domain types, state paths, errors.
//!
//! - [`types`]: newtypes and shared enums
//! - [`config`]: per-project backup configuration (load / save / init)
//! - [`paths`]: layout of `~/.checkpoint/`
//! - [`error`]: [`ConfigError`]

pub mod config;
pub mod error;
pub mod paths;
pub mod types;

pub use config::{
    ArchiveSettings, BackupConfig, DaemonSettings, DetectionSettings, RetentionPolicy,
    RetentionSettings, RetentionTier, TieredPolicy, WatchdogSettings,
};
pub use error::ConfigError;
pub use types::{Category, ProjectName};
