//! Error types for checkpoint-engine.

use std::path::PathBuf;

use thiserror::Error;

use checkpoint_core::ConfigError;
use checkpoint_detector::DetectError;

/// Errors that abort a backup cycle or a cleanup pass as a whole.
///
/// Per-file problems never surface here; they are recorded as
/// [`crate::archive::FileFailure`] or [`crate::retention::CleanupFailure`].
#[derive(Debug, Error)]
pub enum EngineError {
    /// An error from configuration loading.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Change detection failed for the project.
    #[error("change detection failed: {0}")]
    Detect(#[from] DetectError),

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON error in the heartbeat or manifest files.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Backup directory traversal failed.
    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("project root does not exist: {path}")]
    MissingProjectRoot { path: PathBuf },

    #[error("home directory not found")]
    HomeNotFound,
}

/// Convenience constructor for [`EngineError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> EngineError {
    EngineError::Io {
        path: path.into(),
        source,
    }
}
