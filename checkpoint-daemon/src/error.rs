use std::path::PathBuf;

use thiserror::Error;

/// Error surface for the daemon runtime, watchdog and service management.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("notify error: {0}")]
    Notify(#[from] notify::Error),

    #[error("config error: {0}")]
    Config(#[from] checkpoint_core::ConfigError),

    #[error("engine error: {0}")]
    Engine(#[from] checkpoint_engine::EngineError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("no projects registered; run `checkpoint init` first")]
    NoProjects,

    #[error("service manager error: {0}")]
    Service(String),

    #[error("notification delivery failed: {0}")]
    Notification(String),
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}
