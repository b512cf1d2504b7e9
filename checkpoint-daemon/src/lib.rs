//! Checkpoint daemon runtime, heartbeat watchdog and platform service
//! management.
//!
//! - [`runtime`]: watcher + scheduler + serialized backup processor
//! - [`watchdog`]: heartbeat polling and self-healing restarts
//! - [`service`]: [`DaemonManager`] over launchd, systemd or nothing
//! - [`alerts`]: notifiers and the cooldown gate

pub mod alerts;
mod error;
pub mod log_rotation;
pub mod paths;
pub mod runtime;
pub mod service;
pub mod watchdog;

pub use alerts::{CommandNotifier, LogNotifier, NotificationGate, Notifier, Severity};
pub use error::DaemonError;
pub use runtime::{init_tracing, run, start_blocking};
pub use service::{
    detect_manager, DaemonInfo, DaemonManager, LaunchdManager, ServiceSpec, SystemdManager,
    UnsupportedManager,
};
pub use watchdog::{TickReport, Watchdog, WatchdogState, WatchdogStatus, WatchdogStatusFile};
