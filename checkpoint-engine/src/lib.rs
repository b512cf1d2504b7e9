//! # checkpoint-engine
//!
//! Lock manager, incremental archival, retention and heartbeat for one
//! project's backups.
//!
//! Call [`run_backup_cycle`] (or [`BackupCycle`] for cancellation and copier
//! overrides) to run one complete lock → detect → archive → verify →
//! cleanup → heartbeat cycle.

pub mod archive;
pub mod cycle;
pub mod error;
pub mod heartbeat;
pub mod lock;
pub mod manifest;
pub mod retention;

pub use archive::{
    ArchiveReport, Archiver, Copier, FailureCode, FileFailure, FsCopier, RunOutcome,
};
pub use cycle::{run_backup_cycle, run_backup_cycle_at, BackupCycle, CycleReport, CycleStatus};
pub use error::EngineError;
pub use heartbeat::{Heartbeat, HeartbeatStatus, SyncProgress};
pub use lock::{AcquireOutcome, BackupLock};
pub use manifest::BackupManifest;
pub use retention::{
    execute_cleanup, plan_cleanup, CleanupPlan, CleanupReport, Planner, PruneCandidate,
    PruneReason,
};
