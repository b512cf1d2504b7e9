//! Cross-process backup lock.
//!
//! ```text
//! <home>/.checkpoint/locks/
//!   <project>.lock/        directory creation is the mutex
//!     pid                  decimal PID of the holder
//! ```
//!
//! ## Acquire protocol
//!
//! 1. Write the caller's PID to a uniquely named temp file in the lock root.
//! 2. `create_dir(<project>.lock)`; success means the lock is ours.
//! 3. Rename the temp file into the directory as `pid`.
//! 4. On `AlreadyExists` read the holder PID (re-reading once after 100 ms if
//!    the file is not there yet). A live holder yields [`AcquireOutcome::Held`].
//!    A dead or unreadable holder is stale and the whole protocol is retried
//!    exactly once after reclaiming it.
//!
//! ## Stale reclaim
//!
//! Removal is serialized by a sibling `<project>.lock.reclaim` directory.
//! Under it the holder is read again, and the lock directory is only renamed
//! to a unique tombstone (then deleted) when it still names the same dead
//! holder. A live lock is never removed by a contender, so a stale lock can
//! be reclaimed by at most one of them.
//!
//! The lock is released by [`BackupLock::release`] or on drop, and only if the
//! `pid` file still names the owner.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;

use checkpoint_core::{paths, ProjectName};

use crate::error::{io_err, EngineError};

const PID_FILE: &str = "pid";
const CREATION_RACE_WAIT: Duration = Duration::from_millis(100);
/// A reclaim guard older than this was left by a crashed contender.
const RECLAIM_GUARD_TTL: Duration = Duration::from_secs(10);

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Result of an acquisition attempt. Contention is an expected outcome, not
/// an error.
#[derive(Debug)]
pub enum AcquireOutcome {
    Acquired(BackupLock),
    /// Another live process holds the lock. `holder_pid` is `None` when the
    /// holder could not be identified after losing the stale-recovery race.
    Held { holder_pid: Option<u32> },
}

/// Exclusive right to run a backup for one project on this host.
#[derive(Debug)]
pub struct BackupLock {
    project: ProjectName,
    lock_dir: PathBuf,
    holder_pid: u32,
    released: bool,
}

enum Holder {
    Alive(u32),
    Stale(Option<u32>),
}

enum Reclaim {
    /// The stale directory is gone; retry the acquisition.
    Removed,
    /// Someone else removed it first.
    Vanished,
    /// Another contender is reclaiming, or the lock changed hands.
    Held(Option<u32>),
}

/// Serializes stale-lock removal for one project: `<project>.lock.reclaim`.
/// Removed on drop.
struct ReclaimGuard {
    path: PathBuf,
}

// ---------------------------------------------------------------------------
// Acquire / release
// ---------------------------------------------------------------------------

impl BackupLock {
    /// Acquire the lock for `project` under `<home>/.checkpoint/locks/`.
    pub fn acquire_at(home: &Path, project: &ProjectName) -> Result<AcquireOutcome, EngineError> {
        Self::acquire_in(&paths::locks_dir(home), project, std::process::id())
    }

    /// Acquire the lock in an explicit lock root on behalf of `pid`.
    pub fn acquire_in(
        lock_root: &Path,
        project: &ProjectName,
        pid: u32,
    ) -> Result<AcquireOutcome, EngineError> {
        std::fs::create_dir_all(lock_root).map_err(|e| io_err(lock_root, e))?;
        let lock_dir = lock_root.join(format!("{}.lock", project.as_str()));
        let tmp = unique_tmp_path(lock_root, project, pid);
        std::fs::write(&tmp, pid.to_string()).map_err(|e| io_err(&tmp, e))?;

        let outcome = Self::contend(&lock_dir, &tmp, project, pid);
        // Only a successful acquisition consumes the temp file.
        let _ = std::fs::remove_file(&tmp);
        outcome
    }

    fn contend(
        lock_dir: &Path,
        tmp: &Path,
        project: &ProjectName,
        pid: u32,
    ) -> Result<AcquireOutcome, EngineError> {
        for attempt in 0..2 {
            match std::fs::create_dir(lock_dir) {
                Ok(()) => return Self::claim(lock_dir, tmp, project, pid),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => match read_holder(lock_dir) {
                    Holder::Alive(holder) => {
                        return Ok(AcquireOutcome::Held {
                            holder_pid: Some(holder),
                        })
                    }
                    Holder::Stale(observed) if attempt == 0 => {
                        match reclaim_stale(lock_dir, observed)? {
                            Reclaim::Removed | Reclaim::Vanished => {}
                            Reclaim::Held(holder_pid) => {
                                return Ok(AcquireOutcome::Held { holder_pid })
                            }
                        }
                    }
                    Holder::Stale(_) => return Ok(AcquireOutcome::Held { holder_pid: None }),
                },
                Err(e) => return Err(io_err(lock_dir, e)),
            }
        }
        Ok(AcquireOutcome::Held { holder_pid: None })
    }

    /// We created the directory; move our PID file in.
    fn claim(
        lock_dir: &Path,
        tmp: &Path,
        project: &ProjectName,
        pid: u32,
    ) -> Result<AcquireOutcome, EngineError> {
        let pid_file = lock_dir.join(PID_FILE);
        if let Err(e) = std::fs::rename(tmp, &pid_file) {
            if e.kind() == ErrorKind::NotFound && !lock_dir.exists() {
                // Reclaimed as PID-less before our PID landed.
                return Ok(AcquireOutcome::Held { holder_pid: None });
            }
            // Still empty, so only our own directory can be removed here.
            let _ = std::fs::remove_dir(lock_dir);
            return Err(io_err(pid_file, e));
        }
        tracing::debug!("lock acquired: {} (pid {pid})", lock_dir.display());
        Ok(AcquireOutcome::Acquired(BackupLock {
            project: project.clone(),
            lock_dir: lock_dir.to_path_buf(),
            holder_pid: pid,
            released: false,
        }))
    }

    pub fn project(&self) -> &ProjectName {
        &self.project
    }

    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }

    pub fn holder_pid(&self) -> u32 {
        self.holder_pid
    }

    /// Remove the lock directory if it is still ours. Idempotent.
    pub fn release(&mut self) -> Result<(), EngineError> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        match read_pid(&self.lock_dir) {
            Ok(Some(recorded)) if recorded == self.holder_pid => {}
            Ok(other) => {
                tracing::warn!(
                    "not releasing {}: recorded holder {:?} is not pid {}",
                    self.lock_dir.display(),
                    other,
                    self.holder_pid
                );
                return Ok(());
            }
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(io_err(self.lock_dir.join(PID_FILE), e)),
        }

        match std::fs::remove_dir_all(&self.lock_dir) {
            Ok(()) => {
                tracing::debug!("lock released: {}", self.lock_dir.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&self.lock_dir, e)),
        }
    }
}

impl Drop for BackupLock {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::error!("failed to release lock: {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// Inspection
// ---------------------------------------------------------------------------

/// PID recorded in the lock for `project`, if the lock exists.
pub fn current_holder_at(home: &Path, project: &ProjectName) -> Option<u32> {
    let lock_dir = paths::locks_dir(home).join(format!("{}.lock", project.as_str()));
    read_pid(&lock_dir).ok().flatten()
}

/// `kill(pid, 0)` liveness check. `EPERM` means the process exists but
/// belongs to someone else, so it counts as alive.
pub fn is_pid_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn reclaim_stale(lock_dir: &Path, observed: Option<u32>) -> Result<Reclaim, EngineError> {
    let Some(_guard) = ReclaimGuard::try_acquire(lock_dir)? else {
        return Ok(Reclaim::Held(None));
    };
    if !lock_dir.exists() {
        return Ok(Reclaim::Vanished);
    }
    match read_holder(lock_dir) {
        Holder::Alive(holder) => return Ok(Reclaim::Held(Some(holder))),
        Holder::Stale(now) if now != observed => return Ok(Reclaim::Held(None)),
        Holder::Stale(_) => {}
    }

    let tombstone = sibling_path(lock_dir, "stale");
    match std::fs::rename(lock_dir, &tombstone) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Reclaim::Vanished),
        Err(e) => return Err(io_err(lock_dir, e)),
    }
    tracing::warn!(
        "removed stale lock {} (holder {})",
        lock_dir.display(),
        observed.map_or_else(|| "unknown".to_string(), |p| p.to_string())
    );
    if let Err(e) = std::fs::remove_dir_all(&tombstone) {
        tracing::warn!("could not delete {}: {e}", tombstone.display());
    }
    Ok(Reclaim::Removed)
}

impl ReclaimGuard {
    fn try_acquire(lock_dir: &Path) -> Result<Option<Self>, EngineError> {
        let mut name = lock_dir.as_os_str().to_os_string();
        name.push(".reclaim");
        let path = PathBuf::from(name);
        for _ in 0..2 {
            match std::fs::create_dir(&path) {
                Ok(()) => return Ok(Some(Self { path })),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if !guard_abandoned(&path) {
                        return Ok(None);
                    }
                    tracing::warn!("removing abandoned reclaim guard {}", path.display());
                    let _ = std::fs::remove_dir(&path);
                }
                Err(e) => return Err(io_err(&path, e)),
            }
        }
        Ok(None)
    }
}

impl Drop for ReclaimGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir(&self.path) {
            tracing::warn!("could not remove {}: {e}", self.path.display());
        }
    }
}

fn guard_abandoned(path: &Path) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.elapsed().ok())
        .is_some_and(|age| age > RECLAIM_GUARD_TTL)
}

/// `<lock_dir>.<tag>.<pid>.<seq>`, unique within this host.
fn sibling_path(lock_dir: &Path, tag: &str) -> PathBuf {
    let seq = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut name = lock_dir.as_os_str().to_os_string();
    name.push(format!(".{tag}.{}.{seq}", std::process::id()));
    PathBuf::from(name)
}

fn read_holder(lock_dir: &Path) -> Holder {
    let first = read_pid(lock_dir);
    let recorded = match first {
        Err(e) if e.kind() == ErrorKind::NotFound => {
            // The winner may not have renamed its PID file in yet.
            std::thread::sleep(CREATION_RACE_WAIT);
            read_pid(lock_dir).ok().flatten()
        }
        other => other.ok().flatten(),
    };
    match recorded {
        Some(pid) if is_pid_alive(pid) => Holder::Alive(pid),
        other => Holder::Stale(other),
    }
}

/// `Ok(None)` when the file exists but does not hold a PID.
fn read_pid(lock_dir: &Path) -> std::io::Result<Option<u32>> {
    let contents = std::fs::read_to_string(lock_dir.join(PID_FILE))?;
    Ok(contents.trim().parse().ok())
}

fn unique_tmp_path(lock_root: &Path, project: &ProjectName, pid: u32) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    let seq = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    lock_root.join(format!(".{}.{pid}.{nanos}.{seq}.tmp", project.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn project() -> ProjectName {
        ProjectName::from("api")
    }

    #[test]
    fn acquire_writes_pid_and_release_removes_directory() {
        let root = TempDir::new().unwrap();
        let outcome = BackupLock::acquire_in(root.path(), &project(), std::process::id()).unwrap();
        let AcquireOutcome::Acquired(mut lock) = outcome else {
            panic!("expected acquisition");
        };
        let pid = std::fs::read_to_string(lock.lock_dir().join("pid")).unwrap();
        assert_eq!(pid, std::process::id().to_string());

        lock.release().unwrap();
        assert!(!root.path().join("api.lock").exists());
        // Second release is a no-op.
        lock.release().unwrap();
    }

    #[test]
    fn no_temp_files_are_left_behind() {
        let root = TempDir::new().unwrap();
        let first = BackupLock::acquire_in(root.path(), &project(), std::process::id()).unwrap();
        let second = BackupLock::acquire_in(root.path(), &project(), std::process::id()).unwrap();
        assert!(matches!(second, AcquireOutcome::Held { .. }));

        let leftovers: Vec<_> = std::fs::read_dir(root.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "temp files: {leftovers:?}");
        drop(first);
    }

    #[test]
    fn release_leaves_foreign_lock_alone() {
        let root = TempDir::new().unwrap();
        let AcquireOutcome::Acquired(mut lock) =
            BackupLock::acquire_in(root.path(), &project(), std::process::id()).unwrap()
        else {
            panic!("expected acquisition");
        };
        // Another process reclaimed the directory in the meantime.
        std::fs::write(lock.lock_dir().join("pid"), "1").unwrap();
        lock.release().unwrap();
        assert!(root.path().join("api.lock").exists());
    }

    #[test]
    fn pid_liveness() {
        assert!(is_pid_alive(std::process::id()));
        assert!(!is_pid_alive(0));
        assert!(!is_pid_alive(u32::MAX));
    }
}
