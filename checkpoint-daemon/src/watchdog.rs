//! Heartbeat watchdog.
//!
//! Polls the daemon heartbeat on a fixed interval, counts consecutive bad
//! polls and restarts the installed daemons through the [`DaemonManager`]
//! once the count reaches the configured threshold. Never takes the backup
//! lock.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use checkpoint_core::{config, paths, WatchdogSettings};
use checkpoint_engine::heartbeat::{self, Heartbeat, HeartbeatStatus};

use crate::alerts::{notifier_for, NotificationGate, Notifier, Severity};
use crate::error::{io_err, DaemonError};
use crate::service::{detect_manager, DaemonInfo, DaemonManager};

const STALE_CONTEXT: &str = "heartbeat-stale";
const RESTART_CONTEXT: &str = "restart";
const RESTART_FAILED_CONTEXT: &str = "restart-failed";
const BACKUP_ERROR_CONTEXT: &str = "backup-error";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchdogStatus {
    Healthy,
    Warning,
    Error,
    NoDaemons,
    Unknown,
}

/// `<home>/.checkpoint/state/watchdog.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchdogStatusFile {
    pub status: WatchdogStatus,
    pub daemon_count: usize,
    pub last_check: i64,
    pub pid: u32,
}

/// In-memory state carried between polls.
#[derive(Debug, Clone, Default)]
pub struct WatchdogState {
    pub consecutive_failures: u32,
    pub last_check: i64,
    pub notifications: NotificationGate,
}

/// Result of one poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub status: WatchdogStatus,
    pub daemon_count: usize,
    pub restarted: usize,
    pub notified: usize,
}

enum HeartbeatCheck {
    /// Missing, unreadable, stale or stopped.
    Unhealthy(String),
    /// Fresh, but the last run failed.
    Failing(Heartbeat),
    Fresh,
}

pub struct Watchdog {
    home: PathBuf,
    settings: WatchdogSettings,
    manager: Box<dyn DaemonManager>,
    notifier: Box<dyn Notifier>,
    state: WatchdogState,
}

impl Watchdog {
    pub fn new(
        home: &Path,
        settings: WatchdogSettings,
        manager: Box<dyn DaemonManager>,
        notifier: Box<dyn Notifier>,
    ) -> Self {
        let state = WatchdogState {
            notifications: NotificationGate::new(settings.notify_cooldown_secs),
            ..WatchdogState::default()
        };
        Self {
            home: home.to_path_buf(),
            settings,
            manager,
            notifier,
            state,
        }
    }

    /// Platform manager and the notifier from `settings`.
    pub fn for_platform(home: &Path, settings: WatchdogSettings) -> Self {
        let notifier = notifier_for(settings.notify_command.as_deref());
        Self::new(home, settings, detect_manager(home), notifier)
    }

    pub fn state(&self) -> &WatchdogState {
        &self.state
    }

    pub fn settings(&self) -> &WatchdogSettings {
        &self.settings
    }

    /// One poll at `now` (Unix seconds). Always writes the status file.
    pub fn tick(&mut self, now: i64) -> TickReport {
        self.state.last_check = now;
        let report = self.evaluate(now);

        let file = WatchdogStatusFile {
            status: report.status,
            daemon_count: report.daemon_count,
            last_check: now,
            pid: std::process::id(),
        };
        if let Err(e) = write_status_at(&self.home, &file) {
            tracing::warn!(error = %e, "watchdog status not written");
        }
        tracing::debug!(status = ?report.status, failures = self.state.consecutive_failures, "watchdog tick");
        report
    }

    fn evaluate(&mut self, now: i64) -> TickReport {
        let mut report = TickReport {
            status: WatchdogStatus::Unknown,
            daemon_count: 0,
            restarted: 0,
            notified: 0,
        };

        let daemons = match self.manager.list() {
            Ok(daemons) => daemons,
            Err(e) => {
                tracing::warn!(manager = self.manager.name(), error = %e, "cannot list daemons");
                return report;
            }
        };
        report.daemon_count = daemons.len();
        if daemons.is_empty() {
            self.state.consecutive_failures = 0;
            report.status = WatchdogStatus::NoDaemons;
            return report;
        }

        match self.check_heartbeat(now) {
            HeartbeatCheck::Unhealthy(problem) => {
                self.state.consecutive_failures += 1;
                let failures = self.state.consecutive_failures;
                let threshold = self.settings.failure_threshold.max(1);
                tracing::warn!(failures, threshold, "{problem}");
                report.status = WatchdogStatus::Warning;
                if self.alert(
                    STALE_CONTEXT,
                    Severity::Warning,
                    &format!("backup daemon unhealthy: {problem} ({failures}/{threshold})"),
                    now,
                ) {
                    report.notified += 1;
                }

                if failures >= threshold {
                    let (restarted, notified) = self.restart_all(&daemons, now);
                    report.restarted = restarted;
                    report.notified += notified;
                    self.state.consecutive_failures = 0;
                }
            }
            HeartbeatCheck::Failing(hb) => {
                self.state.consecutive_failures = 0;
                report.status = WatchdogStatus::Error;
                let detail = hb.error.as_deref().unwrap_or("no detail recorded");
                if self.alert(
                    BACKUP_ERROR_CONTEXT,
                    Severity::Error,
                    &format!("backup of {} failed: {detail}", hb.project),
                    now,
                ) {
                    report.notified += 1;
                }
            }
            HeartbeatCheck::Fresh => {
                self.state.consecutive_failures = 0;
                report.status = WatchdogStatus::Healthy;
            }
        }
        report
    }

    fn check_heartbeat(&self, now: i64) -> HeartbeatCheck {
        let hb = match heartbeat::read_at(&self.home) {
            Ok(Some(hb)) => hb,
            Ok(None) => return HeartbeatCheck::Unhealthy("no heartbeat recorded".to_string()),
            Err(e) => return HeartbeatCheck::Unhealthy(format!("heartbeat unreadable: {e}")),
        };
        if hb.status == HeartbeatStatus::Stopped {
            return HeartbeatCheck::Unhealthy(format!("daemon stopped (pid {})", hb.pid));
        }
        if hb.is_stale(now, self.settings.stale_after_secs) {
            return HeartbeatCheck::Unhealthy(format!(
                "heartbeat is {}s old (limit {}s)",
                hb.age_secs(now),
                self.settings.stale_after_secs
            ));
        }
        if hb.status == HeartbeatStatus::Error {
            return HeartbeatCheck::Failing(hb);
        }
        HeartbeatCheck::Fresh
    }

    /// Returns (restarted, notifications sent).
    fn restart_all(&mut self, daemons: &[DaemonInfo], now: i64) -> (usize, usize) {
        let mut restarted = 0;
        let mut notified = 0;
        for daemon in daemons {
            match self.manager.restart(daemon) {
                Ok(()) => {
                    tracing::info!(label = %daemon.label, "daemon restarted");
                    restarted += 1;
                }
                Err(e) => {
                    tracing::error!(label = %daemon.label, error = %e, "daemon restart failed");
                    if self.alert(
                        RESTART_FAILED_CONTEXT,
                        Severity::Error,
                        &format!("could not restart {}: {e}", daemon.label),
                        now,
                    ) {
                        notified += 1;
                    }
                }
            }
        }
        if restarted > 0
            && self.alert(
                RESTART_CONTEXT,
                Severity::Warning,
                &format!("restarted {restarted} backup daemon(s) after repeated stale heartbeats"),
                now,
            )
        {
            notified += 1;
        }
        (restarted, notified)
    }

    /// `true` when the message passed the cooldown and was delivered.
    fn alert(&mut self, context: &str, severity: Severity, message: &str, now: i64) -> bool {
        if !self.state.notifications.is_open(context, severity, now) {
            tracing::debug!(context, %severity, "notification suppressed by cooldown");
            return false;
        }
        // A failed delivery does not start the cooldown.
        match self.notifier.notify(severity, message) {
            Ok(()) => {
                self.state.notifications.record(context, severity, now);
                true
            }
            Err(e) => {
                tracing::warn!(context, error = %e, "notification failed");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Status file
// ---------------------------------------------------------------------------

pub fn read_status_at(home: &Path) -> Result<Option<WatchdogStatusFile>, DaemonError> {
    let path = paths::watchdog_status_path(home);
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_err(&path, e)),
    };
    Ok(Some(serde_json::from_str(&contents)?))
}

fn write_status_at(home: &Path, status: &WatchdogStatusFile) -> Result<(), DaemonError> {
    let path = paths::watchdog_status_path(home);
    let dir = paths::state_dir(home);
    std::fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;

    let json = serde_json::to_string_pretty(status)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).map_err(|e| io_err(&tmp, e))?;
    if let Err(e) = std::fs::rename(&tmp, &path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(io_err(&path, e));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Poll loop
// ---------------------------------------------------------------------------

/// Poll until `shutdown` fires. Each tick runs on the blocking pool since
/// it reads files and may spawn service-manager commands.
pub async fn run(mut watchdog: Watchdog, mut shutdown: broadcast::Receiver<()>) -> Result<(), DaemonError> {
    let period = Duration::from_secs(watchdog.settings.poll_interval_secs.max(1));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    tracing::info!(
        manager = watchdog.manager.name(),
        poll_secs = period.as_secs(),
        "watchdog started"
    );

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ticker.tick() => {
                let now = Utc::now().timestamp();
                let (returned, report) = tokio::task::spawn_blocking(move || {
                    let report = watchdog.tick(now);
                    (watchdog, report)
                })
                .await
                .map_err(|e| DaemonError::Runtime(format!("watchdog tick panicked: {e}")))?;
                watchdog = returned;
                if report.restarted > 0 {
                    tracing::info!(restarted = report.restarted, "watchdog restarted daemons");
                }
            }
        }
    }

    tracing::info!("watchdog stopped");
    Ok(())
}

/// `checkpoint watchdog [--once]`.
pub fn start_blocking(home: &Path, once: bool) -> Result<Option<TickReport>, DaemonError> {
    let settings = config::load_watchdog_settings_at(home)?;
    let mut watchdog = Watchdog::for_platform(home, settings);
    if once {
        return Ok(Some(watchdog.tick(Utc::now().timestamp())));
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err(home, e))?;

    runtime.block_on(async move {
        let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(4);
        let signals = tokio::spawn(async move {
            crate::runtime::shutdown_signal().await;
            let _ = shutdown_tx.send(());
        });
        let result = run(watchdog, shutdown_rx).await;
        signals.abort();
        result
    })?;
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use checkpoint_core::ProjectName;
    use tempfile::TempDir;

    use crate::service::ServiceSpec;

    #[derive(Clone, Default)]
    struct FakeManager {
        daemons: usize,
        fail_list: bool,
        fail_restart: bool,
        restarts: Arc<AtomicUsize>,
    }

    impl DaemonManager for FakeManager {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn list(&self) -> Result<Vec<DaemonInfo>, DaemonError> {
            if self.fail_list {
                return Err(DaemonError::Service("listing failed".into()));
            }
            Ok((0..self.daemons)
                .map(|i| DaemonInfo {
                    label: format!("dev.checkpoint.daemon{i}"),
                    definition: PathBuf::from(format!("/tmp/d{i}")),
                })
                .collect())
        }

        fn restart(&self, _daemon: &DaemonInfo) -> Result<(), DaemonError> {
            if self.fail_restart {
                return Err(DaemonError::Service("restart refused".into()));
            }
            self.restarts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn install(&self, _spec: &ServiceSpec) -> Result<PathBuf, DaemonError> {
            unreachable!()
        }

        fn uninstall(&self, _label: &str) -> Result<(), DaemonError> {
            unreachable!()
        }
    }

    #[derive(Clone, Default)]
    struct RecordingNotifier {
        sent: Arc<Mutex<Vec<(Severity, String)>>>,
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, severity: Severity, message: &str) -> Result<(), DaemonError> {
            self.sent.lock().unwrap().push((severity, message.to_string()));
            Ok(())
        }
    }

    fn write_heartbeat(home: &Path, status: HeartbeatStatus, timestamp: i64) {
        let mut hb = Heartbeat::new(&ProjectName::from("api"), status);
        hb.timestamp = timestamp;
        if status == HeartbeatStatus::Error {
            hb.error = Some("1 file(s) failed: COPY_FAILED".into());
        }
        heartbeat::write_at(home, &hb).unwrap();
    }

    fn watchdog(home: &Path, manager: FakeManager, notifier: RecordingNotifier) -> Watchdog {
        Watchdog::new(home, WatchdogSettings::default(), Box::new(manager), Box::new(notifier))
    }

    const NOW: i64 = 1_700_000_000;

    #[test]
    fn three_stale_polls_restart_exactly_once() {
        let home = TempDir::new().unwrap();
        write_heartbeat(home.path(), HeartbeatStatus::Healthy, NOW - 3_600);
        let manager = FakeManager {
            daemons: 1,
            ..FakeManager::default()
        };
        let restarts = Arc::clone(&manager.restarts);
        let mut dog = watchdog(home.path(), manager, RecordingNotifier::default());

        for (i, expected) in [1, 2].into_iter().enumerate() {
            let report = dog.tick(NOW + i as i64 * 60);
            assert_eq!(report.status, WatchdogStatus::Warning);
            assert_eq!(dog.state().consecutive_failures, expected);
        }
        let report = dog.tick(NOW + 120);
        assert_eq!(report.restarted, 1);
        assert_eq!(restarts.load(Ordering::SeqCst), 1);
        assert_eq!(dog.state().consecutive_failures, 0);
    }

    #[test]
    fn warnings_within_cooldown_notify_once() {
        let home = TempDir::new().unwrap();
        let notifier = RecordingNotifier::default();
        let sent = Arc::clone(&notifier.sent);
        let manager = FakeManager {
            daemons: 1,
            ..FakeManager::default()
        };
        let mut dog = watchdog(home.path(), manager, notifier);

        dog.tick(NOW);
        dog.tick(NOW + 60);

        let sent = sent.lock().unwrap();
        let warnings = sent.iter().filter(|(s, _)| *s == Severity::Warning).count();
        assert_eq!(warnings, 1);
    }

    /// Fails the first delivery, then accepts.
    #[derive(Clone, Default)]
    struct FlakyNotifier {
        attempts: Arc<AtomicUsize>,
    }

    impl Notifier for FlakyNotifier {
        fn notify(&self, _severity: Severity, _message: &str) -> Result<(), DaemonError> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(DaemonError::Notification("notifier exited with 1".into()));
            }
            Ok(())
        }
    }

    #[test]
    fn failed_delivery_is_retried_on_next_tick() {
        let home = TempDir::new().unwrap();
        let notifier = FlakyNotifier::default();
        let attempts = Arc::clone(&notifier.attempts);
        let manager = FakeManager {
            daemons: 1,
            ..FakeManager::default()
        };
        let mut dog = Watchdog::new(
            home.path(),
            WatchdogSettings::default(),
            Box::new(manager),
            Box::new(notifier),
        );

        assert_eq!(dog.tick(NOW).notified, 0);
        assert_eq!(
            dog.state().notifications.last_sent("heartbeat-stale", Severity::Warning),
            None
        );
        assert_eq!(dog.tick(NOW + 60).notified, 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(
            dog.state().notifications.last_sent("heartbeat-stale", Severity::Warning),
            Some(NOW + 60)
        );
    }

    #[test]
    fn no_daemons_resets_counter_without_alarm() {
        let home = TempDir::new().unwrap();
        let notifier = RecordingNotifier::default();
        let sent = Arc::clone(&notifier.sent);
        let mut dog = watchdog(home.path(), FakeManager::default(), notifier);

        let report = dog.tick(NOW);
        assert_eq!(report.status, WatchdogStatus::NoDaemons);
        assert_eq!(dog.state().consecutive_failures, 0);
        assert!(sent.lock().unwrap().is_empty());
    }

    #[test]
    fn listing_failure_is_unknown() {
        let home = TempDir::new().unwrap();
        let manager = FakeManager {
            fail_list: true,
            ..FakeManager::default()
        };
        let mut dog = watchdog(home.path(), manager, RecordingNotifier::default());
        assert_eq!(dog.tick(NOW).status, WatchdogStatus::Unknown);
    }

    #[test]
    fn fresh_error_heartbeat_alerts_without_restart() {
        let home = TempDir::new().unwrap();
        write_heartbeat(home.path(), HeartbeatStatus::Error, NOW - 10);
        let notifier = RecordingNotifier::default();
        let sent = Arc::clone(&notifier.sent);
        let manager = FakeManager {
            daemons: 1,
            ..FakeManager::default()
        };
        let restarts = Arc::clone(&manager.restarts);
        let mut dog = watchdog(home.path(), manager, notifier);

        for i in 0..4 {
            assert_eq!(dog.tick(NOW + i).status, WatchdogStatus::Error);
        }
        assert_eq!(restarts.load(Ordering::SeqCst), 0);
        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, Severity::Error);
        assert!(sent[0].1.contains("COPY_FAILED"));
    }

    #[test]
    fn healthy_heartbeat_resets_counter() {
        let home = TempDir::new().unwrap();
        let manager = FakeManager {
            daemons: 2,
            ..FakeManager::default()
        };
        let mut dog = watchdog(home.path(), manager, RecordingNotifier::default());

        write_heartbeat(home.path(), HeartbeatStatus::Stopped, NOW);
        assert_eq!(dog.tick(NOW).status, WatchdogStatus::Warning);
        assert_eq!(dog.state().consecutive_failures, 1);

        write_heartbeat(home.path(), HeartbeatStatus::Healthy, NOW + 50);
        let report = dog.tick(NOW + 60);
        assert_eq!(report.status, WatchdogStatus::Healthy);
        assert_eq!(report.daemon_count, 2);
        assert_eq!(dog.state().consecutive_failures, 0);
    }

    #[test]
    fn restart_failure_is_notified_and_polling_continues() {
        let home = TempDir::new().unwrap();
        let notifier = RecordingNotifier::default();
        let sent = Arc::clone(&notifier.sent);
        let manager = FakeManager {
            daemons: 1,
            fail_restart: true,
            ..FakeManager::default()
        };
        let mut dog = watchdog(home.path(), manager, notifier);

        for i in 0..3 {
            dog.tick(NOW + i * 60);
        }
        assert_eq!(dog.state().consecutive_failures, 0);
        assert!(sent
            .lock()
            .unwrap()
            .iter()
            .any(|(s, m)| *s == Severity::Error && m.contains("restart refused")));
        assert_eq!(dog.tick(NOW + 180).status, WatchdogStatus::Warning);
    }

    #[tokio::test]
    async fn poll_loop_stops_on_shutdown() {
        let home = TempDir::new().unwrap();
        let dog = watchdog(home.path(), FakeManager::default(), RecordingNotifier::default());
        let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);

        let handle = tokio::spawn(run(dog, shutdown_rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(()).unwrap();

        tokio_test::assert_ok!(handle.await.unwrap());
        assert!(read_status_at(home.path()).unwrap().is_some());
    }

    #[test]
    fn every_tick_writes_status_file() {
        let home = TempDir::new().unwrap();
        let mut dog = watchdog(home.path(), FakeManager::default(), RecordingNotifier::default());
        dog.tick(NOW);

        let status = read_status_at(home.path()).unwrap().expect("status file");
        assert_eq!(status.status, WatchdogStatus::NoDaemons);
        assert_eq!(status.last_check, NOW);
        assert_eq!(status.pid, std::process::id());

        let raw = std::fs::read_to_string(paths::watchdog_status_path(home.path())).unwrap();
        assert!(raw.contains("\"no_daemons\""));
    }
}
