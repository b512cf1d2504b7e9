//! Backup daemon: filesystem watcher, interval scheduler, cleanup ticker,
//! liveness heartbeat and log rotation feeding one serialized job processor.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use checkpoint_core::{config, paths, BackupConfig, ProjectName};
use checkpoint_detector::DEFAULT_EXCLUDED_DIRS;
use checkpoint_engine::heartbeat::{self, SyncProgress};
use checkpoint_engine::lock::{AcquireOutcome, BackupLock};
use checkpoint_engine::{retention, BackupCycle, CycleStatus};

use crate::error::{io_err, DaemonError};

const CLEANUP_CHECK_INTERVAL: Duration = Duration::from_secs(60 * 60);
const LOG_ROTATION_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
enum BackupTarget {
    All,
    Project(ProjectName),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Job {
    Backup {
        target: BackupTarget,
        source: &'static str,
    },
    /// Run retention for every project whose cleanup is due.
    Cleanup,
}

/// Load the projects to serve and block the current thread until the daemon
/// exits. `None` serves every registered project.
pub fn start_blocking(home: &Path, project: Option<&ProjectName>) -> Result<(), DaemonError> {
    init_tracing();
    let projects = match project {
        Some(name) => vec![config::load_at(home, name)?],
        None => config::list_at(home)?,
    };
    if projects.is_empty() {
        return Err(DaemonError::NoProjects);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf(), projects))
}

/// Run the daemon until SIGINT/SIGTERM or a task failure.
pub async fn run(home: PathBuf, projects: Vec<BackupConfig>) -> Result<(), DaemonError> {
    ensure_runtime_dirs(&home)?;
    let Some(first) = projects.first() else {
        return Err(DaemonError::NoProjects);
    };
    let heartbeat_project = first.project_name.clone();
    let heartbeat_period = Duration::from_secs(
        projects
            .iter()
            .map(|p| p.daemon.heartbeat_interval_secs)
            .min()
            .unwrap_or(60)
            .max(1),
    );
    let schedule_period = Duration::from_secs(
        projects
            .iter()
            .map(|p| p.detection.backup_interval_secs)
            .min()
            .unwrap_or(3600)
            .max(1),
    );

    let projects = Arc::new(projects);
    let cancel = Arc::new(AtomicBool::new(false));
    let (job_tx, job_rx) = mpsc::channel::<Job>(64);
    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    tracing::info!(
        projects = projects.len(),
        pid = std::process::id(),
        "checkpoint daemon starting"
    );

    let watcher_handle = {
        let shutdown = shutdown_tx.clone();
        let projects = projects.clone();
        let job_tx = job_tx.clone();
        tokio::spawn(async move {
            let result = watcher_task(projects, job_tx, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let scheduler_handle = {
        let shutdown = shutdown_tx.clone();
        let job_tx = job_tx.clone();
        tokio::spawn(async move {
            let result = scheduler_task(schedule_period, job_tx, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let cleanup_handle = {
        let shutdown = shutdown_tx.clone();
        let job_tx = job_tx.clone();
        tokio::spawn(async move {
            let result = cleanup_ticker_task(job_tx, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };
    drop(job_tx);

    let processor_handle = {
        let shutdown = shutdown_tx.clone();
        let home = home.clone();
        let projects = projects.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let result = processor_task(home, projects, cancel, job_rx, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let heartbeat_handle = {
        let shutdown = shutdown_tx.clone();
        let home = home.clone();
        let project = heartbeat_project.clone();
        tokio::spawn(async move {
            let result = heartbeat_task(home, project, heartbeat_period, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let rotation_handle = {
        let shutdown = shutdown_tx.clone();
        let home = home.clone();
        tokio::spawn(async move {
            let result = log_rotation_task(home, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => {}
                _ = shutdown_signal() => {
                    tracing::info!("shutdown signal received, cancelling in-flight backup");
                    cancel.store(true, Ordering::SeqCst);
                    let _ = shutdown.send(());
                }
            }
            Ok(())
        })
    };

    let (watcher, scheduler, cleanup, processor, heartbeat_result, rotation, signal) = tokio::join!(
        watcher_handle,
        scheduler_handle,
        cleanup_handle,
        processor_handle,
        heartbeat_handle,
        rotation_handle,
        signal_handle
    );

    if let Err(e) = heartbeat::stopped_at(&home, &heartbeat_project) {
        tracing::warn!(error = %e, "could not write stopped heartbeat");
    }
    tracing::info!("checkpoint daemon stopped");

    handle_join("watcher", watcher)?;
    handle_join("scheduler", scheduler)?;
    handle_join("cleanup_ticker", cleanup)?;
    handle_join("processor", processor)?;
    handle_join("heartbeat", heartbeat_result)?;
    handle_join("log_rotation", rotation)?;
    handle_join("signal_handler", signal)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

async fn watcher_task(
    projects: Arc<Vec<BackupConfig>>,
    job_tx: mpsc::Sender<Job>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let routes = EventRouter::new(&projects);

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut _watcher: RecommendedWatcher = recommended_watcher(move |event| {
        let _ = event_tx.send(event);
    })?;
    for route in &routes.routes {
        _watcher.watch(&route.root, RecursiveMode::Recursive)?;
        tracing::debug!(path = %route.root.display(), project = %route.project, "watching project");
    }

    let mut debounce = Debouncer::default();

    loop {
        let deadline = debounce.next_deadline();
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = sleep_until_opt(deadline), if deadline.is_some() => {
                for project in debounce.take_due(Instant::now()) {
                    let job = Job::Backup { target: BackupTarget::Project(project), source: "watcher" };
                    job_tx
                        .send(job)
                        .await
                        .map_err(|_| DaemonError::ChannelClosed("job queue"))?;
                }
            }
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                let event = match event {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::warn!(error = %err, "watcher event error");
                        continue;
                    }
                };
                if !is_relevant_event_kind(&event.kind) {
                    continue;
                }
                for path in &event.paths {
                    if let Some((project, quiet)) = routes.route(path) {
                        debounce.record(project.clone(), Instant::now(), quiet);
                    }
                }
            }
        }
    }

    Ok(())
}

async fn scheduler_task(
    period: Duration,
    job_tx: mpsc::Sender<Job>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    // The first tick fires immediately and catches up on changes made while
    // the daemon was down.
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                let job = Job::Backup { target: BackupTarget::All, source: "schedule" };
                job_tx
                    .send(job)
                    .await
                    .map_err(|_| DaemonError::ChannelClosed("job queue"))?;
            }
        }
    }
    Ok(())
}

async fn cleanup_ticker_task(
    job_tx: mpsc::Sender<Job>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut interval = tokio::time::interval(CLEANUP_CHECK_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                job_tx
                    .send(Job::Cleanup)
                    .await
                    .map_err(|_| DaemonError::ChannelClosed("job queue"))?;
            }
        }
    }
    Ok(())
}

async fn processor_task(
    home: PathBuf,
    projects: Arc<Vec<BackupConfig>>,
    cancel: Arc<AtomicBool>,
    mut job_rx: mpsc::Receiver<Job>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            maybe_job = job_rx.recv() => {
                let Some(job) = maybe_job else { break };
                let home = home.clone();
                let projects = projects.clone();
                let cancel = cancel.clone();
                tokio::task::spawn_blocking(move || process_job(&home, &projects, &cancel, job))
                    .await
                    .map_err(|err| DaemonError::Runtime(format!("backup job join error: {err}")))?;
            }
        }
    }
    Ok(())
}

async fn heartbeat_task(
    home: PathBuf,
    project: ProjectName,
    period: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                let home = home.clone();
                let project = project.clone();
                let touched = tokio::task::spawn_blocking(move || heartbeat::touch_at(&home, &project))
                    .await
                    .map_err(|err| DaemonError::Runtime(format!("heartbeat join error: {err}")))?;
                if let Err(err) = touched {
                    tracing::warn!(error = %err, "heartbeat tick failed");
                }
            }
        }
    }
    Ok(())
}

async fn log_rotation_task(
    home: PathBuf,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut interval = tokio::time::interval(LOG_ROTATION_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                let home = home.clone();
                // Failures are logged inside rotate_logs.
                tokio::task::spawn_blocking(move || {
                    crate::log_rotation::rotate_logs(&home);
                })
                .await
                .ok();
            }
        }
    }
    Ok(())
}

/// Resolves on SIGINT, or SIGTERM on Unix.
pub(crate) async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(err) => tracing::warn!(error = %err, "SIGTERM handler unavailable"),
        }
    }
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "ctrl-c handler failed");
        std::future::pending::<()>().await;
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

fn process_job(home: &Path, projects: &[BackupConfig], cancel: &Arc<AtomicBool>, job: Job) {
    match job {
        Job::Backup { target, source } => {
            let selected: Vec<&BackupConfig> = projects
                .iter()
                .filter(|p| match &target {
                    BackupTarget::All => true,
                    BackupTarget::Project(name) => &p.project_name == name,
                })
                .collect();
            run_backups(home, &selected, cancel, source);
        }
        Job::Cleanup => {
            for config in projects {
                if cancel.load(Ordering::SeqCst) {
                    break;
                }
                run_due_cleanup(home, config);
            }
        }
    }
}

fn run_backups(home: &Path, selected: &[&BackupConfig], cancel: &Arc<AtomicBool>, source: &str) {
    let total = selected.len();
    for (done, config) in selected.iter().enumerate() {
        if cancel.load(Ordering::SeqCst) {
            tracing::info!("backup queue cancelled");
            break;
        }
        let project = &config.project_name;
        if total > 1 {
            let progress = SyncProgress {
                projects_total: total,
                projects_done: done,
                current_project: Some(project.to_string()),
            };
            if let Err(err) = heartbeat::set_progress_at(home, project, Some(progress)) {
                tracing::warn!(error = %err, "progress heartbeat failed");
            }
        }

        match BackupCycle::new(home, config).with_cancel(Arc::clone(cancel)).run() {
            Ok(report) => {
                let (succeeded, failed) = report
                    .archive
                    .as_ref()
                    .map_or((0, 0), |a| (a.succeeded, a.failed));
                match report.status {
                    CycleStatus::Success => tracing::info!(
                        project = %project, source, changes = report.changes, succeeded,
                        "backup completed"
                    ),
                    CycleStatus::LockContention => tracing::info!(
                        project = %project, source, holder = ?report.holder_pid,
                        "backup skipped, another run holds the lock"
                    ),
                    status => tracing::warn!(
                        project = %project, source, ?status, succeeded, failed,
                        "backup finished with failures"
                    ),
                }
            }
            Err(err) => tracing::error!(project = %project, source, error = %err, "backup failed"),
        }
    }

    if total > 1 {
        if let Some(config) = selected.last() {
            if let Err(err) = heartbeat::set_progress_at(home, &config.project_name, None) {
                tracing::warn!(error = %err, "progress heartbeat failed");
            }
        }
    }
}

/// Retention outside a backup cycle, under the project lock.
fn run_due_cleanup(home: &Path, config: &BackupConfig) {
    let project = &config.project_name;
    let now = Utc::now();
    if !retention::cleanup_due_at(home, project, config.retention.cleanup_interval_hours, now) {
        return;
    }

    let mut lock = match BackupLock::acquire_at(home, project) {
        Ok(AcquireOutcome::Acquired(lock)) => lock,
        Ok(AcquireOutcome::Held { .. }) => {
            tracing::debug!(project = %project, "cleanup deferred, lock held");
            return;
        }
        Err(err) => {
            tracing::warn!(project = %project, error = %err, "cleanup lock failed");
            return;
        }
    };

    match retention::plan_cleanup(config) {
        Ok(plan) => {
            let report = retention::execute_cleanup(&plan, false);
            tracing::info!(
                project = %project,
                deleted = report.deleted_count,
                bytes_freed = report.bytes_freed,
                failures = report.failures.len(),
                "scheduled cleanup finished"
            );
            if let Err(err) = retention::mark_cleanup_at(home, project, now) {
                tracing::warn!(project = %project, error = %err, "cleanup marker not written");
            }
        }
        Err(err) => tracing::warn!(project = %project, error = %err, "cleanup planning failed"),
    }

    if let Err(err) = lock.release() {
        tracing::warn!(project = %project, error = %err, "cleanup lock release failed");
    }
}

// ---------------------------------------------------------------------------
// Event routing and debounce
// ---------------------------------------------------------------------------

struct Route {
    project: ProjectName,
    root: PathBuf,
    ignored_roots: Vec<PathBuf>,
    excluded_dirs: Vec<String>,
    quiet: Duration,
}

/// Maps filesystem event paths to the project that owns them.
struct EventRouter {
    routes: Vec<Route>,
}

impl EventRouter {
    fn new(projects: &[BackupConfig]) -> Self {
        let mut routes: Vec<Route> = projects
            .iter()
            .map(|config| {
                let mut ignored_roots = vec![canonical(&config.backup_dir)];
                ignored_roots.extend(config.secondary_backup_dir.as_deref().map(canonical));
                let mut excluded_dirs: Vec<String> =
                    DEFAULT_EXCLUDED_DIRS.iter().map(|d| (*d).to_string()).collect();
                excluded_dirs.extend(config.detection.extra_excluded_dirs.iter().cloned());
                Route {
                    project: config.project_name.clone(),
                    // FSEvents reports real paths, e.g. /private/var/... on macOS.
                    root: canonical(&config.project_root),
                    ignored_roots,
                    excluded_dirs,
                    quiet: Duration::from_secs(config.daemon.debounce_secs),
                }
            })
            .collect();
        // Nested project roots: the deepest root wins.
        routes.sort_by(|a, b| b.root.components().count().cmp(&a.root.components().count()));
        Self { routes }
    }

    fn route(&self, path: &Path) -> Option<(&ProjectName, Duration)> {
        let route = self.routes.iter().find(|r| path.starts_with(&r.root))?;
        if route.ignored_roots.iter().any(|ignored| path.starts_with(ignored)) {
            return None;
        }
        let rel = path.strip_prefix(&route.root).ok()?;
        let excluded = rel.components().any(|c| {
            let name = c.as_os_str().to_string_lossy();
            route.excluded_dirs.iter().any(|d| d.as_str() == name.as_ref())
        });
        if excluded {
            return None;
        }
        Some((&route.project, route.quiet))
    }
}

/// Quiet-period debounce: a project fires once no event arrived for it
/// during its quiet period.
#[derive(Debug, Default)]
struct Debouncer {
    deadlines: HashMap<ProjectName, Instant>,
}

impl Debouncer {
    fn record(&mut self, project: ProjectName, now: Instant, quiet: Duration) {
        self.deadlines.insert(project, now + quiet);
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    fn take_due(&mut self, now: Instant) -> Vec<ProjectName> {
        let mut due: Vec<ProjectName> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(project, _)| project.clone())
            .collect();
        due.sort();
        for project in &due {
            self.deadlines.remove(project);
        }
        due
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn is_relevant_event_kind(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

fn canonical(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

fn ensure_runtime_dirs(home: &Path) -> Result<(), DaemonError> {
    for dir in [paths::state_dir(home), paths::logs_dir(home), paths::locks_dir(home)] {
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        }
    }
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Runtime(format!("{task} task join failure: {err}"))),
    }
}

/// Install the fmt subscriber: `RUST_LOG` when set, `info` otherwise.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}
