//! Watchdog notifications.
//!
//! Delivery is opaque: a [`Notifier`] receives a severity and a message.
//! [`NotificationGate`] decides whether a message goes out at all.

use std::collections::HashMap;
use std::fmt;
use std::process::Command;

use serde::{Deserialize, Serialize};

use crate::error::{io_err, DaemonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, severity: Severity, message: &str) -> Result<(), DaemonError>;
}

/// Writes notifications to the tracing log.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, severity: Severity, message: &str) -> Result<(), DaemonError> {
        match severity {
            Severity::Info => tracing::info!(%severity, "{message}"),
            Severity::Warning => tracing::warn!(%severity, "{message}"),
            Severity::Error => tracing::error!(%severity, "{message}"),
        }
        Ok(())
    }
}

/// Runs a configured command with the message appended as the last
/// argument, e.g. `["terminal-notifier", "-title", "Checkpoint", "-message"]`.
#[derive(Debug, Clone)]
pub struct CommandNotifier {
    program: String,
    args: Vec<String>,
}

impl CommandNotifier {
    /// `None` for an empty command line.
    pub fn from_command(command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

impl Notifier for CommandNotifier {
    fn notify(&self, severity: Severity, message: &str) -> Result<(), DaemonError> {
        let status = Command::new(&self.program)
            .args(&self.args)
            .arg(format!("[{severity}] {message}"))
            .status()
            .map_err(|e| io_err(&self.program, e))?;
        if status.success() {
            Ok(())
        } else {
            Err(DaemonError::Notification(format!(
                "{} exited with {status}",
                self.program
            )))
        }
    }
}

/// Notifier chosen from the watchdog settings.
pub fn notifier_for(command: Option<&[String]>) -> Box<dyn Notifier> {
    match command.and_then(CommandNotifier::from_command) {
        Some(notifier) => Box::new(notifier),
        None => Box::new(LogNotifier),
    }
}

/// Per-`(context, severity)` cooldown. Timestamps are Unix seconds.
#[derive(Debug, Clone, Default)]
pub struct NotificationGate {
    cooldown_secs: i64,
    last_sent: HashMap<(String, Severity), i64>,
}

impl NotificationGate {
    pub fn new(cooldown_secs: u64) -> Self {
        Self {
            cooldown_secs: i64::try_from(cooldown_secs).unwrap_or(i64::MAX),
            last_sent: HashMap::new(),
        }
    }

    /// `true` when nothing went out for this key within the cooldown.
    pub fn is_open(&self, context: &str, severity: Severity, now: i64) -> bool {
        match self.last_sent.get(&(context.to_string(), severity)) {
            Some(&last) => now.saturating_sub(last) >= self.cooldown_secs,
            None => true,
        }
    }

    /// Start the cooldown for this key. Call only after a delivery succeeded.
    pub fn record(&mut self, context: &str, severity: Severity, now: i64) {
        self.last_sent.insert((context.to_string(), severity), now);
    }

    /// [`is_open`](Self::is_open) followed by [`record`](Self::record).
    pub fn admit(&mut self, context: &str, severity: Severity, now: i64) -> bool {
        if !self.is_open(context, severity, now) {
            return false;
        }
        self.record(context, severity, now);
        true
    }

    pub fn last_sent(&self, context: &str, severity: Severity) -> Option<i64> {
        self.last_sent.get(&(context.to_string(), severity)).copied()
    }
}
