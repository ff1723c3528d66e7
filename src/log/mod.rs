//! Supervisor events and the sinks that receive them.
//!
//! The core never formats output for humans beyond short event messages.
//! It hands every event to an [`Observer`]; what happens next (a terminal
//! line, a JSON-lines execution log, a UI pane) is the observer's business.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

/// Severity of a supervisor event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Info,
    Success,
    Warning,
    Error,
}

impl EventLevel {
    pub fn label(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

/// Receives supervisor events. Must tolerate calls from several threads.
pub trait Observer: Send + Sync {
    fn on_event(&self, level: EventLevel, message: &str, at: DateTime<Utc>);
}

/// Convenience wrapper stamping events with the current time.
#[derive(Clone)]
pub struct Events {
    observer: Arc<dyn Observer>,
}

impl Events {
    pub fn new(observer: Arc<dyn Observer>) -> Self {
        Self { observer }
    }

    pub fn emit(&self, level: EventLevel, message: impl AsRef<str>) {
        self.observer.on_event(level, message.as_ref(), Utc::now());
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.emit(EventLevel::Info, message);
    }

    pub fn success(&self, message: impl AsRef<str>) {
        self.emit(EventLevel::Success, message);
    }

    pub fn warning(&self, message: impl AsRef<str>) {
        self.emit(EventLevel::Warning, message);
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.emit(EventLevel::Error, message);
    }
}

/// Forwards events to `tracing`.
#[derive(Debug, Default, Clone)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn on_event(&self, level: EventLevel, message: &str, _at: DateTime<Utc>) {
        match level {
            EventLevel::Info => info!("{message}"),
            EventLevel::Success => info!(outcome = "success", "{message}"),
            EventLevel::Warning => warn!("{message}"),
            EventLevel::Error => error!("{message}"),
        }
    }
}

/// Delivers each event to every inner observer, in order.
#[derive(Default)]
pub struct Fanout {
    observers: Vec<Arc<dyn Observer>>,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observers.push(observer);
        self
    }
}

impl Observer for Fanout {
    fn on_event(&self, level: EventLevel, message: &str, at: DateTime<Utc>) {
        for observer in &self.observers {
            observer.on_event(level, message, at);
        }
    }
}

/// One line of the execution log.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    /// RFC 3339 UTC timestamp.
    pub timestamp: String,
    pub level: EventLevel,
    pub message: String,
}

/// JSON-lines execution log.
///
/// Appends one self-contained object per event, so a log survives restarts
/// of the supervisor and can be tailed or grepped.
pub struct ExecutionLog {
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl ExecutionLog {
    /// Open (or create) the log at `path`, creating parent directories.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log directory: {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file: {}", path.display()))?;

        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
            path: path.to_path_buf(),
        })
    }

    pub fn log(&self, entry: &LogEntry) -> Result<()> {
        let json = serde_json::to_string(entry).context("failed to serialize log entry")?;

        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        writeln!(writer, "{json}").context("failed to write log entry")?;
        writer.flush().context("failed to flush log")?;

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Observer for ExecutionLog {
    fn on_event(&self, level: EventLevel, message: &str, at: DateTime<Utc>) {
        let entry = LogEntry {
            timestamp: at.to_rfc3339_opts(SecondsFormat::Millis, true),
            level,
            message: message.to_string(),
        };
        // A broken log file must not take the supervisor down with it.
        if let Err(e) = self.log(&entry) {
            debug!(path = %self.path.display(), error = %e, "execution log write failed");
        }
    }
}
