//! Raw facts about the host: the process table and the socket table.
//!
//! Everything above this layer depends only on [`ProcessInspector`]; the
//! concrete [`SystemInspector`] is picked at compile time per platform.
//! Every call is bounded: it either answers within the probe timeout or
//! fails with [`ProbeError`].

mod system;

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::ProbeError;

pub use system::SystemInspector;

/// One entry of the OS process table.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    /// Arguments joined with single spaces; empty when the OS hides them.
    pub command_line: String,
    pub started_at: Option<DateTime<Utc>>,
    /// `None` until the inspector has two samples to compare.
    pub cpu_percent: Option<f32>,
    /// Resident memory as a share of total physical memory.
    pub memory_percent: Option<f32>,
}

impl ProcessInfo {
    /// An entry with identity only and no resource figures.
    pub fn new(pid: u32, name: impl Into<String>, command_line: impl Into<String>) -> Self {
        Self {
            pid,
            name: name.into(),
            command_line: command_line.into(),
            started_at: None,
            cpu_percent: None,
            memory_percent: None,
        }
    }

    /// `started <time>, cpu <x>%, mem <y>%`, with `n/a` for unknown figures.
    pub fn usage_summary(&self) -> String {
        let started = self
            .started_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "n/a".to_string());
        let percent = |v: Option<f32>| v.map_or_else(|| "n/a".to_string(), |v| format!("{v:.1}%"));
        format!(
            "started {started}, cpu {}, mem {}",
            percent(self.cpu_percent),
            percent(self.memory_percent)
        )
    }
}

/// Read-only view of processes and listening sockets.
pub trait ProcessInspector: Send + Sync {
    fn list_processes(&self) -> Result<Vec<ProcessInfo>, ProbeError>;

    fn is_port_listening(&self, port: u16) -> Result<bool, ProbeError>;

    /// Pids owning a listening socket on `port`.
    fn port_owners(&self, port: u16) -> Result<Vec<u32>, ProbeError>;
}

/// Run `f` on a worker thread and give up after `timeout`.
///
/// The worker is abandoned, not cancelled: a hung OS call keeps its thread
/// until it returns on its own, but the caller regains control on time.
pub(crate) fn bounded<T, F>(method: &'static str, timeout: Duration, f: F) -> Result<T, ProbeError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ProbeError> + Send + 'static,
{
    let (tx, rx) = mpsc::sync_channel(1);
    let spawned = thread::Builder::new()
        .name(format!("warden-{}", method.replace(' ', "-")))
        .spawn(move || {
            let _ = tx.send(f());
        });

    if let Err(e) = spawned {
        return Err(ProbeError::Unavailable {
            method,
            detail: format!("failed to start worker thread: {e}"),
        });
    }

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => Err(ProbeError::Timeout { method, timeout }),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(ProbeError::Unavailable {
            method,
            detail: "worker thread panicked".to_string(),
        }),
    }
}
