//! Liveness probing with graceful degradation.
//!
//! No single signal is reliable: the socket table can be unreadable, the
//! service can be wrapped by a shell, and the process table can hide command
//! lines. The probe asks both independent methods and only reports
//! `Indeterminate` when neither produced an answer.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::error::ProbeError;
use crate::inspector::{ProcessInfo, ProcessInspector};
use crate::log::Events;
use crate::target::ServiceTarget;

/// Liveness of the supervised service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    /// The port was observed listening.
    Running,
    /// A matching process exists but the port was not observed listening.
    ProcessPresentPortClosed,
    /// Confirmed absent.
    NotRunning,
    /// No method could tell. Never treat as `NotRunning`.
    Indeterminate,
}

impl ServiceState {
    pub fn label(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::ProcessPresentPortClosed => "process present, port closed",
            Self::NotRunning => "not running",
            Self::Indeterminate => "indeterminate",
        }
    }
}

/// Which evidence produced a [`ProbeResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeMethod {
    PortListener,
    ProcessTable,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
    pub state: ServiceState,
    /// Pids matching name and command line at this check.
    pub matched: Vec<u32>,
    pub method: ProbeMethod,
    pub checked_at: DateTime<Utc>,
}

impl ProbeResult {
    pub fn indeterminate() -> Self {
        Self {
            state: ServiceState::Indeterminate,
            matched: Vec::new(),
            method: ProbeMethod::None,
            checked_at: Utc::now(),
        }
    }
}

/// Combines inspector facts into a [`ProbeResult`].
#[derive(Clone)]
pub struct StatusProbe {
    inspector: Arc<dyn ProcessInspector>,
    events: Events,
}

impl StatusProbe {
    pub fn new(inspector: Arc<dyn ProcessInspector>, events: Events) -> Self {
        Self { inspector, events }
    }

    pub fn check(&self, target: &ServiceTarget) -> ProbeResult {
        let port = self.inspector.is_port_listening(target.port);
        if let Err(e) = &port {
            self.report(e);
        }

        let processes = self.inspector.list_processes();
        if let Err(e) = &processes {
            self.report(e);
        }

        let result = classify(target, port, processes);
        debug!(
            state = result.state.label(),
            matched = ?result.matched,
            method = ?result.method,
            "probe complete"
        );
        result
    }

    pub fn inspector(&self) -> &Arc<dyn ProcessInspector> {
        &self.inspector
    }

    fn report(&self, error: &ProbeError) {
        self.events
            .warning(format!("{} failed: {error}", error.method()));
    }
}

/// Ordered fallback over the two methods' results.
pub(crate) fn classify(
    target: &ServiceTarget,
    port: Result<bool, ProbeError>,
    processes: Result<Vec<ProcessInfo>, ProbeError>,
) -> ProbeResult {
    let matched: Option<Vec<u32>> = processes.ok().map(|list| {
        let mut pids: Vec<u32> = list
            .iter()
            .filter(|p| target.matches_service(p))
            .map(|p| p.pid)
            .collect();
        pids.sort_unstable();
        pids
    });

    let (state, method) = match (port, &matched) {
        (Ok(true), _) => (ServiceState::Running, ProbeMethod::PortListener),
        (_, Some(pids)) if !pids.is_empty() => {
            (ServiceState::ProcessPresentPortClosed, ProbeMethod::ProcessTable)
        }
        (_, Some(_)) => (ServiceState::NotRunning, ProbeMethod::ProcessTable),
        (Ok(false), None) => (ServiceState::NotRunning, ProbeMethod::PortListener),
        (Err(_), None) => (ServiceState::Indeterminate, ProbeMethod::None),
    };

    ProbeResult {
        state,
        matched: matched.unwrap_or_default(),
        method,
        checked_at: Utc::now(),
    }
}
