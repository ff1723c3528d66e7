//! What is being supervised: the service identity and how to spawn it.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::TargetError;
use crate::inspector::ProcessInfo;

/// Immutable identity and timing of the supervised service.
///
/// Built once from configuration by [`ServiceTarget::new`], which rejects
/// values the escalator and poller cannot work with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceTarget {
    pub port: u16,
    /// Lowercased process-name substrings; a process matches if any is found.
    pub process_names: Vec<String>,
    /// Lowercased command-line substring; empty matches every command line.
    pub command_line_match: String,
    pub startup_timeout: Duration,
    pub stop_timeout: Duration,
    pub poll_interval: Duration,
    pub kill_rounds: u32,
    /// Convergence window after each non-final escalation round.
    pub round_delay: Duration,
    /// Wait between graceful terminate and forced kill inside a round,
    /// capped by the round's own window.
    pub grace_period: Duration,
    /// Upper bound on any single inspector call.
    pub probe_timeout: Duration,
}

/// Timing knobs for a [`ServiceTarget`], all with the documented defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timings {
    pub startup_timeout: Duration,
    pub stop_timeout: Duration,
    pub poll_interval: Duration,
    pub kill_rounds: u32,
    pub round_delay: Duration,
    pub grace_period: Duration,
    pub probe_timeout: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(15),
            stop_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(1000),
            kill_rounds: 3,
            round_delay: Duration::from_secs(2),
            grace_period: Duration::from_millis(2000),
            probe_timeout: Duration::from_millis(5000),
        }
    }
}

impl ServiceTarget {
    pub fn new<I, S>(
        port: u16,
        process_names: I,
        command_line_match: &str,
        timings: Timings,
    ) -> Result<Self, TargetError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if port == 0 {
            return Err(TargetError("port must be non-zero".to_string()));
        }

        let mut names: Vec<String> = process_names
            .into_iter()
            .map(|n| n.as_ref().trim().to_lowercase())
            .filter(|n| !n.is_empty())
            .collect();
        names.sort();
        names.dedup();
        if names.is_empty() {
            return Err(TargetError(
                "at least one process name pattern is required".to_string(),
            ));
        }

        if timings.kill_rounds == 0 {
            return Err(TargetError("kill_rounds must be at least 1".to_string()));
        }
        if timings.poll_interval.is_zero() {
            return Err(TargetError("poll interval must be non-zero".to_string()));
        }
        if timings.probe_timeout.is_zero() {
            return Err(TargetError("probe timeout must be non-zero".to_string()));
        }

        Ok(Self {
            port,
            process_names: names,
            command_line_match: command_line_match.trim().to_lowercase(),
            startup_timeout: timings.startup_timeout,
            stop_timeout: timings.stop_timeout,
            poll_interval: timings.poll_interval,
            kill_rounds: timings.kill_rounds,
            round_delay: timings.round_delay,
            grace_period: timings.grace_period,
            probe_timeout: timings.probe_timeout,
        })
    }

    /// Name matches any configured pattern (case-insensitive substring).
    pub fn matches_name(&self, process: &ProcessInfo) -> bool {
        let name = process.name.to_lowercase();
        self.process_names.iter().any(|p| name.contains(p.as_str()))
    }

    /// Name matches AND the command line carries the disambiguating substring.
    pub fn matches_service(&self, process: &ProcessInfo) -> bool {
        self.matches_name(process)
            && process
                .command_line
                .to_lowercase()
                .contains(self.command_line_match.as_str())
    }

    /// Upper bound on the time `stop()` spends waiting, grace waits included.
    pub fn stop_budget(&self) -> Duration {
        self.stop_timeout + self.round_delay * self.kill_rounds
    }
}

/// How to spawn the service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpawnSpec {
    pub program: String,
    pub args: Vec<String>,
    pub work_dir: Option<PathBuf>,
    /// Environment overrides layered on top of the supervisor's environment.
    pub env: Vec<(String, String)>,
    /// File receiving the service's stdout and stderr (appended).
    pub log_file: Option<PathBuf>,
}

impl SpawnSpec {
    pub fn display_command(&self) -> String {
        let mut out = self.program.clone();
        for arg in &self.args {
            out.push(' ');
            out.push_str(arg);
        }
        out
    }
}
