//! Multi-round termination escalation.
//!
//! Each round runs the strategies in one canonical order and then waits for
//! the service to converge to `NotRunning`. A round never outlasts its window
//! (`round_delay`, or `stop_timeout` for the last round): the grace wait of
//! strategy b is spent out of that window. The supervisor's own pid is never
//! a target.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

use crate::error::{ProbeError, TerminationAttemptError};
use crate::log::Events;
use crate::poller;
use crate::probe::{ServiceState, StatusProbe};
use crate::signal::Signaller;
use crate::target::ServiceTarget;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// a. graceful terminate of every name + command-line match
    GracefulTerminate,
    /// b. forced kill of the matches still present after the grace wait
    ForceKillMatched,
    /// c. forced kill of every name-only match
    ForceKillByName,
    /// d. forced kill of whatever owns the port
    ForceKillPortOwner,
}

impl Strategy {
    pub fn label(self) -> &'static str {
        match self {
            Self::GracefulTerminate => "graceful terminate",
            Self::ForceKillMatched => "force kill matched",
            Self::ForceKillByName => "force kill by name",
            Self::ForceKillPortOwner => "force kill port owner",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KillTarget {
    Pid(u32),
    /// The selection a strategy used when it had no pid to act on.
    Pattern(String),
}

impl std::fmt::Display for KillTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pid(pid) => write!(f, "pid {pid}"),
            Self::Pattern(pattern) => write!(f, "{pattern}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum KillOutcome {
    Success,
    /// The process was already gone.
    Failed(String),
    Error(String),
    /// The strategy selected nothing.
    NoTargets,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KillAttempt {
    pub round: u32,
    pub strategy: Strategy,
    pub target: KillTarget,
    pub outcome: KillOutcome,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EscalationMode {
    /// All four strategies per round.
    #[default]
    Full,
    /// Forced strategies only (c and d).
    ForcedOnly,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopResult {
    pub success: bool,
    pub attempts: Vec<KillAttempt>,
    /// Rounds actually executed; 0 when the service was already stopped.
    pub rounds: u32,
    pub elapsed: Duration,
}

pub struct TerminationEscalator {
    probe: StatusProbe,
    signaller: Arc<dyn Signaller>,
    events: Events,
    own_pid: u32,
}

impl TerminationEscalator {
    pub fn new(probe: StatusProbe, signaller: Arc<dyn Signaller>, events: Events) -> Self {
        Self {
            probe,
            signaller,
            events,
            own_pid: std::process::id(),
        }
    }

    pub fn stop(&self, target: &ServiceTarget, mode: EscalationMode) -> StopResult {
        let start = Instant::now();
        let entry = self.probe.check(target);
        if entry.state == ServiceState::NotRunning {
            self.events.info("service is not running; nothing to stop");
            return StopResult {
                success: true,
                attempts: Vec::new(),
                rounds: 0,
                elapsed: start.elapsed(),
            };
        }

        self.events.info(format!(
            "stopping service on port {} ({})",
            target.port,
            entry.state.label()
        ));

        let mut attempts = Vec::new();
        for round in 1..=target.kill_rounds {
            self.events
                .info(format!("escalation round {round}/{}", target.kill_rounds));
            let round_start = Instant::now();
            let window = if round == target.kill_rounds {
                target.stop_timeout
            } else {
                target.round_delay
            };
            self.run_round(target, mode, round, window, &mut attempts);

            let convergence = poller::wait_until(
                || Ok::<_, ProbeError>(self.probe.check(target).state == ServiceState::NotRunning),
                target.poll_interval,
                window.saturating_sub(round_start.elapsed()),
            );

            if convergence.converged {
                self.events.success(format!(
                    "service stopped after {round} round(s) in {:.1}s",
                    start.elapsed().as_secs_f64()
                ));
                return StopResult {
                    success: true,
                    attempts,
                    rounds: round,
                    elapsed: start.elapsed(),
                };
            }
            self.events.warning(format!(
                "round {round} did not converge within {}ms",
                window.as_millis()
            ));
        }

        self.events.error(format!(
            "service still present after {} round(s)",
            target.kill_rounds
        ));
        StopResult {
            success: false,
            attempts,
            rounds: target.kill_rounds,
            elapsed: start.elapsed(),
        }
    }

    fn run_round(
        &self,
        target: &ServiceTarget,
        mode: EscalationMode,
        round: u32,
        window: Duration,
        attempts: &mut Vec<KillAttempt>,
    ) {
        // Pids this round already removed; later strategies skip them.
        let mut gone: HashSet<u32> = HashSet::new();

        if mode == EscalationMode::Full {
            let pattern = format!("command line ~ '{}'", target.command_line_match);
            match self.service_pids(target) {
                Ok(matched) => {
                    for &pid in &matched {
                        let result = self.signaller.terminate(pid);
                        attempts.push(self.record(round, Strategy::GracefulTerminate, pid, result));
                    }
                    if matched.is_empty() {
                        attempts.push(no_targets(round, Strategy::GracefulTerminate, &pattern));
                    } else {
                        self.grace_wait(target, &matched, target.grace_period.min(window));
                    }

                    let remaining = self.still_present(target, &matched);
                    for &pid in &remaining {
                        let result = self.signaller.kill(pid);
                        if result.is_ok() {
                            gone.insert(pid);
                        }
                        attempts.push(self.record(round, Strategy::ForceKillMatched, pid, result));
                    }
                    if remaining.is_empty() {
                        attempts.push(no_targets(round, Strategy::ForceKillMatched, &pattern));
                    }
                }
                Err(e) => {
                    for strategy in [Strategy::GracefulTerminate, Strategy::ForceKillMatched] {
                        attempts.push(selection_error(round, strategy, &pattern, &e));
                    }
                }
            }
        }

        let names = format!("name ~ {}", target.process_names.join("|"));
        let by_name = self.inspect(|| {
            Ok(self
                .probe
                .inspector()
                .list_processes()?
                .into_iter()
                .filter(|p| target.matches_name(p))
                .map(|p| p.pid)
                .collect())
        });
        self.force_kill_all(round, Strategy::ForceKillByName, &names, by_name, &mut gone, attempts);

        let port = format!("port {}", target.port);
        let owners = self.inspect(|| self.probe.inspector().port_owners(target.port));
        self.force_kill_all(round, Strategy::ForceKillPortOwner, &port, owners, &mut gone, attempts);
    }

    fn force_kill_all(
        &self,
        round: u32,
        strategy: Strategy,
        pattern: &str,
        selection: Result<Vec<u32>, ProbeError>,
        gone: &mut HashSet<u32>,
        attempts: &mut Vec<KillAttempt>,
    ) {
        let pids = match selection {
            Ok(pids) => pids,
            Err(e) => {
                attempts.push(selection_error(round, strategy, pattern, &e));
                return;
            }
        };

        let mut acted = false;
        for pid in pids {
            if gone.contains(&pid) {
                continue;
            }
            acted = true;
            let result = self.signaller.kill(pid);
            if result.is_ok() {
                gone.insert(pid);
            }
            attempts.push(self.record(round, strategy, pid, result));
        }
        if !acted {
            attempts.push(no_targets(round, strategy, pattern));
        }
    }

    /// Run a selection and drop our own pid from it.
    fn inspect<F>(&self, select: F) -> Result<Vec<u32>, ProbeError>
    where
        F: FnOnce() -> Result<Vec<u32>, ProbeError>,
    {
        let mut pids = select()?;
        pids.retain(|&pid| pid != self.own_pid);
        pids.sort_unstable();
        pids.dedup();
        Ok(pids)
    }

    fn service_pids(&self, target: &ServiceTarget) -> Result<Vec<u32>, ProbeError> {
        self.inspect(|| {
            Ok(self
                .probe
                .inspector()
                .list_processes()?
                .into_iter()
                .filter(|p| target.matches_service(p))
                .map(|p| p.pid)
                .collect())
        })
    }

    fn still_present(&self, target: &ServiceTarget, matched: &[u32]) -> Vec<u32> {
        match self.service_pids(target) {
            Ok(current) => matched
                .iter()
                .copied()
                .filter(|pid| current.contains(pid))
                .collect(),
            // Cannot tell who survived; treat them all as present.
            Err(_) => matched.to_vec(),
        }
    }

    fn grace_wait(&self, target: &ServiceTarget, matched: &[u32], limit: Duration) {
        let waited = poller::wait_until(
            || {
                let current = self.service_pids(target)?;
                Ok::<_, ProbeError>(!matched.iter().any(|pid| current.contains(pid)))
            },
            target.poll_interval,
            limit,
        );
        debug!(converged = waited.converged, elapsed = ?waited.elapsed, "grace wait finished");
    }

    fn record(
        &self,
        round: u32,
        strategy: Strategy,
        pid: u32,
        result: Result<(), TerminationAttemptError>,
    ) -> KillAttempt {
        let outcome = match result {
            Ok(()) => {
                self.events
                    .info(format!("round {round}: {} pid {pid}", strategy.label()));
                KillOutcome::Success
            }
            Err(TerminationAttemptError::NoSuchProcess { .. }) => {
                debug!(round, pid, strategy = strategy.label(), "process already exited");
                KillOutcome::Failed("already exited".to_string())
            }
            Err(e) => {
                self.events
                    .warning(format!("round {round}: {} failed: {e}", strategy.label()));
                KillOutcome::Error(e.to_string())
            }
        };
        KillAttempt {
            round,
            strategy,
            target: KillTarget::Pid(pid),
            outcome,
        }
    }
}

fn no_targets(round: u32, strategy: Strategy, pattern: &str) -> KillAttempt {
    KillAttempt {
        round,
        strategy,
        target: KillTarget::Pattern(pattern.to_string()),
        outcome: KillOutcome::NoTargets,
    }
}

fn selection_error(round: u32, strategy: Strategy, pattern: &str, e: &ProbeError) -> KillAttempt {
    KillAttempt {
        round,
        strategy,
        target: KillTarget::Pattern(pattern.to_string()),
        outcome: KillOutcome::Error(e.to_string()),
    }
}
