//! The supervisor's public face.
//!
//! A [`SupervisorController`] owns one service target, its spawn spec and
//! the last published probe result. Start, stop and restart run on the
//! caller's thread; the background [`tick`](SupervisorController::tick) and
//! [`status`](SupervisorController::status) share a single-flight guard so
//! slow probes never pile up.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::diagnose::{self, Diagnostics};
use crate::escalator::{EscalationMode, KillAttempt, StopResult, TerminationEscalator};
use crate::inspector::{ProcessInfo, ProcessInspector, SystemInspector};
use crate::launcher::{CommandSpawner, ProcessLauncher, Spawner};
use crate::log::{Events, Observer};
use crate::probe::{ProbeMethod, ProbeResult, ServiceState, StatusProbe};
use crate::signal::{Signaller, SystemSignaller};
use crate::target::{ServiceTarget, SpawnSpec};

/// Uniform result of start / stop / restart / force kill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationResult {
    pub success: bool,
    pub message: String,
    pub duration_ms: u64,
    /// Kill attempts, for operations that stop the service.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<KillAttempt>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub state: ServiceState,
    pub matched_processes: Vec<u32>,
    pub method: ProbeMethod,
    pub checked_at: DateTime<Utc>,
}

impl From<&ProbeResult> for StatusReport {
    fn from(result: &ProbeResult) -> Self {
        Self {
            state: result.state,
            matched_processes: result.matched.clone(),
            method: result.method,
            checked_at: result.checked_at,
        }
    }
}

struct SupervisorState {
    last: ProbeResult,
    last_checked: Option<DateTime<Utc>>,
    in_flight: bool,
}

/// Clears the in-flight flag even if the probe panics.
struct InFlight<'a> {
    state: &'a Mutex<SupervisorState>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        lock(self.state).in_flight = false;
    }
}

fn lock(state: &Mutex<SupervisorState>) -> MutexGuard<'_, SupervisorState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

pub struct SupervisorController {
    target: ServiceTarget,
    spawn: SpawnSpec,
    probe: StatusProbe,
    launcher: ProcessLauncher,
    escalator: TerminationEscalator,
    events: Events,
    state: Mutex<SupervisorState>,
}

impl SupervisorController {
    pub fn new(
        target: ServiceTarget,
        spawn: SpawnSpec,
        inspector: Arc<dyn ProcessInspector>,
        signaller: Arc<dyn Signaller>,
        spawner: Arc<dyn Spawner>,
        observer: Arc<dyn Observer>,
    ) -> Self {
        let events = Events::new(observer);
        let probe = StatusProbe::new(inspector, events.clone());
        let launcher = ProcessLauncher::new(spawner, probe.clone(), events.clone());
        let escalator = TerminationEscalator::new(probe.clone(), signaller, events.clone());
        Self {
            target,
            spawn,
            probe,
            launcher,
            escalator,
            events,
            state: Mutex::new(SupervisorState {
                last: ProbeResult::indeterminate(),
                last_checked: None,
                in_flight: false,
            }),
        }
    }

    /// Controller wired to this host's process table, sockets and signals.
    pub fn system(target: ServiceTarget, spawn: SpawnSpec, observer: Arc<dyn Observer>) -> Self {
        let inspector = Arc::new(SystemInspector::new(target.probe_timeout));
        Self::new(
            target,
            spawn,
            inspector,
            Arc::new(SystemSignaller),
            Arc::new(CommandSpawner),
            observer,
        )
    }

    pub fn target(&self) -> &ServiceTarget {
        &self.target
    }

    pub fn spawn_spec(&self) -> &SpawnSpec {
        &self.spawn
    }

    pub fn start(&self) -> OperationResult {
        let started = Instant::now();
        let current = self.probe.check(&self.target);
        self.publish(current.clone());

        if current.state == ServiceState::Running {
            self.events.info("service already running");
            return OperationResult {
                success: true,
                message: "already running".to_string(),
                duration_ms: millis(started.elapsed()),
                attempts: Vec::new(),
            };
        }

        let launch = self.launcher.start(&self.target, &self.spawn);
        self.publish(self.probe.check(&self.target));
        OperationResult {
            success: launch.success,
            message: launch.reason,
            duration_ms: millis(started.elapsed()),
            attempts: Vec::new(),
        }
    }

    pub fn stop(&self) -> OperationResult {
        self.escalate(EscalationMode::Full)
    }

    /// Stop with forced strategies only.
    pub fn force_kill(&self) -> OperationResult {
        self.escalate(EscalationMode::ForcedOnly)
    }

    /// Stop, then start. Never starts while the previous instance may still
    /// hold the port.
    pub fn restart(&self) -> OperationResult {
        let started = Instant::now();
        self.events.info("restarting service");

        let first = self.escalator.stop(&self.target, EscalationMode::Full);
        let mut attempts = first.attempts;
        if !first.success {
            self.events
                .warning("stop did not converge; running another escalation pass");
            let retry = self.escalator.stop(&self.target, EscalationMode::Full);
            attempts.extend(retry.attempts.into_iter().map(|mut a| {
                a.round += first.rounds;
                a
            }));
            if !retry.success {
                self.publish(self.probe.check(&self.target));
                let message =
                    "restart aborted: previous instance still present after escalation".to_string();
                self.events.error(&message);
                return OperationResult {
                    success: false,
                    message,
                    duration_ms: millis(started.elapsed()),
                    attempts,
                };
            }
        }

        let launch = self.launcher.start(&self.target, &self.spawn);
        self.publish(self.probe.check(&self.target));
        OperationResult {
            success: launch.success,
            message: launch.reason,
            duration_ms: millis(started.elapsed()),
            attempts,
        }
    }

    /// Current status. While another check is in flight this returns the
    /// last published result instead of probing again.
    pub fn status(&self) -> StatusReport {
        match self.guarded_check() {
            Some(result) => StatusReport::from(&result),
            None => self.last_status(),
        }
    }

    /// One scheduler tick. Returns `None` when skipped because a check was
    /// already running.
    pub fn tick(&self) -> Option<StatusReport> {
        let result = self.guarded_check();
        if result.is_none() {
            debug!("status check in flight; skipping tick");
        }
        result.as_ref().map(StatusReport::from)
    }

    pub fn last_status(&self) -> StatusReport {
        StatusReport::from(&lock(&self.state).last)
    }

    /// When the last published check completed, if any has.
    pub fn last_checked(&self) -> Option<DateTime<Utc>> {
        lock(&self.state).last_checked
    }

    pub fn diagnose(&self) -> Diagnostics {
        diagnose::collect(&self.target, self.probe.inspector().as_ref())
    }

    /// Process-table details (start time, CPU, memory) for reported pids.
    pub fn describe(&self, pids: &[u32]) -> Result<Vec<ProcessInfo>, String> {
        diagnose::describe(pids, self.probe.inspector().as_ref())
    }

    fn escalate(&self, mode: EscalationMode) -> OperationResult {
        let started = Instant::now();
        let result = self.escalator.stop(&self.target, mode);
        self.publish(self.probe.check(&self.target));
        OperationResult {
            success: result.success,
            message: stop_message(&result),
            duration_ms: millis(started.elapsed()),
            attempts: result.attempts,
        }
    }

    fn guarded_check(&self) -> Option<ProbeResult> {
        {
            let mut state = lock(&self.state);
            if state.in_flight {
                return None;
            }
            state.in_flight = true;
        }
        let _guard = InFlight { state: &self.state };

        let result = self.probe.check(&self.target);
        self.publish(result.clone());
        Some(result)
    }

    /// Keep the most recently completed result and report state changes.
    /// A result that completed before the one already held is dropped.
    fn publish(&self, result: ProbeResult) {
        let current = result.state;
        let previous = {
            let mut state = lock(&self.state);
            if result.checked_at < state.last.checked_at {
                debug!(state = current.label(), "dropping stale probe result");
                return;
            }
            state.last_checked = Some(result.checked_at);
            std::mem::replace(&mut state.last, result).state
        };

        if previous != current {
            let message = format!("service is {}", current.label());
            match current {
                ServiceState::Running => self.events.success(message),
                ServiceState::NotRunning => self.events.info(message),
                ServiceState::ProcessPresentPortClosed | ServiceState::Indeterminate => {
                    self.events.warning(message)
                }
            }
        }
    }
}

fn stop_message(result: &StopResult) -> String {
    if result.success && result.rounds == 0 {
        "service was not running".to_string()
    } else if result.success {
        format!("service stopped after {} round(s)", result.rounds)
    } else {
        format!(
            "service still present after {} round(s); see attempts",
            result.rounds
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::EventLevel;
    use crate::target::Timings;
    use crate::testing::{EventLog, FakeHost, RecordingObserver, Signal, SpawnBehavior};
    use std::thread;

    fn fast_target() -> ServiceTarget {
        ServiceTarget::new(
            8080,
            ["node"],
            "rssfeed",
            Timings {
                startup_timeout: Duration::from_secs(2),
                stop_timeout: Duration::from_millis(100),
                poll_interval: Duration::from_millis(5),
                kill_rounds: 3,
                round_delay: Duration::from_millis(30),
                grace_period: Duration::from_millis(10),
                ..Timings::default()
            },
        )
        .unwrap()
    }

    fn controller(host: &Arc<FakeHost>) -> (SupervisorController, EventLog) {
        let (observer, log) = RecordingObserver::new();
        let controller = SupervisorController::new(
            fast_target(),
            SpawnSpec {
                program: "npx".to_string(),
                args: vec!["tsx".to_string(), "rssfeed.ts".to_string()],
                ..SpawnSpec::default()
            },
            host.clone(),
            host.clone(),
            host.clone(),
            observer,
        );
        (controller, log)
    }

    #[test]
    fn status_with_nothing_running() {
        let host = FakeHost::new();
        let (controller, _) = controller(&host);

        let report = controller.status();
        assert_eq!(report.state, ServiceState::NotRunning);
        assert!(report.matched_processes.is_empty());
        assert!(controller.last_checked().is_some());
    }

    #[test]
    fn start_confirms_listening_service() {
        let host = FakeHost::new();
        host.on_spawn(SpawnBehavior::listens_after(8080, Duration::from_millis(40)));
        let (controller, _) = controller(&host);

        let result = controller.start();
        assert!(result.success, "{}", result.message);
        assert!(result.message.contains("after"));
        assert!(result.duration_ms <= 15_000);
        assert_eq!(controller.last_status().state, ServiceState::Running);
    }

    #[test]
    fn start_when_running_never_spawns() {
        let host = FakeHost::new();
        let pid = host.add_process("node", "node rssfeed.ts");
        host.listen(8080, pid);
        let (controller, _) = controller(&host);

        let result = controller.start();
        assert!(result.success);
        assert_eq!(result.message, "already running");
        assert_eq!(host.spawn_count(), 0);
    }

    #[test]
    fn start_from_degraded_state_spawns() {
        let host = FakeHost::new();
        host.add_process("node", "node rssfeed.ts");
        host.on_spawn(SpawnBehavior::listens_after(8080, Duration::ZERO));
        let (controller, _) = controller(&host);

        let result = controller.start();
        assert!(result.success);
        assert_eq!(host.spawn_count(), 1);
    }

    #[test]
    fn status_under_port_check_failure_is_definitive() {
        let host = FakeHost::new();
        host.add_process("node", "node rssfeed.ts");
        host.fail_port_checks(true);
        let (controller, _) = controller(&host);

        let report = controller.status();
        assert_ne!(report.state, ServiceState::Indeterminate);
        assert_eq!(report.state, ServiceState::ProcessPresentPortClosed);
    }

    #[test]
    fn stale_result_never_replaces_a_newer_one() {
        let host = FakeHost::new();
        let pid = host.add_process("node", "node rssfeed.ts");
        host.listen(8080, pid);
        let (controller, log) = controller(&host);

        let fresh = controller.status();
        assert_eq!(fresh.state, ServiceState::Running);
        let events_before = log.lock().unwrap().len();

        controller.publish(ProbeResult {
            state: ServiceState::NotRunning,
            matched: Vec::new(),
            method: ProbeMethod::PortListener,
            checked_at: fresh.checked_at - chrono::Duration::seconds(1),
        });

        assert_eq!(controller.last_status(), fresh);
        assert_eq!(controller.last_checked(), Some(fresh.checked_at));
        assert_eq!(log.lock().unwrap().len(), events_before);
    }

    #[test]
    fn describe_reports_matched_process_details() {
        let host = FakeHost::new();
        let pid = host.add_process("node", "node rssfeed.ts");
        host.listen(8080, pid);
        host.set_usage(pid, 7.0, 0.25);
        let (controller, _) = controller(&host);

        let report = controller.status();
        let details = controller.describe(&report.matched_processes).unwrap();
        assert_eq!(details.len(), 1);
        assert_eq!(details[0].pid, pid);
        assert_eq!(details[0].cpu_percent, Some(7.0));
        assert_eq!(details[0].memory_percent, Some(0.25));
        assert!(details[0].started_at.is_some());
    }

    #[test]
    fn stop_is_idempotent() {
        let host = FakeHost::new();
        let (controller, _) = controller(&host);

        let result = controller.stop();
        assert!(result.success);
        assert!(result.attempts.is_empty());
        assert_eq!(result.message, "service was not running");
        assert!(host.signals().is_empty());
    }

    #[test]
    fn start_then_stop_converges_within_budget() {
        let host = FakeHost::new();
        host.on_spawn(SpawnBehavior::listens_after(8080, Duration::ZERO));
        let (controller, _) = controller(&host);

        assert!(controller.start().success);
        let stop = controller.stop();
        assert!(stop.success);
        assert!(u128::from(stop.duration_ms) <= controller.target().stop_budget().as_millis());
        assert_eq!(controller.status().state, ServiceState::NotRunning);
    }

    #[test]
    fn force_kill_skips_graceful_terminate() {
        let host = FakeHost::new();
        let pid = host.add_process("node", "node rssfeed.ts");
        host.listen(8080, pid);
        let (controller, _) = controller(&host);

        let result = controller.force_kill();
        assert!(result.success);
        assert_eq!(host.signals(), vec![(pid, Signal::Kill)]);
    }

    #[test]
    fn restart_matches_stop_then_start() {
        let sequential = {
            let host = FakeHost::new();
            let pid = host.add_process("node", "node rssfeed.ts");
            host.listen(8080, pid);
            host.on_spawn(SpawnBehavior::listens_after(8080, Duration::ZERO));
            let (controller, _) = controller(&host);
            let stop = controller.stop();
            let start = controller.start();
            (stop.attempts.len(), start.success, host.spawn_count(), host.signals().len())
        };

        let restarted = {
            let host = FakeHost::new();
            let pid = host.add_process("node", "node rssfeed.ts");
            host.listen(8080, pid);
            host.on_spawn(SpawnBehavior::listens_after(8080, Duration::ZERO));
            let (controller, _) = controller(&host);
            let restart = controller.restart();
            (restart.attempts.len(), restart.success, host.spawn_count(), host.signals().len())
        };

        assert_eq!(sequential, restarted);
        assert_eq!(restarted.2, 1);
    }

    #[test]
    fn restart_runs_extra_pass_before_starting() {
        let host = FakeHost::new();
        // Survives every forced kill of the first pass (3 rounds x 3 kills).
        let pid = host.add_stubborn_process("node", "node rssfeed.ts", true, 9);
        host.listen(8080, pid);
        host.on_spawn(SpawnBehavior::listens_after(8080, Duration::ZERO));
        let (controller, log) = controller(&host);

        let result = controller.restart();
        assert!(result.success, "{}", result.message);
        assert!(result.attempts.iter().any(|a| a.round > 3));
        assert_eq!(host.spawn_count(), 1);
        assert!(
            log.lock()
                .unwrap()
                .iter()
                .any(|e| e.message.contains("another escalation pass"))
        );
    }

    #[test]
    fn restart_never_starts_over_a_survivor() {
        let host = FakeHost::new();
        let pid = host.add_stubborn_process("node", "node rssfeed.ts", true, u32::MAX);
        host.listen(8080, pid);
        let (controller, _) = controller(&host);

        let result = controller.restart();
        assert!(!result.success);
        assert!(result.message.contains("restart aborted"));
        assert_eq!(host.spawn_count(), 0);
    }

    #[test]
    fn concurrent_status_probes_once() {
        let host = FakeHost::new();
        host.slow_probes(Duration::from_millis(200));
        let (controller, _) = controller(&host);
        let controller = Arc::new(controller);

        let first = {
            let controller = controller.clone();
            thread::spawn(move || controller.status())
        };
        thread::sleep(Duration::from_millis(50));
        let second = controller.status();
        let first = first.join().unwrap();

        assert_eq!(host.probe_calls(), 1);
        assert_eq!(first.state, ServiceState::NotRunning);
        // The second caller saw the state published before the probe finished.
        assert_eq!(second.state, ServiceState::Indeterminate);
    }

    #[test]
    fn tick_skips_while_in_flight() {
        let host = FakeHost::new();
        host.slow_probes(Duration::from_millis(200));
        let (controller, _) = controller(&host);
        let controller = Arc::new(controller);

        let busy = {
            let controller = controller.clone();
            thread::spawn(move || controller.tick())
        };
        thread::sleep(Duration::from_millis(50));
        assert!(controller.tick().is_none());
        assert!(busy.join().unwrap().is_some());
        assert_eq!(host.probe_calls(), 1);
    }

    #[test]
    fn transitions_are_reported_once() {
        let host = FakeHost::new();
        let (controller, log) = controller(&host);

        controller.tick();
        controller.tick();
        controller.tick();

        let changes: Vec<_> = log
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.message.starts_with("service is"))
            .cloned()
            .collect();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].level, EventLevel::Info);
        assert_eq!(changes[0].message, "service is not running");
    }

    #[test]
    fn diagnose_uses_the_controller_inspector() {
        let host = FakeHost::new();
        let pid = host.add_process("node", "node rssfeed.ts");
        host.listen(8080, pid);
        let (controller, _) = controller(&host);

        let diag = controller.diagnose();
        assert_eq!(diag.port_owners.unwrap()[0].pid, pid);
    }

    #[test]
    #[serial_test::serial]
    fn system_controller_sees_a_real_listener() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let target =
            ServiceTarget::new(port, ["warden-test-no-such-name"], "", Timings::default()).unwrap();
        let (observer, _) = RecordingObserver::new();

        let controller = SupervisorController::system(target, SpawnSpec::default(), observer);
        let report = controller.status();
        assert_eq!(report.state, ServiceState::Running);
        assert_eq!(report.method, ProbeMethod::PortListener);
        assert!(report.matched_processes.is_empty());
    }

    #[test]
    fn operation_result_serializes_without_empty_attempts() {
        let result = OperationResult {
            success: true,
            message: "already running".to_string(),
            duration_ms: 3,
            attempts: Vec::new(),
        };
        let json = serde_json::to_value(&result).unwrap();
        assert!(json.get("attempts").is_none());
        assert_eq!(json["duration_ms"], 3);
    }
}
