//! In-memory host for tests: a process table, a socket table, a signaller
//! and a spawner that all share one state.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::error::{LaunchError, ProbeError, TerminationAttemptError};
use crate::inspector::{ProcessInfo, ProcessInspector};
use crate::launcher::Spawner;
use crate::log::{EventLevel, Observer};
use crate::signal::Signaller;
use crate::target::SpawnSpec;

/// Pids handed out by the fake never collide with the test process itself.
const FIRST_PID: u32 = 5_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Term,
    Kill,
}

#[derive(Debug, Clone)]
struct FakeProcess {
    name: String,
    command_line: String,
    ignores_term: bool,
    kill_failures: u32,
    started_at: DateTime<Utc>,
    usage: Option<(f32, f32)>,
}

/// What the next spawn does.
#[derive(Debug, Clone)]
pub struct SpawnBehavior {
    fail: bool,
    name: String,
    command_line: String,
    listen: Option<(u16, Duration)>,
}

impl SpawnBehavior {
    pub fn listens_after(port: u16, delay: Duration) -> Self {
        Self {
            listen: Some((port, delay)),
            ..Self::never_listens()
        }
    }

    pub fn never_listens() -> Self {
        Self {
            fail: false,
            name: "node".to_string(),
            command_line: "node rssfeed.ts".to_string(),
            listen: None,
        }
    }

    pub fn fails() -> Self {
        Self {
            fail: true,
            ..Self::never_listens()
        }
    }
}

#[derive(Default)]
struct HostState {
    next_pid: u32,
    processes: BTreeMap<u32, FakeProcess>,
    listeners: BTreeMap<u16, u32>,
    pending: Vec<(Instant, u16, u32)>,
    fail_port: bool,
    fail_listing: bool,
    probe_delay: Duration,
    probe_calls: u32,
    signals: Vec<(u32, Signal)>,
    spawn: Option<SpawnBehavior>,
    spawn_count: u32,
}

impl HostState {
    fn settle(&mut self) {
        let now = Instant::now();
        let (due, waiting): (Vec<_>, Vec<_>) =
            self.pending.drain(..).partition(|(at, _, _)| *at <= now);
        self.pending = waiting;
        for (_, port, pid) in due {
            if self.processes.contains_key(&pid) {
                self.listeners.insert(port, pid);
            }
        }
    }

    fn remove(&mut self, pid: u32) {
        self.processes.remove(&pid);
        self.listeners.retain(|_, owner| *owner != pid);
        self.pending.retain(|(_, _, owner)| *owner != pid);
    }
}

pub struct FakeHost {
    state: Mutex<HostState>,
}

impl FakeHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(HostState {
                next_pid: FIRST_PID,
                ..HostState::default()
            }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HostState> {
        self.state.lock().unwrap()
    }

    pub fn add_process(&self, name: &str, command_line: &str) -> u32 {
        self.add_stubborn_process(name, command_line, false, 0)
    }

    /// A process that may ignore graceful termination and survive the first
    /// `kill_failures` forced kills.
    pub fn add_stubborn_process(
        &self,
        name: &str,
        command_line: &str,
        ignores_term: bool,
        kill_failures: u32,
    ) -> u32 {
        let mut state = self.lock();
        let pid = state.next_pid;
        state.next_pid += 1;
        state.processes.insert(
            pid,
            FakeProcess {
                name: name.to_string(),
                command_line: command_line.to_string(),
                ignores_term,
                kill_failures,
                started_at: Utc::now(),
                usage: None,
            },
        );
        pid
    }

    /// Report CPU and memory percentages for `pid` from now on.
    pub fn set_usage(&self, pid: u32, cpu_percent: f32, memory_percent: f32) {
        if let Some(process) = self.lock().processes.get_mut(&pid) {
            process.usage = Some((cpu_percent, memory_percent));
        }
    }

    pub fn listen(&self, port: u16, pid: u32) {
        self.lock().listeners.insert(port, pid);
    }

    pub fn fail_port_checks(&self, fail: bool) {
        self.lock().fail_port = fail;
    }

    pub fn fail_process_listing(&self, fail: bool) {
        self.lock().fail_listing = fail;
    }

    /// Make every port check take this long.
    pub fn slow_probes(&self, delay: Duration) {
        self.lock().probe_delay = delay;
    }

    pub fn on_spawn(&self, behavior: SpawnBehavior) {
        self.lock().spawn = Some(behavior);
    }

    pub fn spawn_count(&self) -> u32 {
        self.lock().spawn_count
    }

    pub fn probe_calls(&self) -> u32 {
        self.lock().probe_calls
    }

    pub fn signals(&self) -> Vec<(u32, Signal)> {
        self.lock().signals.clone()
    }

    pub fn is_alive(&self, pid: u32) -> bool {
        self.lock().processes.contains_key(&pid)
    }
}

impl ProcessInspector for FakeHost {
    fn list_processes(&self) -> Result<Vec<ProcessInfo>, ProbeError> {
        let mut state = self.lock();
        state.settle();
        if state.fail_listing {
            return Err(ProbeError::Unavailable {
                method: "process table",
                detail: "simulated failure".to_string(),
            });
        }
        Ok(state
            .processes
            .iter()
            .map(|(pid, p)| ProcessInfo {
                pid: *pid,
                name: p.name.clone(),
                command_line: p.command_line.clone(),
                started_at: Some(p.started_at),
                cpu_percent: p.usage.map(|(cpu, _)| cpu),
                memory_percent: p.usage.map(|(_, mem)| mem),
            })
            .collect())
    }

    fn is_port_listening(&self, port: u16) -> Result<bool, ProbeError> {
        let delay = {
            let mut state = self.lock();
            state.probe_calls += 1;
            state.probe_delay
        };
        if !delay.is_zero() {
            thread::sleep(delay);
        }

        let mut state = self.lock();
        state.settle();
        if state.fail_port {
            return Err(ProbeError::PermissionDenied {
                method: "port check",
                detail: "simulated permission failure".to_string(),
            });
        }
        Ok(state.listeners.contains_key(&port))
    }

    fn port_owners(&self, port: u16) -> Result<Vec<u32>, ProbeError> {
        let mut state = self.lock();
        state.settle();
        if state.fail_port {
            return Err(ProbeError::PermissionDenied {
                method: "port owners",
                detail: "simulated permission failure".to_string(),
            });
        }
        Ok(state.listeners.get(&port).copied().into_iter().collect())
    }
}

impl Signaller for FakeHost {
    fn terminate(&self, pid: u32) -> Result<(), TerminationAttemptError> {
        let mut state = self.lock();
        state.signals.push((pid, Signal::Term));
        let Some(process) = state.processes.get(&pid) else {
            return Err(TerminationAttemptError::NoSuchProcess { pid });
        };
        if !process.ignores_term {
            state.remove(pid);
        }
        Ok(())
    }

    fn kill(&self, pid: u32) -> Result<(), TerminationAttemptError> {
        let mut state = self.lock();
        state.signals.push((pid, Signal::Kill));
        let Some(process) = state.processes.get_mut(&pid) else {
            return Err(TerminationAttemptError::NoSuchProcess { pid });
        };
        if process.kill_failures > 0 {
            process.kill_failures -= 1;
            return Err(TerminationAttemptError::PermissionDenied { pid });
        }
        state.remove(pid);
        Ok(())
    }
}

impl Spawner for FakeHost {
    fn spawn(&self, spec: &SpawnSpec) -> Result<u32, LaunchError> {
        let behavior = {
            let mut state = self.lock();
            state.spawn_count += 1;
            state.spawn.clone().unwrap_or_else(SpawnBehavior::never_listens)
        };
        if behavior.fail {
            return Err(LaunchError::Spawn {
                program: spec.program.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "simulated"),
            });
        }

        let pid = self.add_process(&behavior.name, &behavior.command_line);
        if let Some((port, delay)) = behavior.listen {
            self.lock().pending.push((Instant::now() + delay, port, pid));
        }
        Ok(pid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub level: EventLevel,
    pub message: String,
}

pub type EventLog = Arc<Mutex<Vec<RecordedEvent>>>;

/// Observer that keeps every event for later assertions.
pub struct RecordingObserver {
    events: EventLog,
}

impl RecordingObserver {
    pub fn new() -> (Arc<Self>, EventLog) {
        let events = EventLog::default();
        (
            Arc::new(Self {
                events: events.clone(),
            }),
            events,
        )
    }
}

impl Observer for RecordingObserver {
    fn on_event(&self, level: EventLevel, message: &str, _at: DateTime<Utc>) {
        self.events.lock().unwrap().push(RecordedEvent {
            level,
            message: message.to_string(),
        });
    }
}
