//! Spawn the service and wait for it to confirm it is up.
//!
//! The launcher does not check whether the service is already running; the
//! controller does that before calling it.

use std::fs::OpenOptions;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{LaunchError, ProbeError};
use crate::log::Events;
use crate::poller;
use crate::probe::{ServiceState, StatusProbe};
use crate::target::{ServiceTarget, SpawnSpec};

/// How often a waiting start-up reports progress.
const PROGRESS_EVERY: Duration = Duration::from_secs(3);

/// Capability to start a detached OS process.
pub trait Spawner: Send + Sync {
    /// Start the process and return its pid without waiting for it.
    fn spawn(&self, spec: &SpawnSpec) -> Result<u32, LaunchError>;
}

/// Spawns with `std::process::Command`.
///
/// The child gets its own session (Unix) or process group (Windows), so a
/// Ctrl-C or hangup aimed at the supervisor never reaches the service. It
/// is reaped on a background thread so an early exit never leaves a zombie
/// behind.
#[derive(Debug, Default, Clone)]
pub struct CommandSpawner;

impl Spawner for CommandSpawner {
    fn spawn(&self, spec: &SpawnSpec) -> Result<u32, LaunchError> {
        if spec.program.trim().is_empty() {
            return Err(LaunchError::InvalidSpec("program is empty".to_string()));
        }

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args).stdin(Stdio::null());
        if let Some(dir) = &spec.work_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        detach(&mut cmd);

        match &spec.log_file {
            Some(path) => {
                if let Some(parent) = path.parent()
                    && !parent.as_os_str().is_empty()
                {
                    std::fs::create_dir_all(parent).map_err(|source| LaunchError::LogFile {
                        path: path.display().to_string(),
                        source,
                    })?;
                }
                let stdout = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| LaunchError::LogFile {
                        path: path.display().to_string(),
                        source,
                    })?;
                let stderr = stdout.try_clone().map_err(|source| LaunchError::LogFile {
                    path: path.display().to_string(),
                    source,
                })?;
                cmd.stdout(Stdio::from(stdout)).stderr(Stdio::from(stderr));
            }
            None => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        let mut child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            program: spec.program.clone(),
            source,
        })?;
        let pid = child.id();

        let reaper = thread::Builder::new()
            .name(format!("warden-reap-{pid}"))
            .spawn(move || match child.wait() {
                Ok(status) => debug!(pid, %status, "service process exited"),
                Err(e) => debug!(pid, error = %e, "failed to wait for service process"),
            });
        if let Err(e) = reaper {
            warn!(pid, error = %e, "failed to start reaper thread; an early exit may leave a zombie");
        }

        info!(pid, command = %spec.display_command(), "spawned service process");
        Ok(pid)
    }
}

#[cfg(unix)]
fn detach(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;

    // SAFETY: setsid is async-signal-safe and touches no parent state.
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(windows)]
fn detach(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;

    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
}

#[cfg(not(any(unix, windows)))]
fn detach(_cmd: &mut Command) {}

/// Outcome of [`ProcessLauncher::start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchResult {
    pub success: bool,
    pub reason: String,
    pub pid: Option<u32>,
    pub elapsed: Duration,
}

pub struct ProcessLauncher {
    spawner: Arc<dyn Spawner>,
    probe: StatusProbe,
    events: Events,
}

impl ProcessLauncher {
    pub fn new(spawner: Arc<dyn Spawner>, probe: StatusProbe, events: Events) -> Self {
        Self {
            spawner,
            probe,
            events,
        }
    }

    pub fn start(&self, target: &ServiceTarget, spec: &SpawnSpec) -> LaunchResult {
        let start = Instant::now();
        self.events
            .info(format!("starting service: {}", spec.display_command()));

        let pid = match self.spawner.spawn(spec) {
            Ok(pid) => pid,
            Err(e) => {
                self.events.error(format!("failed to start service: {e}"));
                return LaunchResult {
                    success: false,
                    reason: e.to_string(),
                    pid: None,
                    elapsed: start.elapsed(),
                };
            }
        };

        self.events.info(format!(
            "spawned pid {pid}; waiting up to {}s for port {}",
            target.startup_timeout.as_secs_f64(),
            target.port
        ));

        let mut next_progress = PROGRESS_EVERY;
        let convergence = poller::wait_until(
            || {
                let result = self.probe.check(target);
                let waited = start.elapsed();
                if waited >= next_progress {
                    self.events.info(format!(
                        "service starting... ({}/{}s, {})",
                        waited.as_secs(),
                        target.startup_timeout.as_secs(),
                        result.state.label()
                    ));
                    next_progress += PROGRESS_EVERY;
                }
                Ok::<_, ProbeError>(result.state == ServiceState::Running)
            },
            target.poll_interval,
            target.startup_timeout,
        );

        let elapsed = start.elapsed();
        if convergence.converged {
            let reason = format!(
                "service confirmed running on port {} after {:.1}s",
                target.port,
                elapsed.as_secs_f64()
            );
            self.events.success(&reason);
            LaunchResult {
                success: true,
                reason,
                pid: Some(pid),
                elapsed,
            }
        } else {
            let reason = format!(
                "process spawned but service did not confirm Running within timeout ({}s, pid {pid} left running)",
                target.startup_timeout.as_secs()
            );
            self.events.warning(&reason);
            LaunchResult {
                success: false,
                reason,
                pid: Some(pid),
                elapsed,
            }
        }
    }
}
