//! Host implementation of [`ProcessInspector`].
//!
//! Process table via `sysinfo`, socket table via `listeners`. The socket
//! table only lists sockets whose owning process we can see, so the port
//! check also tries a loopback connect before answering "not listening".
//!
//! One `System` is kept across calls so CPU usage can be measured as the
//! delta between consecutive samples.

use std::fmt;
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sysinfo::{MemoryRefreshKind, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use tracing::{debug, trace};

use super::{ProcessInfo, ProcessInspector, bounded};
use crate::error::ProbeError;

const LIST_METHOD: &str = "process table";
const PORT_METHOD: &str = "port check";
const OWNER_METHOD: &str = "port owner lookup";

struct Sampler {
    system: System,
    /// The process table has been refreshed at least once.
    primed: bool,
}

/// Inspector backed by the real OS tables.
#[derive(Clone)]
pub struct SystemInspector {
    timeout: Duration,
    sampler: Arc<Mutex<Sampler>>,
}

impl fmt::Debug for SystemInspector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemInspector")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl SystemInspector {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            sampler: Arc::new(Mutex::new(Sampler {
                system: System::new(),
                primed: false,
            })),
        }
    }
}

impl ProcessInspector for SystemInspector {
    fn list_processes(&self) -> Result<Vec<ProcessInfo>, ProbeError> {
        let sampler = Arc::clone(&self.sampler);
        bounded(LIST_METHOD, self.timeout, move || {
            let mut sampler = sampler.lock().unwrap_or_else(|e| e.into_inner());
            read_process_table(&mut sampler)
        })
    }

    fn is_port_listening(&self, port: u16) -> Result<bool, ProbeError> {
        let connect_timeout = (self.timeout / 4).max(Duration::from_millis(50));
        bounded(PORT_METHOD, self.timeout, move || {
            let table = listening_pids(port, PORT_METHOD);
            if let Ok(pids) = &table
                && !pids.is_empty()
            {
                return Ok(true);
            }

            match loopback_accepts(port, connect_timeout) {
                Ok(accepted) => Ok(accepted),
                Err(connect_err) => match table {
                    Ok(_) => Ok(false),
                    Err(table_err) => {
                        debug!(port, error = %connect_err, "loopback connect failed");
                        Err(table_err)
                    }
                },
            }
        })
    }

    fn port_owners(&self, port: u16) -> Result<Vec<u32>, ProbeError> {
        bounded(OWNER_METHOD, self.timeout, move || {
            listening_pids(port, OWNER_METHOD)
        })
    }
}

fn read_process_table(sampler: &mut Sampler) -> Result<Vec<ProcessInfo>, ProbeError> {
    let system = &mut sampler.system;
    system.refresh_memory_specifics(MemoryRefreshKind::nothing().with_ram());
    system.refresh_processes_specifics(
        ProcessesToUpdate::All,
        true,
        ProcessRefreshKind::nothing()
            .with_cmd(UpdateKind::Always)
            .with_cpu()
            .with_memory(),
    );
    let cpu_measured = sampler.primed;
    sampler.primed = true;

    let total_memory = system.total_memory();
    let processes: Vec<ProcessInfo> = system
        .processes()
        .iter()
        .map(|(pid, p)| ProcessInfo {
            pid: pid.as_u32(),
            name: p.name().to_string_lossy().into_owned(),
            command_line: p
                .cmd()
                .iter()
                .map(|arg| arg.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" "),
            started_at: started_at(p.start_time()),
            cpu_percent: cpu_measured.then(|| p.cpu_usage()),
            memory_percent: (total_memory > 0)
                .then(|| (p.memory() as f64 / total_memory as f64 * 100.0) as f32),
        })
        .collect();

    // We are a process ourselves; an empty table means it could not be read.
    if processes.is_empty() {
        return Err(ProbeError::Unavailable {
            method: LIST_METHOD,
            detail: "process table is empty".to_string(),
        });
    }

    trace!(count = processes.len(), "read process table");
    Ok(processes)
}

/// `sysinfo` reports start time in seconds since the epoch; 0 means unknown.
fn started_at(epoch_secs: u64) -> Option<DateTime<Utc>> {
    if epoch_secs == 0 {
        return None;
    }
    DateTime::from_timestamp(i64::try_from(epoch_secs).ok()?, 0)
}

fn listening_pids(port: u16, method: &'static str) -> Result<Vec<u32>, ProbeError> {
    let all = listeners::get_all().map_err(|e| classify(method, e.to_string()))?;
    let mut pids: Vec<u32> = all
        .into_iter()
        .filter(|l| l.socket.port() == port)
        .map(|l| l.process.pid)
        .collect();
    pids.sort_unstable();
    pids.dedup();
    Ok(pids)
}

fn loopback_accepts(port: u16, timeout: Duration) -> std::io::Result<bool> {
    let candidates = [
        SocketAddr::from(([127, 0, 0, 1], port)),
        SocketAddr::from(([0, 0, 0, 0, 0, 0, 0, 1], port)),
    ];

    let mut refused = false;
    let mut last_err = None;
    for addr in candidates {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(_) => return Ok(true),
            Err(e) if e.kind() == ErrorKind::ConnectionRefused => refused = true,
            Err(e) => last_err = Some(e),
        }
    }

    // A refusal on any loopback address is a definite "nobody listening";
    // the other address may simply be unconfigured.
    match last_err {
        _ if refused => Ok(false),
        None => Ok(false),
        Some(e) if e.kind() == ErrorKind::TimedOut => Ok(false),
        Some(e) => Err(e),
    }
}

fn classify(method: &'static str, detail: String) -> ProbeError {
    let lower = detail.to_lowercase();
    if lower.contains("permission") || lower.contains("access is denied") {
        ProbeError::PermissionDenied { method, detail }
    } else {
        ProbeError::Unavailable { method, detail }
    }
}
