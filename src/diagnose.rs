//! Read-only diagnostics: who owns the port and which processes look like
//! the service.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};

use crate::inspector::{ProcessInfo, ProcessInspector};
use crate::target::ServiceTarget;

/// Longest command line shown in the rendered report.
const COMMAND_WIDTH: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct PortOwner {
    pub pid: u32,
    /// `None` when the pid is not in the process table (exited, or hidden).
    pub process: Option<ProcessInfo>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub process: ProcessInfo,
    pub matches_command_line: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostics {
    pub port: u16,
    pub port_owners: Result<Vec<PortOwner>, String>,
    /// Every name match, whether or not its command line matches.
    pub candidates: Result<Vec<Candidate>, String>,
}

pub fn collect(target: &ServiceTarget, inspector: &dyn ProcessInspector) -> Diagnostics {
    let processes = inspector.list_processes().map_err(|e| e.to_string());

    let port_owners = inspector
        .port_owners(target.port)
        .map_err(|e| e.to_string())
        .map(|pids| {
            pids.into_iter()
                .map(|pid| PortOwner {
                    pid,
                    process: processes
                        .as_ref()
                        .ok()
                        .and_then(|list| list.iter().find(|p| p.pid == pid).cloned()),
                })
                .collect()
        });

    let candidates = processes.map(|list| {
        list.into_iter()
            .filter(|p| target.matches_name(p))
            .map(|p| Candidate {
                matches_command_line: target.matches_service(&p),
                process: p,
            })
            .collect()
    });

    Diagnostics {
        port: target.port,
        port_owners,
        candidates,
    }
}

/// Process-table entries for `pids`, in the order given. Pids that have
/// left the table are skipped.
pub fn describe(
    pids: &[u32],
    inspector: &dyn ProcessInspector,
) -> Result<Vec<ProcessInfo>, String> {
    let processes = inspector.list_processes().map_err(|e| e.to_string())?;
    Ok(pids
        .iter()
        .filter_map(|pid| processes.iter().find(|p| p.pid == *pid).cloned())
        .collect())
}

pub fn render(diag: &Diagnostics, target: &ServiceTarget) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "== port {} ==", diag.port);
    match &diag.port_owners {
        Ok(owners) if owners.is_empty() => {
            let _ = writeln!(out, "no process is listening on port {}", diag.port);
        }
        Ok(owners) => {
            for owner in owners {
                match &owner.process {
                    Some(p) => {
                        let _ = writeln!(out, "pid {} ({})", owner.pid, p.name);
                        let _ = writeln!(out, "  command: {}", shorten(&p.command_line));
                        let _ = writeln!(out, "  {}", p.usage_summary());
                    }
                    None => {
                        let _ = writeln!(out, "pid {} (not in process table)", owner.pid);
                    }
                }
            }
        }
        Err(e) => {
            let _ = writeln!(out, "error reading port owners: {e}");
        }
    }

    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "== processes matching {} ==",
        target.process_names.join(" | ")
    );
    match &diag.candidates {
        Ok(candidates) if candidates.is_empty() => {
            let _ = writeln!(out, "no matching processes");
        }
        Ok(candidates) => {
            for c in candidates {
                let marker = if c.matches_command_line {
                    " [service]"
                } else {
                    ""
                };
                let _ = writeln!(out, "pid {} ({}){marker}", c.process.pid, c.process.name);
                let _ = writeln!(out, "  command: {}", shorten(&c.process.command_line));
                let _ = writeln!(out, "  {}", c.process.usage_summary());
            }
        }
        Err(e) => {
            let _ = writeln!(out, "error listing processes: {e}");
        }
    }

    out
}

fn shorten(command_line: &str) -> String {
    if command_line.is_empty() {
        return "n/a".to_string();
    }
    if command_line.chars().count() <= COMMAND_WIDTH {
        return command_line.to_string();
    }
    let mut short: String = command_line.chars().take(COMMAND_WIDTH).collect();
    short.push_str("...");
    short
}

/// Last `n` lines of a log file. Bytes that are not valid UTF-8 are
/// replaced, never fatal.
pub fn tail_lines(path: &Path, n: usize) -> Result<Vec<String>> {
    let file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;

    let mut window = VecDeque::with_capacity(n.min(1024));
    for line in BufReader::new(file).split(b'\n') {
        let mut line = line.with_context(|| format!("failed to read {}", path.display()))?;
        if n == 0 {
            continue;
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        if window.len() == n {
            window.pop_front();
        }
        window.push_back(String::from_utf8_lossy(&line).into_owned());
    }
    Ok(window.into_iter().collect())
}
