//! Graceful and forced termination of a single pid.
//!
//! Unix sends SIGTERM / SIGKILL directly; Windows goes through `taskkill`
//! (without and with `/F`). Each call is one bounded OS action.

use crate::error::TerminationAttemptError;

/// Capability to signal one process.
pub trait Signaller: Send + Sync {
    /// Ask the process to exit. It may ignore this.
    fn terminate(&self, pid: u32) -> Result<(), TerminationAttemptError>;

    /// Unconditionally kill the process.
    fn kill(&self, pid: u32) -> Result<(), TerminationAttemptError>;
}

#[derive(Debug, Default, Clone)]
pub struct SystemSignaller;

impl Signaller for SystemSignaller {
    fn terminate(&self, pid: u32) -> Result<(), TerminationAttemptError> {
        platform::send(pid, false)
    }

    fn kill(&self, pid: u32) -> Result<(), TerminationAttemptError> {
        platform::send(pid, true)
    }
}

#[cfg(unix)]
mod platform {
    use crate::error::TerminationAttemptError;

    pub fn send(pid: u32, force: bool) -> Result<(), TerminationAttemptError> {
        let raw = i32::try_from(pid).map_err(|_| TerminationAttemptError::Os {
            pid,
            detail: "pid out of range".to_string(),
        })?;
        // 0 and negative values address process groups, never a single pid.
        if raw <= 0 {
            return Err(TerminationAttemptError::Os {
                pid,
                detail: "refusing to signal a process group".to_string(),
            });
        }

        let signal = if force { libc::SIGKILL } else { libc::SIGTERM };
        // SAFETY: kill(2) has no memory-safety preconditions.
        let rc = unsafe { libc::kill(raw, signal) };
        if rc == 0 {
            return Ok(());
        }

        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ESRCH) => Err(TerminationAttemptError::NoSuchProcess { pid }),
            Some(libc::EPERM) => Err(TerminationAttemptError::PermissionDenied { pid }),
            _ => Err(TerminationAttemptError::Os {
                pid,
                detail: err.to_string(),
            }),
        }
    }
}

#[cfg(windows)]
mod platform {
    use std::process::{Command, Stdio};

    use crate::error::TerminationAttemptError;

    pub fn send(pid: u32, force: bool) -> Result<(), TerminationAttemptError> {
        let pid_arg = pid.to_string();
        let mut args = vec!["/PID", pid_arg.as_str(), "/T"];
        if force {
            args.push("/F");
        }

        let output = Command::new("taskkill")
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| TerminationAttemptError::Os {
                pid,
                detail: format!("failed to run taskkill: {e}"),
            })?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).to_lowercase();
        if stderr.contains("not found") {
            Err(TerminationAttemptError::NoSuchProcess { pid })
        } else if stderr.contains("access is denied") {
            Err(TerminationAttemptError::PermissionDenied { pid })
        } else {
            Err(TerminationAttemptError::Os {
                pid,
                detail: stderr.trim().to_string(),
            })
        }
    }
}

#[cfg(not(any(unix, windows)))]
mod platform {
    use crate::error::TerminationAttemptError;

    pub fn send(_pid: u32, _force: bool) -> Result<(), TerminationAttemptError> {
        Err(TerminationAttemptError::Unsupported)
    }
}
