//! Error taxonomy for the supervisor core.
//!
//! Only [`LaunchError`] is fatal to the operation that produced it. Probe and
//! termination errors are recorded and the caller moves on to its next
//! method or target; a convergence timeout becomes a failed outcome.

use std::time::Duration;

use thiserror::Error;

/// One detection method failed. Never fatal to a probe as a whole.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProbeError {
    #[error("{method} timed out after {}ms", timeout.as_millis())]
    Timeout {
        method: &'static str,
        timeout: Duration,
    },
    #[error("{method}: permission denied: {detail}")]
    PermissionDenied {
        method: &'static str,
        detail: String,
    },
    #[error("{method} unavailable: {detail}")]
    Unavailable {
        method: &'static str,
        detail: String,
    },
}

impl ProbeError {
    pub fn method(&self) -> &'static str {
        match self {
            Self::Timeout { method, .. }
            | Self::PermissionDenied { method, .. }
            | Self::Unavailable { method, .. } => method,
        }
    }
}

/// Spawning the service process failed outright.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to open service log {path}: {source}")]
    LogFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid spawn spec: {0}")]
    InvalidSpec(String),
}

/// One kill action against one pid failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TerminationAttemptError {
    #[error("pid {pid} no longer exists")]
    NoSuchProcess { pid: u32 },
    #[error("permission denied signalling pid {pid}")]
    PermissionDenied { pid: u32 },
    #[error("signalling pid {pid} failed: {detail}")]
    Os { pid: u32, detail: String },
    #[error("signalling is not supported on this platform")]
    Unsupported,
}

/// A wait-until-condition did not resolve before its deadline.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{what} did not converge within {}ms", waited.as_millis())]
pub struct ConvergenceTimeout {
    pub what: String,
    pub waited: Duration,
}

/// Invalid supervisor configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid service target: {0}")]
pub struct TargetError(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_error_reports_method() {
        let e = ProbeError::Timeout {
            method: "port check",
            timeout: Duration::from_millis(1500),
        };
        assert_eq!(e.method(), "port check");
        assert_eq!(e.to_string(), "port check timed out after 1500ms");
    }

    #[test]
    fn convergence_timeout_message() {
        let e = ConvergenceTimeout {
            what: "startup".to_string(),
            waited: Duration::from_secs(15),
        };
        assert_eq!(e.to_string(), "startup did not converge within 15000ms");
    }

    #[test]
    fn launch_error_keeps_source() {
        use std::error::Error as _;
        let e = LaunchError::Spawn {
            program: "nope".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
        };
        assert!(e.to_string().contains("'nope'"));
        assert!(e.source().is_some());
    }
}
