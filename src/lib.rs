//! Single-host supervisor for one long-running network service.
//!
//! [`controller::SupervisorController`] is the entry point: it probes the
//! service through a [`inspector::ProcessInspector`], starts it with a
//! [`launcher::Spawner`] and stops it through escalating
//! [`signal::Signaller`] strategies. Everything it wants a human to see goes
//! to a [`log::Observer`].

pub mod cli;
pub mod config;
pub mod controller;
pub mod diagnose;
pub mod error;
pub mod escalator;
pub mod inspector;
pub mod launcher;
pub mod log;
pub mod monitor;
pub mod poller;
pub mod probe;
pub mod shell_completion;
pub mod signal;
pub mod target;

#[cfg(test)]
mod testing;
