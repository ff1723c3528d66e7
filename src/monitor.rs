//! Periodic background status checks.
//!
//! A `Monitor` owns one thread that calls [`SupervisorController::tick`] on a
//! fixed interval. Dropping the monitor (or calling [`Monitor::stop`]) wakes
//! the thread and joins it.

use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::controller::{StatusReport, SupervisorController};

pub struct Monitor {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<u64>>,
}

impl Monitor {
    /// Start ticking immediately, then every `interval`.
    ///
    /// `on_tick` receives each completed check; skipped ticks are not
    /// reported.
    pub fn spawn<F>(
        controller: Arc<SupervisorController>,
        interval: Duration,
        mut on_tick: F,
    ) -> Result<Self>
    where
        F: FnMut(&StatusReport) + Send + 'static,
    {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let handle = thread::Builder::new()
            .name("warden-monitor".to_string())
            .spawn(move || {
                let mut ticks = 0u64;
                loop {
                    if let Some(report) = controller.tick() {
                        ticks += 1;
                        on_tick(&report);
                    }
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!(ticks, "monitor stopped");
                ticks
            })
            .context("failed to start monitor thread")?;

        info!(interval_ms = interval.as_millis() as u64, "monitor started");
        Ok(Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Stop the thread and return how many checks it completed.
    pub fn stop(mut self) -> u64 {
        self.shutdown()
    }

    fn shutdown(&mut self) -> u64 {
        // Dropping the sender wakes the thread even if it is mid-wait.
        self.stop_tx.take();
        self.handle
            .take()
            .and_then(|h| h.join().ok())
            .unwrap_or_default()
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
