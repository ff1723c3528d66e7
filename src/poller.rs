//! Poll a condition until it holds or a deadline passes.
//!
//! This is the only place in the supervisor that deliberately sleeps.

use std::fmt::Display;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{trace, warn};

use crate::error::ConvergenceTimeout;

/// Outcome of a [`wait_until`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Convergence {
    pub converged: bool,
    pub elapsed: Duration,
    /// How many times the predicate was evaluated.
    pub ticks: u32,
}

impl Convergence {
    pub fn into_result(self, what: &str) -> Result<Duration, ConvergenceTimeout> {
        if self.converged {
            Ok(self.elapsed)
        } else {
            Err(ConvergenceTimeout {
                what: what.to_string(),
                waited: self.elapsed,
            })
        }
    }
}

/// Evaluate `predicate` every `interval` until it returns `Ok(true)` or
/// `deadline` has elapsed.
///
/// The predicate runs once immediately. An `Err` from the predicate counts
/// as "not yet" for that tick. The last sleep is clipped so the call never
/// overshoots the deadline by more than one predicate evaluation.
pub fn wait_until<F, E>(mut predicate: F, interval: Duration, deadline: Duration) -> Convergence
where
    F: FnMut() -> Result<bool, E>,
    E: Display,
{
    let start = Instant::now();
    let mut ticks = 0u32;

    loop {
        ticks += 1;
        match predicate() {
            Ok(true) => {
                return Convergence {
                    converged: true,
                    elapsed: start.elapsed(),
                    ticks,
                };
            }
            Ok(false) => trace!(tick = ticks, "not converged yet"),
            Err(e) => warn!(tick = ticks, error = %e, "convergence check failed; treating as not converged"),
        }

        let elapsed = start.elapsed();
        if elapsed >= deadline {
            return Convergence {
                converged: false,
                elapsed,
                ticks,
            };
        }
        thread::sleep(interval.min(deadline - elapsed));
    }
}
