//! Lease-expiry sweeper.
//!
//! Crashed or stalled workers leave `running` rows behind; the sweeper
//! returns them to `queued` so capacity is restored. Sweeps are idempotent
//! and safe to run concurrently with claims and with other sweepers — both
//! sides go through the store's conditional predicates.

use std::time::Duration;

use thiserror::Error;
use tracing::info;

use crate::queue::WorkQueue;
use crate::store::StoreError;

/// Sweeper loop configuration.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Sleep between sweeps.
    pub interval: Duration,
    /// Bounded iteration count; `None` runs until the process stops.
    pub iterations: Option<u64>,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            iterations: None,
        }
    }
}

/// Errors from the sweeper loop.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SweeperError {
    /// Persistence failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Invalid loop configuration.
    #[error("invalid sweeper config: {detail}")]
    InvalidConfig {
        /// What was wrong.
        detail: &'static str,
    },
}

/// Accounting for a finished (bounded) sweeper loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweeperReport {
    /// Sweeps executed.
    pub iterations: u64,
    /// Total rows requeued across all sweeps.
    pub total_requeued: u64,
}

/// Runs a single sweep, returning the number of requeued rows.
pub fn sweep_once(queue: &WorkQueue) -> Result<usize, SweeperError> {
    Ok(queue.requeue_expired()?)
}

/// Runs the sweeper loop with the process clock.
pub fn run_sweeper_loop(
    queue: &WorkQueue,
    config: &SweeperConfig,
) -> Result<SweeperReport, SweeperError> {
    run_sweeper_loop_with(queue, config, std::thread::sleep)
}

/// Runs the sweeper loop with an injected sleep, for bounded tests.
pub fn run_sweeper_loop_with(
    queue: &WorkQueue,
    config: &SweeperConfig,
    mut sleep_fn: impl FnMut(Duration),
) -> Result<SweeperReport, SweeperError> {
    if config.interval.is_zero() {
        return Err(SweeperError::InvalidConfig {
            detail: "interval must be > 0",
        });
    }
    if config.iterations == Some(0) {
        return Err(SweeperError::InvalidConfig {
            detail: "iterations must be > 0 when bounded",
        });
    }

    let mut report = SweeperReport {
        iterations: 0,
        total_requeued: 0,
    };

    loop {
        let requeued = sweep_once(queue)?;
        report.iterations += 1;
        report.total_requeued += requeued as u64;
        info!(
            iteration = report.iterations,
            rows_requeued = requeued,
            "work queue sweep"
        );

        match config.iterations {
            Some(bound) if report.iterations >= bound => break,
            _ => sleep_fn(config.interval),
        }
    }

    Ok(report)
}
