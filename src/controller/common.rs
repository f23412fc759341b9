//! Shared reconcile-loop helpers.
//!
//! Utilities used by both event-triggered and interval-triggered controllers:
//! jittered periodic loops, retry with backoff, and requeue policy.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use kube::runtime::controller::Action;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::controller::error::{Error, Result};
use crate::health::{HealthState, Outcome};

/// Spread applied to every periodic interval.
pub const JITTER_FACTOR: f64 = 0.3;

/// `interval` shifted by up to `±interval * factor / 2`.
pub fn jitter(interval: Duration, factor: f64) -> Duration {
    jitter_with(interval, factor, rand::thread_rng().r#gen::<f64>())
}

/// [`jitter`] with an explicit sample in `[0, 1)`.
pub fn jitter_with(interval: Duration, factor: f64, sample: f64) -> Duration {
    let spread = interval.as_secs_f64() * factor;
    let offset = spread * (sample.clamp(0.0, 1.0) - 0.5);
    Duration::from_secs_f64((interval.as_secs_f64() + offset).max(0.0))
}

/// One pass of an interval-triggered reconciler.
#[async_trait]
pub trait Tick: Send {
    async fn tick(&mut self) -> Result<()>;
}

/// Run `task` every jittered `interval` until `shutdown` fires.
///
/// Tick errors are logged and counted, never fatal. Returns
/// [`Error::Cancelled`] once cancelled.
pub async fn run_periodic<T: Tick + ?Sized>(
    name: &str,
    interval: Duration,
    shutdown: &CancellationToken,
    health_state: Option<&HealthState>,
    task: &mut T,
) -> Result<()> {
    info!(controller = %name, interval_secs = interval.as_secs(), "Starting periodic reconciler");
    loop {
        let started = Instant::now();
        let result = tokio::select! {
            _ = shutdown.cancelled() => return Err(Error::Cancelled),
            result = task.tick() => result,
        };
        let outcome = match result {
            Ok(()) => {
                debug!(controller = %name, "Periodic reconcile succeeded");
                Outcome::Success
            }
            Err(e) => {
                error!(controller = %name, error = %e, "Periodic reconcile failed");
                Outcome::Error
            }
        };
        if let Some(state) = health_state {
            state
                .metrics
                .record_reconcile(name, outcome, started.elapsed().as_secs_f64());
        }

        tokio::select! {
            _ = shutdown.cancelled() => {
                info!(controller = %name, "Stopping periodic reconciler");
                return Err(Error::Cancelled);
            }
            _ = tokio::time::sleep(jitter(interval, JITTER_FACTOR)) => {}
        }
    }
}

/// Backoff before the `attempt`-th retry (1-based), capped at `max`.
pub fn backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base.saturating_mul(factor).min(max)
}

/// Retry `op` with exponential backoff until it succeeds or `shutdown` fires.
pub async fn retry_until_ok<F, Fut>(name: &str, shutdown: &CancellationToken, mut op: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut attempt = 0u32;
    loop {
        let result = tokio::select! {
            _ = shutdown.cancelled() => return Err(Error::Cancelled),
            result = op() => result,
        };
        match result {
            Ok(()) => return Ok(()),
            Err(e) => {
                attempt = attempt.saturating_add(1);
                let delay = jitter(
                    backoff(attempt, Duration::from_secs(1), Duration::from_secs(60)),
                    JITTER_FACTOR,
                );
                warn!(task = %name, attempt = attempt, error = %e, "Attempt failed, retrying");
                tokio::select! {
                    _ = shutdown.cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// Requeue policy shared by the event-triggered controllers.
pub fn requeue_action(controller: &str, name: &str, error: &Error) -> Action {
    if error.is_not_found() {
        debug!(controller = %controller, name = %name, "Object not found (likely deleted)");
        return Action::await_change();
    }
    if error.is_retryable() {
        warn!(controller = %controller, name = %name, error = %error, "Retryable error, will retry");
    } else {
        error!(controller = %controller, name = %name, error = %error, "Non-retryable error");
    }
    Action::requeue(error.requeue_after())
}

/// Record a reconcile result, mapping not-found to success.
pub fn finish_reconcile<T>(
    health_state: Option<&Arc<HealthState>>,
    controller: &str,
    started: Instant,
    result: &Result<T>,
) {
    let outcome = match result {
        Ok(_) => Outcome::Success,
        Err(e) if e.is_not_found() => Outcome::Success,
        Err(_) => Outcome::Error,
    };
    if let Some(state) = health_state {
        state
            .metrics
            .record_reconcile(controller, outcome, started.elapsed().as_secs_f64());
    }
}
