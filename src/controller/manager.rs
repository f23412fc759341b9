//! Runnable host.
//!
//! Everything long-running in the operator is a [`Runnable`]: kube-runtime
//! controllers, interval-triggered reconcilers, one-shot startup tasks and the
//! health server. The [`Manager`] starts runnables that do not need leadership
//! immediately and the rest once leadership is acquired.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::controller::common::{Tick, run_periodic};
use crate::controller::error::{Error, Result};
use crate::health::HealthState;

/// A long-running unit of work.
#[async_trait]
pub trait Runnable: Send + Sync {
    fn name(&self) -> &str;

    /// Run until done or until `shutdown` fires. Returning
    /// [`Error::Cancelled`] after shutdown is a clean exit.
    async fn start(&self, shutdown: CancellationToken) -> Result<()>;

    fn need_leader_election(&self) -> bool {
        true
    }
}

/// Adapts a [`Tick`] into an interval-triggered [`Runnable`].
pub struct Periodic<T> {
    name: String,
    interval: Duration,
    task: Mutex<T>,
    health_state: Option<Arc<HealthState>>,
}

impl<T: Tick> Periodic<T> {
    pub fn new(
        name: &str,
        interval: Duration,
        task: T,
        health_state: Option<Arc<HealthState>>,
    ) -> Self {
        Self {
            name: name.to_string(),
            interval,
            task: Mutex::new(task),
            health_state,
        }
    }
}

#[async_trait]
impl<T: Tick + 'static> Runnable for Periodic<T> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        // Held for the whole run: the task state belongs to this loop alone.
        let mut task = self.task.lock().await;
        run_periodic(
            &self.name,
            self.interval,
            &shutdown,
            self.health_state.as_deref(),
            &mut *task,
        )
        .await
    }
}

/// Starts runnables and waits for them to finish.
#[derive(Default)]
pub struct Manager {
    runnables: Vec<Arc<dyn Runnable>>,
}

impl Manager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, runnable: Arc<dyn Runnable>) -> &mut Self {
        debug!(runnable = runnable.name(), "Registered runnable");
        self.runnables.push(runnable);
        self
    }

    pub fn names(&self) -> Vec<String> {
        self.runnables.iter().map(|r| r.name().to_string()).collect()
    }

    /// Run every registered runnable.
    ///
    /// Runnables that need leader election start once `elected` resolves,
    /// unless `shutdown` fired first. A runnable failing with anything but
    /// [`Error::Cancelled`] cancels `shutdown` for the others, and the first
    /// such error is returned.
    pub async fn run<F>(self, shutdown: CancellationToken, elected: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let (leader_only, always): (Vec<_>, Vec<_>) = self
            .runnables
            .into_iter()
            .partition(|r| r.need_leader_election());

        let mut tasks = JoinSet::new();
        for runnable in always {
            spawn(&mut tasks, runnable, shutdown.clone());
        }

        // Runnables started before leadership are joined while waiting, so
        // a standby replica still fails fast when one of them dies.
        let mut first_error = None;
        tokio::pin!(elected);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Shutdown before leadership was acquired");
                    break;
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    record(joined, &shutdown, &mut first_error);
                }
                _ = &mut elected => {
                    if !shutdown.is_cancelled() {
                        info!(count = leader_only.len(), "Starting leader-only runnables");
                        for runnable in leader_only {
                            spawn(&mut tasks, runnable, shutdown.clone());
                        }
                    }
                    break;
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            record(joined, &shutdown, &mut first_error);
        }

        first_error.map_or(Ok(()), Err)
    }
}

fn record(
    joined: std::result::Result<(String, Result<()>), JoinError>,
    shutdown: &CancellationToken,
    first_error: &mut Option<Error>,
) {
    match joined {
        Ok((name, Ok(()))) => info!(runnable = %name, "Runnable finished"),
        Ok((name, Err(Error::Cancelled))) => debug!(runnable = %name, "Runnable stopped"),
        Ok((name, Err(e))) => {
            error!(runnable = %name, error = %e, "Runnable failed, shutting down");
            shutdown.cancel();
            first_error.get_or_insert(e);
        }
        Err(e) => {
            error!(error = %e, "Runnable task panicked, shutting down");
            shutdown.cancel();
            first_error.get_or_insert(Error::Transient(format!("runnable panicked: {e}")));
        }
    }
}

fn spawn(
    tasks: &mut JoinSet<(String, Result<()>)>,
    runnable: Arc<dyn Runnable>,
    shutdown: CancellationToken,
) {
    info!(runnable = runnable.name(), "Starting runnable");
    tasks.spawn(async move {
        let result = runnable.start(shutdown).await;
        (runnable.name().to_string(), result)
    });
}
