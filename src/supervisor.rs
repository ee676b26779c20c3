//! Loop supervision and retry plumbing
//!
//! Each control loop runs as an independent task under one shared
//! cancellation token. Iteration errors are logged and absorbed; fatal
//! errors unwind out of the loop so the process can exit non-zero.

use crate::error::{OrchestratorError, OrchestratorResult};

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(1);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Drive `iteration` on a fixed cadence until cancellation. Per-iteration
/// errors are logged and the loop sleeps until the next tick; fatal errors
/// abort the loop.
pub async fn run_loop<F, Fut>(
    cancel: CancellationToken,
    interval: Duration,
    name: &'static str,
    mut iteration: F,
) -> OrchestratorResult<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = OrchestratorResult<()>>,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!("{} started with {:?} cadence", name, interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("{} observed shutdown", name);
                return Ok(());
            }
            _ = ticker.tick() => {}
        }

        match iteration().await {
            Ok(()) => {}
            Err(e) if e.is_fatal() => {
                error!("{} hit a fatal error: {}", name, e);
                return Err(e);
            }
            Err(e) => {
                warn!("{} iteration failed: {}", name, e);
                crate::metrics::record_loop_error(name);
            }
        }
    }
}

/// Retry `attempt` with exponential backoff until it succeeds, a
/// non-retryable error surfaces, the attempt budget runs out, or the token
/// is cancelled.
pub async fn retry_with_backoff<T, F, Fut>(
    cancel: &CancellationToken,
    name: &str,
    max_attempts: u32,
    mut attempt: F,
) -> OrchestratorResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = OrchestratorResult<T>>,
{
    let mut delay = INITIAL_RETRY_DELAY;
    let mut tries = 0;

    loop {
        tries += 1;
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) if tries >= max_attempts => {
                warn!("{} exhausted {} attempts: {}", name, max_attempts, e);
                return Err(e);
            }
            Err(e) => {
                warn!("{} failed (attempt {}), retrying in {:?}: {}", name, tries, delay, e);
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(OrchestratorError::Timeout {
                    operation: format!("{} cancelled during retry", name),
                });
            }
            _ = tokio::time::sleep(delay) => {}
        }
        delay = std::cmp::min(delay * 2, MAX_RETRY_DELAY);
    }
}

/// Task group that cancels every sibling as soon as one child fails and
/// reports that first error.
pub struct ParanoidGroup {
    set: JoinSet<OrchestratorResult<()>>,
    cancel: CancellationToken,
}

impl ParanoidGroup {
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            set: JoinSet::new(),
            cancel: parent.child_token(),
        }
    }

    /// Spawn a child task. The closure receives the group token and must
    /// observe it at its suspension points.
    pub fn go<F, Fut>(&mut self, f: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = OrchestratorResult<()>> + Send + 'static,
    {
        self.set.spawn(f(self.cancel.clone()));
    }

    /// Await all children, returning the first error observed
    pub async fn wait(mut self) -> OrchestratorResult<()> {
        let mut first_err = None;

        while let Some(joined) = self.set.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(e) => Err(OrchestratorError::Internal(format!("task panicked: {}", e))),
            };
            if let Err(e) = result {
                if first_err.is_none() {
                    self.cancel.cancel();
                    first_err = Some(e);
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
