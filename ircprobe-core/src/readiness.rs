//! Bounded readiness polling
//!
//! Everything the harness waits on (the server's port, the receiver's
//! "joined" line) goes through [`poll_until`], so the attempt accounting is
//! the same everywhere: at most `max_attempts` probes, `retry_delay` between
//! consecutive probes, and no sleep after the last one.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::{debug, info};

use crate::config::{ReadinessConfig, ReceiverConfig};
use crate::error::{HarnessError, Result};

/// How many probes to make and how long to spend on each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
    pub retry_delay: Duration,
}

impl RetryBudget {
    pub fn new(max_attempts: u32, attempt_timeout: Duration, retry_delay: Duration) -> Self {
        Self {
            max_attempts,
            attempt_timeout,
            retry_delay,
        }
    }
}

impl From<&ReadinessConfig> for RetryBudget {
    fn from(config: &ReadinessConfig) -> Self {
        Self::new(
            config.max_attempts,
            config.attempt_timeout(),
            config.retry_delay(),
        )
    }
}

impl From<&ReceiverConfig> for RetryBudget {
    fn from(config: &ReceiverConfig) -> Self {
        // File probes don't block, the delay is what paces them.
        Self::new(config.ready_attempts, config.ready_delay(), config.ready_delay())
    }
}

/// Probe until `probe` reports ready or the budget runs out.
///
/// `probe` receives the 1-based attempt number. A probe that outlives
/// `attempt_timeout` counts as a failed attempt. Returns `Ok(attempts)` on
/// success and `Err(attempts)` once every attempt has failed.
pub async fn poll_until<F, Fut>(budget: &RetryBudget, mut probe: F) -> std::result::Result<u32, u32>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = bool>,
{
    for attempt in 1..=budget.max_attempts {
        let ready = timeout(budget.attempt_timeout, probe(attempt))
            .await
            .unwrap_or(false);

        if ready {
            return Ok(attempt);
        }

        if attempt < budget.max_attempts {
            sleep(budget.retry_delay).await;
        }
    }

    Err(budget.max_attempts)
}

pub struct ReadinessPoller {
    budget: RetryBudget,
}

impl ReadinessPoller {
    pub fn new(budget: RetryBudget) -> Self {
        Self { budget }
    }

    /// Wait until a TCP connection to `address` succeeds.
    ///
    /// Refused and timed-out connects are both retried.
    pub async fn wait_until_reachable(&self, address: &str) -> Result<u32> {
        let outcome = poll_until(&self.budget, |attempt| async move {
            match TcpStream::connect(address).await {
                Ok(_) => true,
                Err(e) => {
                    debug!(%address, attempt, error = %e, "server not reachable yet");
                    false
                }
            }
        })
        .await;

        match outcome {
            Ok(attempts) => {
                info!(%address, attempts, "server reachable");
                Ok(attempts)
            }
            Err(attempts) => Err(HarnessError::ServiceUnavailable {
                address: address.to_owned(),
                attempts,
            }),
        }
    }

    /// Wait until the file at `path` contains `marker`.
    ///
    /// A file that doesn't exist yet counts as not ready.
    pub async fn wait_for_marker(&self, path: &Path, marker: &str) -> Result<u32> {
        let outcome = poll_until(&self.budget, |attempt| async move {
            match tokio::fs::read_to_string(path).await {
                Ok(content) => content.contains(marker),
                Err(e) => {
                    debug!(path = %path.display(), attempt, error = %e, "output not readable yet");
                    false
                }
            }
        })
        .await;

        match outcome {
            Ok(attempts) => {
                info!(marker, attempts, "receiver ready");
                Ok(attempts)
            }
            Err(attempts) => Err(HarnessError::ReceiverNotReady {
                marker: marker.to_owned(),
                attempts,
            }),
        }
    }
}
