use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Error;
use crate::types::Result;

/// Bounded exponential backoff policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    initial: Duration,
    max_delay: Duration,
    factor: u32,
    timeout: Duration,
}

impl Backoff {
    /// Create a policy; `factor` below 1 is treated as 1
    pub fn new(initial: Duration, max_delay: Duration, factor: u32, timeout: Duration) -> Self {
        Self {
            initial,
            max_delay: max_delay.max(initial),
            factor: factor.max(1),
            timeout,
        }
    }

    /// Total ceiling for one wait
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Un-jittered delay before retry number `attempt` (zero based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let mut delay = self.initial;
        for _ in 0..attempt {
            delay = delay.saturating_mul(self.factor);
            if delay >= self.max_delay {
                return self.max_delay;
            }
        }
        delay.min(self.max_delay)
    }

    /// Start a timer measured against this policy's ceiling
    pub fn start(&self) -> BackoffTimer {
        BackoffTimer {
            policy: *self,
            attempt: 0,
            deadline: Instant::now() + self.timeout,
        }
    }

    /// Run `op` until it succeeds, fails permanently or the ceiling is reached.
    ///
    /// Only errors for which [`Error::is_transient`] holds are retried. The last
    /// transient error is returned once the ceiling is reached.
    pub async fn retry<T, F, Fut>(&self, what: &str, cancel: &CancellationToken, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut timer = self.start();
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    warn!(operation = what, attempt = timer.attempt, error = %e, "Transient failure, backing off");
                    match timer.wait(cancel).await {
                        Ok(()) => continue,
                        Err(Error::Timeout(_)) => return Err(e),
                        Err(other) => return Err(other),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Progress through one bounded wait
#[derive(Debug)]
pub struct BackoffTimer {
    policy: Backoff,
    attempt: u32,
    deadline: Instant,
}

impl BackoffTimer {
    /// Number of delays handed out so far
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Next jittered delay, clipped to the time left. `None` once the ceiling has passed.
    pub fn next_delay(&mut self) -> Option<Duration> {
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return None;
        }

        let base = self.policy.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);

        let jitter = rand::thread_rng().gen_range(0.8..=1.0);
        Some(base.mul_f64(jitter).min(remaining))
    }

    /// Sleep for the next delay.
    ///
    /// Returns `Error::Timeout` when the ceiling is exhausted and
    /// `Error::Cancelled` when the token fires first.
    pub async fn wait(&mut self, cancel: &CancellationToken) -> Result<()> {
        let delay = self.next_delay().ok_or_else(|| {
            Error::Timeout(format!("gave up after {}s", self.policy.timeout.as_secs()))
        })?;

        debug!(delay_ms = delay.as_millis() as u64, attempt = self.attempt, "Backing off");

        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled("wait interrupted".into())),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}
