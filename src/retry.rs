//! Bounded retry with exponential backoff and jitter for remote calls.
//!
//! Every attempt runs under its own timeout; an elapsed timeout becomes
//! [`RemoteError::Timeout`] and is retried like any other transient error.
//!
//! ```text
//! delay(n) = min(max_delay, base_delay × 2^(n-1))
//! sleep(n) = max(retry_after, delay(n)/2 + uniform(0, delay(n)/2))
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::config::{RemoteConfig, SyncConfig};
use crate::remote::RemoteError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub attempt_timeout: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            attempt_timeout: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(sync: &SyncConfig, remote: &RemoteConfig) -> Self {
        Self {
            max_attempts: sync.max_attempts,
            base_delay: Duration::from_millis(sync.base_delay_ms),
            max_delay: Duration::from_millis(sync.max_delay_ms),
            attempt_timeout: remote.timeout(),
            jitter: true,
        }
    }

    /// Backoff before attempt `attempt + 1`, where `attempt` is 1-based.
    pub fn delay_for(&self, attempt: u32, error: &RemoteError) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let raw = self
            .base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay);

        let delay = if self.jitter && !raw.is_zero() {
            let half = raw / 2;
            let spread = rand::thread_rng().gen_range(0..=half.as_millis() as u64);
            half + Duration::from_millis(spread)
        } else {
            raw
        };

        match error.retry_after() {
            Some(floor) if floor > delay => floor,
            _ => delay,
        }
    }

    /// One attempt under the attempt timeout, never retried. For calls
    /// that are not idempotent, such as creates.
    pub async fn run_once<T, Fut>(&self, fut: Fut) -> Result<T, RemoteError>
    where
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        tokio::time::timeout(self.attempt_timeout, fut)
            .await
            .unwrap_or(Err(RemoteError::Timeout(self.attempt_timeout)))
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    /// Returns the last error in the latter two cases.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, RemoteError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let outcome = match tokio::time::timeout(self.attempt_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(RemoteError::Timeout(self.attempt_timeout)),
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() || attempt >= max_attempts => return Err(e),
                Err(e) => {
                    let delay = self.delay_for(attempt, &e);
                    debug!(
                        call = label,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying remote call"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
