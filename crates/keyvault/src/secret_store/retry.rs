//! Bounded exponential backoff for transient secret store failures.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use super::SecretStoreError;

/// Retry schedule: `initial_backoff * 2^n`, capped at `max_backoff`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (0-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Run `op` until it succeeds, fails non-transiently, or retries run out.
    pub async fn run<T, F, Fut>(&self, path: &str, mut op: F) -> Result<T, SecretStoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SecretStoreError>>,
    {
        let mut retry = 0;
        loop {
            match op().await {
                Err(err) if err.is_transient() && retry < self.max_retries => {
                    let delay = self.backoff(retry);
                    warn!(path, attempt = retry + 1, ?delay, error = %err, "secret store call failed; retrying");
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                other => return other,
            }
        }
    }
}
