//! Shared retry policy for all external-service calls.
//!
//! Every catalog lookup, token refresh, and recently-played poll goes through
//! the same bounded schedule: up to 5 attempts, backoff doubling from 1s,
//! with an explicit retry-after hint from the service overriding the
//! computed delay. Permanent failures (not-found, bad credentials) are never
//! retried.

use std::future::Future;
use std::time::Duration;

use crate::spotify::ApiError;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// Delay before the attempt following `attempt` (1-based). A retry-after
    /// hint from the service wins over the computed backoff.
    pub fn delay_for(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        if let Some(hint) = hint {
            return hint;
        }
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }

    /// Run `op` until it succeeds, fails permanently, or the attempt budget
    /// is exhausted.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, ApiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt, err.retry_after());
                    tracing::warn!(
                        "{} attempt {}/{} failed ({}), retrying in {:?}",
                        what,
                        attempt,
                        self.max_attempts,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    if err.is_transient() {
                        tracing::error!(
                            "{} failed after {} attempts: {}",
                            what,
                            self.max_attempts,
                            err
                        );
                    }
                    return Err(err);
                }
            }
        }
    }
}
