// tfstate-backup/src/utils/retry.rs
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use backoff::future::retry_notify;
use backoff::{Error as BackoffError, ExponentialBackoffBuilder};
use tracing::warn;

use crate::config::RetryConfig;
use crate::errors::Result;

/// Bounded exponential backoff for a single network call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        RetryPolicy {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay,
            max_delay: config.max_delay,
        }
    }

    /// Runs `op` until it succeeds, fails permanently, or `max_attempts` is used up.
    /// The error of the last attempt is returned.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.base_delay)
            .with_multiplier(2.0)
            .with_randomization_factor(0.2)
            .with_max_interval(self.max_delay.max(self.base_delay))
            .with_max_elapsed_time(None)
            .build();

        let max_attempts = self.max_attempts;
        let attempt = AtomicU32::new(0);

        retry_notify(
            backoff,
            || {
                let current = attempt.fetch_add(1, Ordering::Relaxed) + 1;
                let fut = op();
                async move {
                    match fut.await {
                        Ok(value) => Ok(value),
                        Err(err) if err.is_transient() && current < max_attempts => {
                            Err(BackoffError::transient(err))
                        }
                        Err(err) => Err(BackoffError::permanent(err)),
                    }
                }
            },
            |err, delay: Duration| {
                warn!(
                    operation = what,
                    attempt = attempt.load(Ordering::Relaxed),
                    max_attempts,
                    error = %err,
                    retry_in_ms = delay.as_millis() as u64,
                    "retrying after transient failure"
                );
            },
        )
        .await
    }
}
