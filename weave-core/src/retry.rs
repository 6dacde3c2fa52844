//! Retry policy for transient store failures (§5, §7).
//!
//! The spec calls for linearly increasing delay (0.5s, 1.0s, 1.5s) over at
//! most 3 attempts, applied only to recoverable errors. This mirrors the
//! shape of the teacher's `RetryPolicy`, trimmed to the spec's fixed policy
//! rather than the teacher's exponential/jittered one.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::Error;

/// Errors that can report whether they are worth retrying.
pub trait Retryable {
    /// Returns `true` if retrying the operation that produced this error
    /// might succeed.
    fn is_recoverable(&self) -> bool;
}

impl Retryable for Error {
    fn is_recoverable(&self) -> bool {
        Error::is_recoverable(self)
    }
}

/// Fixed retry policy: up to `max_retries` attempts with linearly increasing
/// delay, per §5 ("0.5 s, 1.0 s, 1.5 s").
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Construct the default policy (3 retries, 0.5s/1.0s/1.5s delays).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the maximum number of retries.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Override the base (per-attempt) delay increment.
    #[must_use]
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }

    /// Run `operation`, retrying on recoverable errors with linearly
    /// increasing delay until `max_retries` is exhausted.
    pub async fn execute<F, T, E, Fut>(&self, operation: F) -> std::result::Result<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Retryable + std::fmt::Debug,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !err.is_recoverable() || attempt >= self.max_retries {
                        return Err(err);
                    }
                    attempt += 1;
                    let delay = self.delay_for(attempt);
                    warn!(
                        attempt,
                        max_retries = self.max_retries,
                        ?delay,
                        ?err,
                        "retrying transient store failure"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
