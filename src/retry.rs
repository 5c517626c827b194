//! Retry policy and the executor every external call goes through.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, warn};

use crate::step::StepError;

/// Retries used when nothing else is configured.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Delay between retries used when nothing else is configured.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// How many times a transient failure is retried, and how long to wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Give up on the first transient failure.
    None,

    /// Same wait before every retry.
    Fixed { max_retries: u32, delay: Duration },

    /// Wait doubles after every retry, never exceeding `max_delay`.
    Exponential {
        max_retries: u32,
        initial_delay: Duration,
        max_delay: Duration,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY)
    }
}

impl RetryPolicy {
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self::Fixed { max_retries, delay }
    }

    /// Doubling backoff from one second, capped at five minutes.
    pub fn exponential(max_retries: u32) -> Self {
        Self::Exponential {
            max_retries,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
        }
    }

    pub fn max_retries(&self) -> u32 {
        match self {
            Self::None => 0,
            Self::Fixed { max_retries, .. } | Self::Exponential { max_retries, .. } => *max_retries,
        }
    }

    /// Wait before retry number `retry` (1-based), or `None` once the
    /// retries are used up.
    pub fn delay_before_retry(&self, retry: u32) -> Option<Duration> {
        if retry == 0 || retry > self.max_retries() {
            return None;
        }
        match self {
            Self::None => None,
            Self::Fixed { delay, .. } => Some(*delay),
            Self::Exponential {
                initial_delay,
                max_delay,
                ..
            } => {
                let factor = 1u32.checked_shl(retry - 1).unwrap_or(u32::MAX);
                Some(initial_delay.saturating_mul(factor).min(*max_delay))
            }
        }
    }
}

/// Final failure of a call made through [`RetryExecutor`].
#[derive(Error, Debug)]
pub enum RetryError {
    /// Every attempt failed with a transient error.
    #[error("{message} (gave up after {attempts} attempts): {source}")]
    Exhausted {
        message: String,
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },

    /// The call failed with an error that retrying cannot fix.
    #[error("{message}: {source}")]
    Permanent {
        message: String,
        #[source]
        source: anyhow::Error,
    },
}

impl From<RetryError> for StepError {
    fn from(err: RetryError) -> Self {
        match err {
            RetryError::Exhausted { .. } => StepError::Retryable(err.into()),
            RetryError::Permanent { .. } => StepError::Permanent(err.into()),
        }
    }
}

/// Runs calls against external services, retrying transient failures.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// An executor that never retries.
    pub fn no_retry() -> Self {
        Self::new(RetryPolicy::None)
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` until it succeeds, fails permanently, or the policy
    /// runs out of retries.
    ///
    /// `message` describes the call and prefixes the final error.
    pub async fn execute<T, F, Fut>(&self, message: &str, mut operation: F) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StepError>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => return Ok(value),
                Err(StepError::Permanent(source)) => {
                    return Err(RetryError::Permanent {
                        message: message.to_string(),
                        source,
                    });
                }
                Err(StepError::Retryable(source)) => match self.policy.delay_before_retry(attempt) {
                    Some(delay) => {
                        warn!(
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %source,
                            "{message}; retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        error!(attempts = attempt, error = %source, "{message}; giving up");
                        return Err(RetryError::Exhausted {
                            message: message.to_string(),
                            attempts: attempt,
                            source,
                        });
                    }
                },
            }
        }
    }
}
