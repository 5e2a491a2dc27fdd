//! Exponential-backoff retry for transient failures.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{IngestError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay_ms: u64,
    /// Ceiling for store and other transient errors.
    pub max_delay_ms: u64,
    /// Ceiling when the failure was a timeout.
    pub timeout_max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
            timeout_max_delay_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// `base * 2^attempt`, capped by the ceiling for the kind of error.
    pub fn delay_for(&self, attempt: u32, error: &IngestError) -> Duration {
        let cap = if error.is_timeout() {
            self.timeout_max_delay_ms
        } else {
            self.max_delay_ms
        };
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(cap))
    }
}

/// Default classifier, see [`IngestError::is_retryable`].
pub fn is_transient(error: &IngestError) -> bool {
    error.is_retryable()
}

/// Whether `error` after `attempt` (zero-based) warrants another attempt.
pub fn should_retry<C>(policy: &RetryPolicy, attempt: u32, error: &IngestError, classify: C) -> bool
where
    C: Fn(&IngestError) -> bool,
{
    attempt < policy.max_retries && !error.is_cancelled() && classify(error)
}

/// Sleeps for the backoff delay of `attempt`, or returns `Cancelled` if
/// `cancel` fires first.
pub async fn backoff(
    operation: &str,
    policy: &RetryPolicy,
    attempt: u32,
    error: &IngestError,
    cancel: &CancellationToken,
) -> Result<()> {
    let delay = policy.delay_for(attempt, error);
    log::warn!(
        "{} failed with retryable error (attempt {}/{}), retrying in {}ms: {}",
        operation,
        attempt + 1,
        policy.max_retries + 1,
        delay.as_millis(),
        error
    );
    tokio::select! {
        _ = cancel.cancelled() => Err(IngestError::Cancelled(format!(
            "{} cancelled while waiting to retry",
            operation
        ))),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Runs `op` until it succeeds, returns a non-retryable error, or runs out of
/// retries. `op` receives the zero-based attempt number. Cancelling `cancel`
/// interrupts the backoff sleep.
pub async fn with_retry<F, Fut, T, C>(
    operation: &str,
    policy: &RetryPolicy,
    classify: C,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
    C: Fn(&IngestError) -> bool,
{
    let mut attempt = 0u32;
    loop {
        match op(attempt).await {
            Ok(value) => {
                if attempt > 0 {
                    log::info!("{} succeeded on attempt {}", operation, attempt + 1);
                }
                return Ok(value);
            }
            Err(e) if should_retry(policy, attempt, &e, &classify) => {
                backoff(operation, policy, attempt, &e, cancel).await?;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
