//! Timeouts that actually stop the work they time out.
//!
//! The operation receives a [`CancellationToken`]. When the deadline passes the
//! token is cancelled and the operation gets a short grace period to unwind
//! (abort its SQLite statement, kill its subprocess). If it still finishes
//! successfully inside the grace period its value is returned, since whatever
//! it wrote has landed; otherwise the future is dropped and a timeout error
//! is reported.

use std::future::Future;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{IngestError, Result};

/// Default deadline families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationClass {
    File,
    Store,
    Network,
    ExternalDecode,
}

impl OperationClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationClass::File => "file",
            OperationClass::Store => "store",
            OperationClass::Network => "network",
            OperationClass::ExternalDecode => "external_decode",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TimeoutConfig {
    pub file_ms: u64,
    pub store_ms: u64,
    pub network_ms: u64,
    pub external_decode_ms: u64,
    /// How long a cancelled operation may take to unwind.
    pub cancel_grace_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            file_ms: 60_000,
            store_ms: 30_000,
            network_ms: 15_000,
            external_decode_ms: 300_000,
            cancel_grace_ms: 1_000,
        }
    }
}

impl TimeoutConfig {
    pub fn for_class(&self, class: OperationClass) -> Duration {
        Duration::from_millis(match class {
            OperationClass::File => self.file_ms,
            OperationClass::Store => self.store_ms,
            OperationClass::Network => self.network_ms,
            OperationClass::ExternalDecode => self.external_decode_ms,
        })
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

/// Result plus wall time of a timed operation.
#[derive(Debug)]
pub struct TimedOutcome<T> {
    pub result: Result<T>,
    pub elapsed: Duration,
    pub timed_out: bool,
}

impl<T> TimedOutcome<T> {
    pub fn into_result(self) -> Result<T> {
        self.result
    }
}

/// Runs `op` under a deadline of `timeout`, or the class default when `None`.
///
/// The token handed to `op` is a child of `parent`, so cancelling the parent
/// also cancels the operation.
pub async fn with_timeout<F, Fut, T>(
    operation: &str,
    class: OperationClass,
    timeout: Option<Duration>,
    config: &TimeoutConfig,
    parent: &CancellationToken,
    op: F,
) -> TimedOutcome<T>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let deadline = timeout.unwrap_or_else(|| config.for_class(class));
    let token = parent.child_token();
    let started = Instant::now();
    let fut = op(token.clone());
    tokio::pin!(fut);

    let first = tokio::select! {
        result = &mut fut => Some(result),
        _ = tokio::time::sleep(deadline) => None,
    };

    if let Some(result) = first {
        return TimedOutcome {
            result,
            elapsed: started.elapsed(),
            timed_out: false,
        };
    }

    token.cancel();
    let settled = tokio::time::timeout(config.cancel_grace(), &mut fut).await;
    let elapsed = started.elapsed();

    match settled {
        Ok(Ok(value)) => {
            log::warn!(
                "{} finished after its {}ms deadline while being cancelled; keeping its result",
                operation,
                deadline.as_millis()
            );
            TimedOutcome {
                result: Ok(value),
                elapsed,
                timed_out: true,
            }
        }
        Ok(Err(e)) => {
            log::debug!("{} unwound after timeout: {}", operation, e);
            TimedOutcome {
                result: Err(timeout_error(operation, elapsed)),
                elapsed,
                timed_out: true,
            }
        }
        Err(_) => {
            log::warn!(
                "{} did not unwind within {}ms of cancellation; dropping it",
                operation,
                config.cancel_grace_ms
            );
            TimedOutcome {
                result: Err(timeout_error(operation, elapsed)),
                elapsed,
                timed_out: true,
            }
        }
    }
}

fn timeout_error(operation: &str, elapsed: Duration) -> IngestError {
    IngestError::Timeout {
        operation: operation.to_string(),
        elapsed_ms: elapsed.as_millis() as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn fast_config() -> TimeoutConfig {
        TimeoutConfig {
            cancel_grace_ms: 50,
            ..TimeoutConfig::default()
        }
    }

    #[tokio::test]
    async fn test_completes_within_deadline() {
        let outcome = with_timeout(
            "quick",
            OperationClass::File,
            Some(Duration::from_secs(1)),
            &fast_config(),
            &CancellationToken::new(),
            |_token| async { Ok(7) },
        )
        .await;
        assert!(!outcome.timed_out);
        assert_eq!(outcome.result.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_timeout_cancels_token() {
        let observed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&observed);

        let outcome: TimedOutcome<()> = with_timeout(
            "slow",
            OperationClass::Store,
            Some(Duration::from_millis(20)),
            &fast_config(),
            &CancellationToken::new(),
            |token| async move {
                token.cancelled().await;
                flag.store(true, Ordering::SeqCst);
                Err(IngestError::Cancelled("stopped".to_string()))
            },
        )
        .await;

        assert!(outcome.timed_out);
        assert!(observed.load(Ordering::SeqCst));
        assert!(matches!(outcome.result, Err(IngestError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_unresponsive_operation_is_dropped() {
        let outcome: TimedOutcome<()> = with_timeout(
            "stuck",
            OperationClass::Network,
            Some(Duration::from_millis(10)),
            &fast_config(),
            &CancellationToken::new(),
            |_token| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            },
        )
        .await;
        assert!(outcome.timed_out);
        assert!(outcome.elapsed < Duration::from_secs(5));
        assert!(outcome.result.unwrap_err().is_timeout());
    }

    #[tokio::test]
    async fn test_success_during_grace_is_kept() {
        let outcome = with_timeout(
            "late",
            OperationClass::File,
            Some(Duration::from_millis(10)),
            &fast_config(),
            &CancellationToken::new(),
            |token| async move {
                token.cancelled().await;
                Ok("committed")
            },
        )
        .await;
        assert!(outcome.timed_out);
        assert_eq!(outcome.result.unwrap(), "committed");
    }

    #[tokio::test]
    async fn test_parent_cancellation_reaches_operation() {
        let parent = CancellationToken::new();
        parent.cancel();
        let outcome = with_timeout(
            "child",
            OperationClass::File,
            None,
            &fast_config(),
            &parent,
            |token| async move { Ok(token.is_cancelled()) },
        )
        .await;
        assert!(outcome.result.unwrap());
    }

    #[test]
    fn test_class_defaults() {
        let config = TimeoutConfig::default();
        assert_eq!(config.for_class(OperationClass::File), Duration::from_secs(60));
        assert_eq!(config.for_class(OperationClass::Store), Duration::from_secs(30));
        assert_eq!(config.for_class(OperationClass::Network), Duration::from_secs(15));
        assert_eq!(
            config.for_class(OperationClass::ExternalDecode),
            Duration::from_secs(300)
        );
    }
}
