//! Timeout, retry and transactional execution.

pub mod retry;
pub mod timeout;
pub mod transaction;

use std::future::Future;
use std::time::Duration;

use rusqlite::Transaction;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

pub use retry::{is_transient, with_retry, RetryPolicy};
pub use timeout::{with_timeout, OperationClass, TimedOutcome, TimeoutConfig};
pub use transaction::{with_transaction, Isolation, TransactionOptions};

use crate::db::Database;
use crate::error::Result;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResilienceConfig {
    pub timeouts: TimeoutConfig,
    pub retry: RetryPolicy,
    pub isolation: Isolation,
}

/// Bundles the policies so call sites only name the operation.
#[derive(Clone)]
pub struct ResilienceController {
    db: Database,
    config: ResilienceConfig,
}

impl ResilienceController {
    pub fn new(db: Database, config: ResilienceConfig) -> Self {
        Self { db, config }
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    pub async fn with_timeout<F, Fut, T>(
        &self,
        operation: &str,
        class: OperationClass,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
        op: F,
    ) -> TimedOutcome<T>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        with_timeout(operation, class, timeout, &self.config.timeouts, cancel, op).await
    }

    pub async fn with_retry<F, Fut, T>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        with_retry(operation, &self.config.retry, is_transient, cancel, op).await
    }

    /// Runs `work` then `commit` as one retried, all-or-nothing unit.
    pub async fn with_transaction<W, WFut, S, C, T>(
        &self,
        operation: &str,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
        work: W,
        commit: C,
    ) -> Result<T>
    where
        W: FnMut(CancellationToken) -> WFut,
        WFut: Future<Output = Result<S>>,
        S: Send + 'static,
        T: Send + 'static,
        C: Fn(&Transaction<'_>, S) -> Result<T> + Send + Sync + 'static,
    {
        let options = TransactionOptions {
            timeout,
            retries: None,
            isolation: self.config.isolation,
        };
        with_transaction(
            operation,
            &self.db,
            &options,
            &self.config.retry,
            &self.config.timeouts,
            cancel,
            work,
            commit,
        )
        .await
    }

    /// Shorthand for a timed step whose timeout is reported as an error.
    pub async fn timed<F, Fut, T>(
        &self,
        operation: &str,
        class: OperationClass,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<T>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let outcome = self.with_timeout(operation, class, None, cancel, op).await;
        if outcome.timed_out {
            log::warn!(
                "{} hit its {} deadline after {}ms",
                operation,
                class.as_str(),
                outcome.elapsed.as_millis()
            );
        }
        outcome.result
    }
}

