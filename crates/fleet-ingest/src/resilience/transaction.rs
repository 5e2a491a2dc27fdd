//! All-or-nothing execution against the state store.
//!
//! A unit is split in two: async `work` (decode, parse) that produces a staged
//! value without touching the database, and a synchronous `commit` that
//! applies every write inside one SQLite transaction. Any error rolls the
//! transaction back. A retryable error reruns the whole unit from scratch.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::{Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::retry::{backoff, should_retry, RetryPolicy};
use super::timeout::{with_timeout, OperationClass, TimeoutConfig};
use crate::db::Database;
use crate::error::{IngestError, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Isolation {
    Deferred,
    #[default]
    Immediate,
    Exclusive,
}

impl Isolation {
    fn behavior(self) -> TransactionBehavior {
        match self {
            Isolation::Deferred => TransactionBehavior::Deferred,
            Isolation::Immediate => TransactionBehavior::Immediate,
            Isolation::Exclusive => TransactionBehavior::Exclusive,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransactionOptions {
    /// Deadline for one attempt of work plus commit. `None` leaves the
    /// deadline to the steps inside `work`.
    pub timeout: Option<Duration>,
    /// Overrides the policy's retry count.
    pub retries: Option<u32>,
    pub isolation: Isolation,
}

/// Runs `commit` inside one transaction on the blocking pool. Cancelling
/// `cancel` aborts the statement in flight and rolls back.
pub async fn commit_in_transaction<S, C, T>(
    db: &Database,
    isolation: Isolation,
    cancel: &CancellationToken,
    staged: S,
    commit: Arc<C>,
) -> Result<T>
where
    S: Send + 'static,
    T: Send + 'static,
    C: Fn(&Transaction<'_>, S) -> Result<T> + Send + Sync + 'static,
{
    db.run_cancellable(cancel, move |conn| -> Result<T> {
        let tx = conn
            .transaction_with_behavior(isolation.behavior())
            .map_err(crate::db::DatabaseError::from)?;
        // Dropping `tx` on error rolls it back.
        let value = commit(&tx, staged)?;
        tx.commit().map_err(crate::db::DatabaseError::from)?;
        Ok(value)
    })
    .await
}

/// `retry(timeout(work -> commit))`.
#[allow(clippy::too_many_arguments)]
pub async fn with_transaction<W, WFut, S, C, T>(
    operation: &str,
    db: &Database,
    options: &TransactionOptions,
    retry: &RetryPolicy,
    timeouts: &TimeoutConfig,
    cancel: &CancellationToken,
    mut work: W,
    commit: C,
) -> Result<T>
where
    W: FnMut(CancellationToken) -> WFut,
    WFut: Future<Output = Result<S>>,
    S: Send + 'static,
    T: Send + 'static,
    C: Fn(&Transaction<'_>, S) -> Result<T> + Send + Sync + 'static,
{
    let commit = Arc::new(commit);
    let policy = RetryPolicy {
        max_retries: options.retries.unwrap_or(retry.max_retries),
        ..retry.clone()
    };
    let isolation = options.isolation;

    let mut attempt = 0u32;
    loop {
        if attempt > 0 {
            log::debug!(
                "{}: rerunning unit from scratch (attempt {})",
                operation,
                attempt + 1
            );
        }

        let commit = Arc::clone(&commit);
        let unit = |token: CancellationToken| {
            let staged = work(token.clone());
            async move {
                let staged = staged.await?;
                commit_in_transaction(db, isolation, &token, staged, commit).await
            }
        };

        let result = match options.timeout {
            Some(deadline) => {
                with_timeout(
                    operation,
                    OperationClass::File,
                    Some(deadline),
                    timeouts,
                    cancel,
                    unit,
                )
                .await
                .into_result()
            }
            None => unit(cancel.child_token()).await,
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) if should_retry(&policy, attempt, &e, IngestError::is_retryable) => {
                backoff(operation, &policy, attempt, &e, cancel).await?;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
