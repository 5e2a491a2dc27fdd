use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{ProcessingLock, ResourceType};
use crate::db::lock_repo::{self, AcquireOutcome};
use crate::db::Database;
use crate::error::{IngestError, Result};

pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(30 * 60);

/// Outcome of [`LockManager::acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockGrant {
    pub granted: bool,
    pub lock_id: Option<String>,
    /// Owner of the live lease when not granted.
    pub held_by: Option<String>,
}

#[derive(Clone)]
pub struct LockManager {
    db: Database,
    default_ttl: Duration,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

impl LockManager {
    pub fn new(db: Database, default_ttl: Duration) -> Self {
        Self { db, default_ttl }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Grants a new lease unless an unexpired ACTIVE one exists for the key.
    pub async fn acquire(
        &self,
        resource_id: &str,
        resource_type: ResourceType,
        owner: &str,
        ttl: Option<Duration>,
    ) -> Result<LockGrant> {
        let ttl_ms = duration_ms(ttl.unwrap_or(self.default_ttl));
        let resource_id = resource_id.to_string();
        let owner = owner.to_string();

        let outcome = self
            .db
            .run(move |conn| -> Result<AcquireOutcome> {
                Ok(lock_repo::try_acquire(
                    conn,
                    &resource_id,
                    resource_type,
                    &owner,
                    ttl_ms,
                    now_ms(),
                )?)
            })
            .await?;

        Ok(match outcome {
            AcquireOutcome::Granted(lock) => {
                log::debug!(
                    "Lock {} granted on {} {} to {}",
                    lock.id,
                    lock.resource_type,
                    lock.resource_id,
                    lock.owner
                );
                LockGrant {
                    granted: true,
                    lock_id: Some(lock.id),
                    held_by: None,
                }
            }
            AcquireOutcome::Held(holder) => {
                log::debug!(
                    "{} {} is held by {} until {}",
                    holder.resource_type,
                    holder.resource_id,
                    holder.owner,
                    holder.expires_at_ms
                );
                LockGrant {
                    granted: false,
                    lock_id: None,
                    held_by: Some(holder.owner),
                }
            }
        })
    }

    /// Releasing an inactive or unknown lease is a no-op. Returns whether
    /// this call released it.
    pub async fn release(&self, lock_id: &str) -> Result<bool> {
        let lock_id = lock_id.to_string();
        self.db
            .run(move |conn| -> Result<bool> { Ok(lock_repo::release(conn, &lock_id, now_ms())?) })
            .await
    }

    /// Best-effort release of every id. Failures are logged, never raised.
    pub async fn release_all(&self, lock_ids: &[String]) -> usize {
        let mut released = 0;
        for lock_id in lock_ids {
            match self.release(lock_id).await {
                Ok(true) => released += 1,
                Ok(false) => {}
                Err(e) => e.log(&format!("Failed to release lock {}", lock_id)),
            }
        }
        released
    }

    /// Extends a live lease to `now + extra`.
    pub async fn renew(&self, lock_id: &str, extra: Duration) -> Result<ProcessingLock> {
        let id = lock_id.to_string();
        let extra_ms = duration_ms(extra);
        self.db
            .run(move |conn| -> Result<ProcessingLock> {
                lock_repo::renew(conn, &id, extra_ms, now_ms())?
                    .ok_or(IngestError::LockExpired { lock_id: id })
            })
            .await
    }

    /// Flips overdue ACTIVE leases to EXPIRED.
    pub async fn sweep_expired(&self) -> Result<usize> {
        self.db
            .run(|conn| -> Result<usize> { Ok(lock_repo::expire_due(conn, now_ms())?) })
            .await
    }

    pub async fn active_count(&self) -> Result<u64> {
        self.db
            .run(|conn| -> Result<u64> {
                lock_repo::expire_due(conn, now_ms())?;
                Ok(lock_repo::count_active(conn)?)
            })
            .await
    }

    pub async fn get(&self, lock_id: &str) -> Result<Option<ProcessingLock>> {
        let lock_id = lock_id.to_string();
        self.db
            .run(move |conn| -> Result<_> { Ok(lock_repo::find_by_id(conn, &lock_id)?) })
            .await
    }

    /// Runs [`LockManager::sweep_expired`] every `interval` until `shutdown`
    /// is cancelled.
    pub fn spawn_sweeper(&self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.tick().await; // skip immediate first tick

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = timer.tick() => {}
                }

                match manager.sweep_expired().await {
                    Ok(0) => {}
                    Ok(n) => log::info!("Expired {} stale lock(s)", n),
                    Err(e) => e.log("Lock sweep failed"),
                }
            }
            log::debug!("Lock sweeper stopped");
        })
    }
}
