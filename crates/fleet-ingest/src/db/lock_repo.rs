//! Lock repository: lease rows in `processing_locks`.
//!
//! Times are epoch milliseconds. The check-and-insert in [`try_acquire`] runs in
//! an IMMEDIATE transaction, and the partial unique index on ACTIVE rows backs it
//! up for writers that bypass this module.

use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

use super::DatabaseError;
use crate::locks::{LockStatus, ProcessingLock, ResourceType};

const SELECT_COLUMNS: &str =
    "id, resource_id, resource_type, owner, acquired_at_ms, expires_at_ms, status, released_at_ms";

/// Result of an acquire attempt.
#[derive(Debug, Clone)]
pub enum AcquireOutcome {
    Granted(ProcessingLock),
    /// Another owner holds an unexpired lease.
    Held(ProcessingLock),
}

fn lock_from_row(row: &Row<'_>) -> rusqlite::Result<ProcessingLock> {
    Ok(ProcessingLock {
        id: row.get(0)?,
        resource_id: row.get(1)?,
        resource_type: row.get(2)?,
        owner: row.get(3)?,
        acquired_at_ms: row.get(4)?,
        expires_at_ms: row.get(5)?,
        status: row.get(6)?,
        released_at_ms: row.get(7)?,
    })
}

/// Flips every ACTIVE lease whose deadline has passed to EXPIRED.
pub fn expire_due(conn: &Connection, now_ms: i64) -> Result<usize, DatabaseError> {
    Ok(conn.execute(
        "UPDATE processing_locks SET status = ?1
         WHERE status = ?2 AND expires_at_ms <= ?3",
        params![LockStatus::Expired, LockStatus::Active, now_ms],
    )?)
}

/// The ACTIVE lease on a resource, if any.
pub fn find_active(
    conn: &Connection,
    resource_id: &str,
    resource_type: ResourceType,
) -> Result<Option<ProcessingLock>, DatabaseError> {
    let sql = format!(
        "SELECT {} FROM processing_locks
         WHERE resource_id = ?1 AND resource_type = ?2 AND status = ?3",
        SELECT_COLUMNS
    );
    Ok(conn
        .query_row(
            &sql,
            params![resource_id, resource_type, LockStatus::Active],
            lock_from_row,
        )
        .optional()?)
}

pub fn find_by_id(conn: &Connection, lock_id: &str) -> Result<Option<ProcessingLock>, DatabaseError> {
    let sql = format!("SELECT {} FROM processing_locks WHERE id = ?1", SELECT_COLUMNS);
    Ok(conn
        .query_row(&sql, params![lock_id], lock_from_row)
        .optional()?)
}

/// Atomically checks for a live lease and creates one if there is none.
pub fn try_acquire(
    conn: &mut Connection,
    resource_id: &str,
    resource_type: ResourceType,
    owner: &str,
    ttl_ms: i64,
    now_ms: i64,
) -> Result<AcquireOutcome, DatabaseError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    expire_due(&tx, now_ms)?;
    if let Some(holder) = find_active(&tx, resource_id, resource_type)? {
        tx.commit()?;
        return Ok(AcquireOutcome::Held(holder));
    }

    let lock = ProcessingLock {
        id: uuid::Uuid::new_v4().to_string(),
        resource_id: resource_id.to_string(),
        resource_type,
        owner: owner.to_string(),
        acquired_at_ms: now_ms,
        expires_at_ms: now_ms.saturating_add(ttl_ms),
        status: LockStatus::Active,
        released_at_ms: None,
    };
    tx.execute(
        "INSERT INTO processing_locks (id, resource_id, resource_type, owner,
         acquired_at_ms, expires_at_ms, status) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            lock.id,
            lock.resource_id,
            lock.resource_type,
            lock.owner,
            lock.acquired_at_ms,
            lock.expires_at_ms,
            lock.status,
        ],
    )?;
    tx.commit()?;

    Ok(AcquireOutcome::Granted(lock))
}

/// ACTIVE -> RELEASED. Returns false if the lease was not active.
pub fn release(conn: &Connection, lock_id: &str, now_ms: i64) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE processing_locks SET status = ?2, released_at_ms = ?3
         WHERE id = ?1 AND status = ?4",
        params![lock_id, LockStatus::Released, now_ms, LockStatus::Active],
    )?;
    Ok(changed > 0)
}

/// Moves the deadline of a live lease to `now + extra`. Returns the updated
/// lease, or `None` when it is no longer ACTIVE and unexpired.
pub fn renew(
    conn: &Connection,
    lock_id: &str,
    extra_ms: i64,
    now_ms: i64,
) -> Result<Option<ProcessingLock>, DatabaseError> {
    let changed = conn.execute(
        "UPDATE processing_locks SET expires_at_ms = ?2
         WHERE id = ?1 AND status = ?3 AND expires_at_ms > ?4",
        params![
            lock_id,
            now_ms.saturating_add(extra_ms),
            LockStatus::Active,
            now_ms
        ],
    )?;
    if changed == 0 {
        return Ok(None);
    }
    find_by_id(conn, lock_id)
}

/// Count of ACTIVE leases, used by the health probe.
pub fn count_active(conn: &Connection) -> Result<u64, DatabaseError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM processing_locks WHERE status = ?1",
        params![LockStatus::Active],
        |r| r.get(0),
    )?;
    Ok(count.max(0) as u64)
}
