//! Exclusive, time-bounded leases on files and vehicles.
//!
//! Leases live in the same SQLite file as the state store, so they are
//! durable and atomically checked but only meaningful to processes sharing
//! that database file.

mod manager;

pub use manager::{LockGrant, LockManager, DEFAULT_LOCK_TTL};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceType {
    File,
    Vehicle,
}

text_enum!(ResourceType, "resource type", {
    File => "FILE",
    Vehicle => "VEHICLE",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockStatus {
    Active,
    Expired,
    Released,
}

text_enum!(LockStatus, "lock status", {
    Active => "ACTIVE",
    Expired => "EXPIRED",
    Released => "RELEASED",
});

/// One lease row. Released and expired leases are never reused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingLock {
    pub id: String,
    pub resource_id: String,
    pub resource_type: ResourceType,
    pub owner: String,
    pub acquired_at_ms: i64,
    pub expires_at_ms: i64,
    pub status: LockStatus,
    pub released_at_ms: Option<i64>,
}

/// Key of the vehicle-level lease.
pub fn vehicle_resource_id(organization_id: &str, vehicle_id: &str) -> String {
    format!("{}:{}", organization_id, vehicle_id)
}

/// Key of the file-level lease. Keyed by content, not path, so a renamed copy
/// of a file in flight is also held.
pub fn file_resource_id(organization_id: &str, fingerprint: &str) -> String {
    format!("{}:{}", organization_id, fingerprint)
}
