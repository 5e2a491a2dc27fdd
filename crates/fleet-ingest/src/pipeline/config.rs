use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::state::ReprocessPolicy;

/// Orchestrator tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PipelineConfig {
    /// Files processed at once within one file type.
    pub max_concurrent_files: usize,
    /// Vehicles processed at once by the organization batch.
    pub vehicle_concurrency: usize,
    pub vehicle_lock_ttl_ms: u64,
    pub file_lock_ttl_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_files: 3,
            vehicle_concurrency: 2,
            vehicle_lock_ttl_ms: 30 * 60 * 1000,
            file_lock_ttl_ms: 30 * 60 * 1000,
        }
    }
}

impl PipelineConfig {
    pub fn vehicle_lock_ttl(&self) -> Duration {
        Duration::from_millis(self.vehicle_lock_ttl_ms)
    }

    pub fn file_lock_ttl(&self) -> Duration {
        Duration::from_millis(self.file_lock_ttl_ms)
    }
}

/// Per-request switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProcessOptions {
    pub reprocess_completed: bool,
    pub reprocess_failed: bool,
    pub decode_can_files: bool,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            reprocess_completed: false,
            reprocess_failed: true,
            decode_can_files: true,
        }
    }
}

impl ProcessOptions {
    pub fn policy(&self) -> ReprocessPolicy {
        ReprocessPolicy {
            reprocess_completed: self.reprocess_completed,
            reprocess_failed: self.reprocess_failed,
        }
    }
}
