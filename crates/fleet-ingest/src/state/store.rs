//! File state store: the (re)process decision and async transitions over
//! [`crate::db::file_repo`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;

use super::fingerprint::{identify, FileIdentity};
use super::record::{DecodeStatus, FileRecord, FileType, ProcessingStatus};
use crate::db::file_repo::{self, TransitionOutcome};
use crate::db::stats_repo::{self, ProcessingStats};
use crate::db::Database;
use crate::error::{IngestError, Result};

/// Caller-controlled rules for files that were already seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReprocessPolicy {
    pub reprocess_completed: bool,
    pub reprocess_failed: bool,
}

impl Default for ReprocessPolicy {
    fn default() -> Self {
        Self {
            reprocess_completed: false,
            reprocess_failed: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionReason {
    New,
    Pending,
    RetryFailed,
    ForcedReprocess,
    StaleProcessing,
    AlreadyCompleted,
    AlreadySkipped,
    InFlight,
    FailedReprocessDisabled,
    Missing,
}

impl DecisionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionReason::New => "new file",
            DecisionReason::Pending => "pending",
            DecisionReason::RetryFailed => "retrying failed file",
            DecisionReason::ForcedReprocess => "forced reprocessing",
            DecisionReason::StaleProcessing => "previous attempt abandoned",
            DecisionReason::AlreadyCompleted => "already completed",
            DecisionReason::AlreadySkipped => "already skipped",
            DecisionReason::InFlight => "processing in flight",
            DecisionReason::FailedReprocessDisabled => "reprocessing of failed files disabled",
            DecisionReason::Missing => "file missing or unreadable",
        }
    }
}

/// Whether a file should be processed now, always derived from the stored row.
#[derive(Debug, Clone)]
pub struct Decision {
    pub should_process: bool,
    pub reason: DecisionReason,
    pub existing: Option<FileRecord>,
    /// Identity computed while deciding; absent when the file was unreadable.
    pub identity: Option<FileIdentity>,
}

impl Decision {
    /// Pure decision rule over the stored row.
    pub fn evaluate(
        existing: Option<FileRecord>,
        identity: Option<FileIdentity>,
        policy: ReprocessPolicy,
        stale_processing_after: Duration,
    ) -> Self {
        let (should_process, reason) = match existing.as_ref().map(|r| r.processing_status) {
            None => (true, DecisionReason::New),
            Some(ProcessingStatus::Pending) => (true, DecisionReason::Pending),
            Some(ProcessingStatus::Completed) if policy.reprocess_completed => {
                (true, DecisionReason::ForcedReprocess)
            }
            Some(ProcessingStatus::Completed) => (false, DecisionReason::AlreadyCompleted),
            Some(ProcessingStatus::Skipped) if policy.reprocess_completed => {
                (true, DecisionReason::ForcedReprocess)
            }
            Some(ProcessingStatus::Skipped) => (false, DecisionReason::AlreadySkipped),
            Some(ProcessingStatus::Failed) if policy.reprocess_failed => {
                (true, DecisionReason::RetryFailed)
            }
            Some(ProcessingStatus::Failed) => (false, DecisionReason::FailedReprocessDisabled),
            Some(ProcessingStatus::Processing) => {
                let stale = existing
                    .as_ref()
                    .map(|r| is_stale(r, stale_processing_after))
                    .unwrap_or(false);
                if stale {
                    (true, DecisionReason::StaleProcessing)
                } else {
                    (false, DecisionReason::InFlight)
                }
            }
        };

        Self {
            should_process,
            reason,
            existing,
            identity,
        }
    }

    fn missing() -> Self {
        Self {
            should_process: false,
            reason: DecisionReason::Missing,
            existing: None,
            identity: None,
        }
    }
}

fn is_stale(record: &FileRecord, stale_processing_after: Duration) -> bool {
    let started = record.processing_started_at.unwrap_or(record.updated_at);
    let age = Utc::now().signed_duration_since(started);
    age.to_std()
        .map(|age| age > stale_processing_after)
        .unwrap_or(false)
}

/// Maps a conditional update outcome onto the error taxonomy: re-applying a
/// transition is a no-op, an illegal source state is `InvalidTransition`.
pub fn check_transition(
    outcome: TransitionOutcome,
    record_id: &str,
    target: ProcessingStatus,
) -> Result<()> {
    match outcome {
        TransitionOutcome::Applied | TransitionOutcome::Unchanged => Ok(()),
        TransitionOutcome::Rejected { current } => Err(IngestError::InvalidTransition {
            record_id: record_id.to_string(),
            from: current,
            to: target,
        }),
        TransitionOutcome::Missing => Err(IngestError::NotFound(record_id.to_string())),
    }
}

/// Async facade over the file record table.
#[derive(Clone)]
pub struct FileStateStore {
    db: Database,
    stale_processing_after: Duration,
}

impl FileStateStore {
    pub fn new(db: Database, stale_processing_after: Duration) -> Self {
        Self {
            db,
            stale_processing_after,
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub async fn decide(
        &self,
        path: &Path,
        organization_id: &str,
        policy: ReprocessPolicy,
    ) -> Result<Decision> {
        let identity = match identify(path).await {
            Ok(identity) => identity,
            Err(IngestError::Io { .. }) | Err(IngestError::Validation { .. }) => {
                log::debug!("Cannot read {}, treating as missing", path.display());
                return Ok(Decision::missing());
            }
            Err(e) => return Err(e),
        };

        let existing = self
            .find_by_fingerprint(organization_id, &identity.fingerprint)
            .await?;
        Ok(Decision::evaluate(
            existing,
            Some(identity),
            policy,
            self.stale_processing_after,
        ))
    }

    /// Re-evaluates the decision for an already registered record, reading
    /// the row fresh. Used after taking the file lock.
    pub async fn redecide(&self, record_id: &str, policy: ReprocessPolicy) -> Result<Decision> {
        let current = self.get(record_id).await?;
        if current.is_none() {
            return Err(IngestError::NotFound(record_id.to_string()));
        }
        Ok(Decision::evaluate(
            current,
            None,
            policy,
            self.stale_processing_after,
        ))
    }

    /// Fingerprints `path` and records the sighting.
    pub async fn register_or_update(
        &self,
        path: &Path,
        file_type: FileType,
        vehicle_id: &str,
        organization_id: &str,
    ) -> Result<(FileRecord, bool)> {
        let identity = identify(path).await?;
        self.register_identity(identity, file_type, vehicle_id, organization_id)
            .await
    }

    /// Records a sighting for an identity computed earlier.
    pub async fn register_identity(
        &self,
        identity: FileIdentity,
        file_type: FileType,
        vehicle_id: &str,
        organization_id: &str,
    ) -> Result<(FileRecord, bool)> {
        let vehicle_id = vehicle_id.to_string();
        let organization_id = organization_id.to_string();
        let (record, created) = self
            .db
            .run(move |conn| -> Result<(FileRecord, bool)> {
                Ok(file_repo::upsert_seen(
                    conn,
                    &identity,
                    &organization_id,
                    &vehicle_id,
                    file_type,
                    Utc::now(),
                )?)
            })
            .await?;

        if created {
            log::debug!(
                "Registered {} file {} ({})",
                record.file_type,
                record.name,
                record.fingerprint
            );
        }
        Ok((record, created))
    }

    pub async fn get(&self, record_id: &str) -> Result<Option<FileRecord>> {
        let record_id = record_id.to_string();
        self.db
            .run(move |conn| -> Result<_> { Ok(file_repo::find_by_id(conn, &record_id)?) })
            .await
    }

    pub async fn find_by_fingerprint(
        &self,
        organization_id: &str,
        fingerprint: &str,
    ) -> Result<Option<FileRecord>> {
        let organization_id = organization_id.to_string();
        let fingerprint = fingerprint.to_string();
        self.db
            .run(move |conn| -> Result<_> {
                Ok(file_repo::find_by_fingerprint(
                    conn,
                    &organization_id,
                    &fingerprint,
                )?)
            })
            .await
    }

    pub async fn mark_processing(&self, record_id: &str) -> Result<()> {
        let id = record_id.to_string();
        self.db
            .run(move |conn| -> Result<()> {
                let outcome = file_repo::mark_processing(conn, &id, Utc::now())?;
                check_transition(outcome, &id, ProcessingStatus::Processing)
            })
            .await
    }

    pub async fn mark_completed(
        &self,
        record_id: &str,
        data_points_count: u64,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        let id = record_id.to_string();
        self.db
            .run(move |conn| -> Result<()> {
                let outcome =
                    file_repo::mark_completed(conn, &id, data_points_count, &metadata, Utc::now())?;
                check_transition(outcome, &id, ProcessingStatus::Completed)
            })
            .await
    }

    pub async fn mark_failed(&self, record_id: &str, errors: Vec<String>) -> Result<()> {
        let id = record_id.to_string();
        self.db
            .run(move |conn| -> Result<()> {
                let outcome = file_repo::mark_failed(conn, &id, &errors, Utc::now())?;
                check_transition(outcome, &id, ProcessingStatus::Failed)
            })
            .await
    }

    pub async fn mark_skipped(&self, record_id: &str, reason: &str) -> Result<()> {
        let id = record_id.to_string();
        let reason = reason.to_string();
        self.db
            .run(move |conn| -> Result<()> {
                let outcome = file_repo::mark_skipped(conn, &id, &reason, Utc::now())?;
                check_transition(outcome, &id, ProcessingStatus::Skipped)
            })
            .await
    }

    /// Operator override moving a finished record back to PENDING.
    pub async fn reset_for_reprocessing(&self, record_id: &str) -> Result<()> {
        let id = record_id.to_string();
        self.db
            .run(move |conn| -> Result<()> {
                let outcome = file_repo::reset_for_reprocessing(conn, &id, Utc::now())?;
                check_transition(outcome, &id, ProcessingStatus::Pending)
            })
            .await
    }

    pub async fn update_decode_status(
        &self,
        record_id: &str,
        status: DecodeStatus,
        decoded_path: Option<PathBuf>,
    ) -> Result<()> {
        let id = record_id.to_string();
        self.db
            .run(move |conn| -> Result<()> {
                if file_repo::update_decode_status(
                    conn,
                    &id,
                    status,
                    decoded_path.as_deref(),
                    Utc::now(),
                )? {
                    Ok(())
                } else {
                    Err(IngestError::NotFound(id))
                }
            })
            .await
    }

    pub async fn pending_files(
        &self,
        organization_id: &str,
        vehicle_id: Option<&str>,
        limit: u64,
    ) -> Result<Vec<FileRecord>> {
        let organization_id = organization_id.to_string();
        let vehicle_id = vehicle_id.map(str::to_string);
        self.db
            .run(move |conn| -> Result<_> {
                Ok(file_repo::find_by_status(
                    conn,
                    &organization_id,
                    ProcessingStatus::Pending,
                    vehicle_id.as_deref(),
                    limit,
                )?)
            })
            .await
    }

    pub async fn files_needing_decode(
        &self,
        organization_id: &str,
        limit: u64,
    ) -> Result<Vec<FileRecord>> {
        let organization_id = organization_id.to_string();
        self.db
            .run(move |conn| -> Result<_> {
                Ok(file_repo::find_needing_decode(conn, &organization_id, limit)?)
            })
            .await
    }

    pub async fn processing_stats(
        &self,
        organization_id: &str,
        vehicle_id: Option<&str>,
    ) -> Result<ProcessingStats> {
        let organization_id = organization_id.to_string();
        let vehicle_id = vehicle_id.map(str::to_string);
        self.db
            .run(move |conn| -> Result<_> {
                Ok(stats_repo::processing_stats(
                    conn,
                    &organization_id,
                    vehicle_id.as_deref(),
                )?)
            })
            .await
    }
}
