//! File record repository: identity upserts and state transitions for the
//! `file_records` table.
//!
//! Every function takes a plain `&Connection` so it can run standalone or
//! inside a caller's transaction. Transitions are conditional updates: the
//! `WHERE processing_status IN (...)` clause is what keeps the state machine
//! intact when two writers race.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::DatabaseError;
use crate::state::{
    DecodeStatus, FileIdentity, FileRecord, FileType, ProcessingStatus,
};

/// Only the most recent errors are kept on a record.
pub const MAX_ERROR_HISTORY: usize = 50;

const SELECT_COLUMNS: &str = "id, organization_id, fingerprint, path, name, size_bytes,
    vehicle_id, file_type, processing_status, decode_status, decoded_path, data_points_count,
    last_processed_at, processing_errors, metadata, attempt_count, processing_started_at,
    created_at, updated_at";

/// Result of a conditional state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The row moved to the target state.
    Applied,
    /// The row was already in the target state; nothing changed.
    Unchanged,
    /// The row is in a state the transition may not start from.
    Rejected { current: ProcessingStatus },
    /// No row with that id.
    Missing,
}

fn conversion_error<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

fn parse_timestamp(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<FileRecord> {
    let last_processed_at: Option<String> = row.get(12)?;
    let errors_json: String = row.get(13)?;
    let metadata_json: String = row.get(14)?;
    let processing_started_at: Option<String> = row.get(16)?;
    let created_at: String = row.get(17)?;
    let updated_at: String = row.get(18)?;

    Ok(FileRecord {
        id: row.get(0)?,
        organization_id: row.get(1)?,
        fingerprint: row.get(2)?,
        path: PathBuf::from(row.get::<_, String>(3)?),
        name: row.get(4)?,
        size_bytes: row.get::<_, i64>(5)?.max(0) as u64,
        vehicle_id: row.get(6)?,
        file_type: row.get(7)?,
        processing_status: row.get(8)?,
        decode_status: row.get(9)?,
        decoded_path: row.get::<_, Option<String>>(10)?.map(PathBuf::from),
        data_points_count: row.get::<_, i64>(11)?.max(0) as u64,
        last_processed_at: last_processed_at
            .as_deref()
            .map(|raw| parse_timestamp(12, raw))
            .transpose()?,
        processing_errors: serde_json::from_str(&errors_json)
            .map_err(|e| conversion_error(13, e))?,
        metadata: serde_json::from_str(&metadata_json).map_err(|e| conversion_error(14, e))?,
        attempt_count: row.get(15)?,
        processing_started_at: processing_started_at
            .as_deref()
            .map(|raw| parse_timestamp(16, raw))
            .transpose()?,
        created_at: parse_timestamp(17, &created_at)?,
        updated_at: parse_timestamp(18, &updated_at)?,
    })
}

fn now_string(now: DateTime<Utc>) -> String {
    now.to_rfc3339()
}

fn status_list(statuses: &[ProcessingStatus]) -> String {
    statuses
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn current_status(conn: &Connection, id: &str) -> Result<Option<ProcessingStatus>, DatabaseError> {
    Ok(conn
        .query_row(
            "SELECT processing_status FROM file_records WHERE id = ?1",
            params![id],
            |r| r.get(0),
        )
        .optional()?)
}

fn resolve_outcome(
    conn: &Connection,
    id: &str,
    changed: usize,
    target: ProcessingStatus,
) -> Result<TransitionOutcome, DatabaseError> {
    if changed > 0 {
        return Ok(TransitionOutcome::Applied);
    }
    Ok(match current_status(conn, id)? {
        None => TransitionOutcome::Missing,
        Some(current) if current == target => TransitionOutcome::Unchanged,
        Some(current) => TransitionOutcome::Rejected { current },
    })
}

/// Finds a record by its id.
pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<FileRecord>, DatabaseError> {
    let sql = format!("SELECT {} FROM file_records WHERE id = ?1", SELECT_COLUMNS);
    Ok(conn
        .query_row(&sql, params![id], record_from_row)
        .optional()?)
}

/// Finds the record for a content fingerprint within an organization.
pub fn find_by_fingerprint(
    conn: &Connection,
    organization_id: &str,
    fingerprint: &str,
) -> Result<Option<FileRecord>, DatabaseError> {
    let sql = format!(
        "SELECT {} FROM file_records WHERE organization_id = ?1 AND fingerprint = ?2",
        SELECT_COLUMNS
    );
    Ok(conn
        .query_row(&sql, params![organization_id, fingerprint], record_from_row)
        .optional()?)
}

/// Records a sighting of `identity`. Inserts a PENDING row for an unseen
/// fingerprint; otherwise refreshes only `path`, `name` and `size_bytes`.
/// A sighting is not a state change, so `updated_at` is left alone.
/// Returns the stored record and whether it was created.
pub fn upsert_seen(
    conn: &Connection,
    identity: &FileIdentity,
    organization_id: &str,
    vehicle_id: &str,
    file_type: FileType,
    now: DateTime<Utc>,
) -> Result<(FileRecord, bool), DatabaseError> {
    let now = now_string(now);
    let path = identity.path.display().to_string();

    let inserted = conn.execute(
        "INSERT INTO file_records (id, organization_id, fingerprint, path, name, size_bytes,
         vehicle_id, file_type, processing_status, decode_status, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
         ON CONFLICT(organization_id, fingerprint) DO NOTHING",
        params![
            uuid::Uuid::new_v4().to_string(),
            organization_id,
            identity.fingerprint,
            path,
            identity.name,
            identity.size_bytes as i64,
            vehicle_id,
            file_type,
            ProcessingStatus::Pending,
            DecodeStatus::NotDecoded,
            now,
        ],
    )?;

    if inserted == 0 {
        conn.execute(
            "UPDATE file_records SET path = ?3, name = ?4, size_bytes = ?5
             WHERE organization_id = ?1 AND fingerprint = ?2",
            params![
                organization_id,
                identity.fingerprint,
                path,
                identity.name,
                identity.size_bytes as i64,
            ],
        )?;
    }

    let record = find_by_fingerprint(conn, organization_id, &identity.fingerprint)?.ok_or(
        DatabaseError::InvalidColumn {
            column: "fingerprint",
            value: identity.fingerprint.clone(),
        },
    )?;
    Ok((record, inserted > 0))
}

/// PENDING | FAILED -> PROCESSING. Bumps the attempt counter and stamps
/// `processing_started_at`, the clock abandoned attempts are measured on.
pub fn mark_processing(
    conn: &Connection,
    id: &str,
    now: DateTime<Utc>,
) -> Result<TransitionOutcome, DatabaseError> {
    let sql = format!(
        "UPDATE file_records SET processing_status = ?2, attempt_count = attempt_count + 1,
         last_processed_at = ?3, processing_started_at = ?3, updated_at = ?3
         WHERE id = ?1 AND processing_status IN ({})",
        status_list(&[ProcessingStatus::Pending, ProcessingStatus::Failed])
    );
    let changed = conn.execute(
        &sql,
        params![id, ProcessingStatus::Processing, now_string(now)],
    )?;
    resolve_outcome(conn, id, changed, ProcessingStatus::Processing)
}

/// PROCESSING -> COMPLETED. `metadata` is merged into the stored map.
pub fn mark_completed(
    conn: &Connection,
    id: &str,
    data_points_count: u64,
    metadata: &serde_json::Map<String, serde_json::Value>,
    now: DateTime<Utc>,
) -> Result<TransitionOutcome, DatabaseError> {
    let metadata_json = serde_json::to_string(metadata).map_err(|e| DatabaseError::Json {
        column: "metadata",
        source: e,
    })?;
    let changed = conn.execute(
        "UPDATE file_records SET processing_status = ?2, data_points_count = ?3,
         metadata = json_patch(metadata, ?4), last_processed_at = ?5, updated_at = ?5
         WHERE id = ?1 AND processing_status = ?6",
        params![
            id,
            ProcessingStatus::Completed,
            data_points_count as i64,
            metadata_json,
            now_string(now),
            ProcessingStatus::Processing,
        ],
    )?;
    resolve_outcome(conn, id, changed, ProcessingStatus::Completed)
}

/// PROCESSING -> FAILED. Appends `errors` to the record's error history.
pub fn mark_failed(
    conn: &Connection,
    id: &str,
    errors: &[String],
    now: DateTime<Utc>,
) -> Result<TransitionOutcome, DatabaseError> {
    let existing: Option<(ProcessingStatus, String)> = conn
        .query_row(
            "SELECT processing_status, processing_errors FROM file_records WHERE id = ?1",
            params![id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;

    let Some((status, errors_json)) = existing else {
        return Ok(TransitionOutcome::Missing);
    };
    if status != ProcessingStatus::Processing {
        return resolve_outcome(conn, id, 0, ProcessingStatus::Failed);
    }

    let mut history: Vec<String> =
        serde_json::from_str(&errors_json).map_err(|e| DatabaseError::Json {
            column: "processing_errors",
            source: e,
        })?;
    history.extend(errors.iter().cloned());
    if history.len() > MAX_ERROR_HISTORY {
        let excess = history.len() - MAX_ERROR_HISTORY;
        history.drain(..excess);
    }
    let history_json = serde_json::to_string(&history).map_err(|e| DatabaseError::Json {
        column: "processing_errors",
        source: e,
    })?;

    let changed = conn.execute(
        "UPDATE file_records SET processing_status = ?2, processing_errors = ?3,
         last_processed_at = ?4, updated_at = ?4
         WHERE id = ?1 AND processing_status = ?5",
        params![
            id,
            ProcessingStatus::Failed,
            history_json,
            now_string(now),
            ProcessingStatus::Processing,
        ],
    )?;
    resolve_outcome(conn, id, changed, ProcessingStatus::Failed)
}

/// PENDING | FAILED -> SKIPPED, recording why under `metadata.skipReason`.
pub fn mark_skipped(
    conn: &Connection,
    id: &str,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<TransitionOutcome, DatabaseError> {
    let sql = format!(
        "UPDATE file_records SET processing_status = ?2,
         metadata = json_patch(metadata, json_object('skipReason', ?3)),
         last_processed_at = ?4, updated_at = ?4
         WHERE id = ?1 AND processing_status IN ({})",
        status_list(&[ProcessingStatus::Pending, ProcessingStatus::Failed])
    );
    let changed = conn.execute(
        &sql,
        params![id, ProcessingStatus::Skipped, reason, now_string(now)],
    )?;
    resolve_outcome(conn, id, changed, ProcessingStatus::Skipped)
}

/// Operator override: COMPLETED | SKIPPED | FAILED -> PENDING.
pub fn reset_for_reprocessing(
    conn: &Connection,
    id: &str,
    now: DateTime<Utc>,
) -> Result<TransitionOutcome, DatabaseError> {
    let sql = format!(
        "UPDATE file_records SET processing_status = ?2, updated_at = ?3
         WHERE id = ?1 AND processing_status IN ({})",
        status_list(&[
            ProcessingStatus::Completed,
            ProcessingStatus::Skipped,
            ProcessingStatus::Failed,
        ])
    );
    let changed = conn.execute(
        &sql,
        params![id, ProcessingStatus::Pending, now_string(now)],
    )?;
    resolve_outcome(conn, id, changed, ProcessingStatus::Pending)
}

/// CAN-only side channel, independent of `processing_status`.
/// Returns false when no row matched.
pub fn update_decode_status(
    conn: &Connection,
    id: &str,
    status: DecodeStatus,
    decoded_path: Option<&Path>,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let decoded_path = decoded_path.map(|p| p.display().to_string());
    let changed = conn.execute(
        "UPDATE file_records SET decode_status = ?2, decoded_path = COALESCE(?3, decoded_path),
         updated_at = ?4 WHERE id = ?1",
        params![id, status, decoded_path, now_string(now)],
    )?;
    Ok(changed > 0)
}

/// Lists records in `status` for an organization, optionally for one vehicle.
pub fn find_by_status(
    conn: &Connection,
    organization_id: &str,
    status: ProcessingStatus,
    vehicle_id: Option<&str>,
    limit: u64,
) -> Result<Vec<FileRecord>, DatabaseError> {
    let mut conditions = vec![
        "organization_id = ?1".to_string(),
        "processing_status = ?2".to_string(),
    ];
    let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> =
        vec![Box::new(organization_id.to_string()), Box::new(status)];

    if let Some(vehicle_id) = vehicle_id {
        conditions.push(format!("vehicle_id = ?{}", param_values.len() + 1));
        param_values.push(Box::new(vehicle_id.to_string()));
    }
    param_values.push(Box::new(limit as i64));

    let sql = format!(
        "SELECT {} FROM file_records WHERE {} ORDER BY created_at ASC LIMIT ?{}",
        SELECT_COLUMNS,
        conditions.join(" AND "),
        param_values.len()
    );

    let params_ref: Vec<&dyn rusqlite::types::ToSql> =
        param_values.iter().map(|p| p.as_ref()).collect();
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_ref.as_slice(), record_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// CAN records whose decoded artifact is missing or failed.
pub fn find_needing_decode(
    conn: &Connection,
    organization_id: &str,
    limit: u64,
) -> Result<Vec<FileRecord>, DatabaseError> {
    let sql = format!(
        "SELECT {} FROM file_records
         WHERE organization_id = ?1 AND file_type = ?2 AND decode_status IN (?3, ?4)
         ORDER BY created_at ASC LIMIT ?5",
        SELECT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(
            params![
                organization_id,
                FileType::Can,
                DecodeStatus::NotDecoded,
                DecodeStatus::DecodingFailed,
                limit as i64,
            ],
            record_from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn test_db() -> Database {
        Database::open_in_memory().expect("Failed to create test database")
    }

    fn identity(fingerprint: &str, path: &str) -> FileIdentity {
        let path = PathBuf::from(path);
        FileIdentity {
            name: path.file_name().unwrap().to_string_lossy().to_string(),
            path,
            size_bytes: 42,
            fingerprint: fingerprint.to_string(),
        }
    }

    fn seed(db: &Database, fingerprint: &str) -> FileRecord {
        db.with_conn(|conn| {
            let (record, created) = upsert_seen(
                conn,
                &identity(fingerprint, "/data/org/v1/GPS/GPS_v1_20250101.txt"),
                "org",
                "v1",
                FileType::Gps,
                Utc::now(),
            )?;
            assert!(created);
            Ok(record)
        })
        .unwrap()
    }

    #[test]
    fn test_upsert_creates_pending_record() {
        let db = test_db();
        let record = seed(&db, "fp-1");
        assert_eq!(record.processing_status, ProcessingStatus::Pending);
        assert_eq!(record.decode_status, DecodeStatus::NotDecoded);
        assert_eq!(record.size_bytes, 42);
        assert!(record.processing_errors.is_empty());
        assert!(record.metadata.is_empty());
    }

    #[test]
    fn test_upsert_same_fingerprint_refreshes_path_only() {
        let db = test_db();
        let original = seed(&db, "fp-1");

        db.with_conn(|conn| {
            mark_processing(conn, &original.id, Utc::now())?;
            let (record, created) = upsert_seen(
                conn,
                &identity("fp-1", "/data/org/v1/GPS/renamed.txt"),
                "org",
                "v1",
                FileType::Gps,
                Utc::now(),
            )?;
            assert!(!created);
            assert_eq!(record.id, original.id);
            assert_eq!(record.name, "renamed.txt");
            assert_eq!(record.processing_status, ProcessingStatus::Processing);
            Ok(())
        })
        .unwrap();

        let count: i64 = db
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM file_records", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_full_lifecycle() {
        let db = test_db();
        let record = seed(&db, "fp-1");

        db.with_conn(|conn| {
            assert_eq!(
                mark_processing(conn, &record.id, Utc::now())?,
                TransitionOutcome::Applied
            );
            let mut metadata = serde_json::Map::new();
            metadata.insert("parser".to_string(), serde_json::json!("delimited"));
            assert_eq!(
                mark_completed(conn, &record.id, 120, &metadata, Utc::now())?,
                TransitionOutcome::Applied
            );

            let stored = find_by_id(conn, &record.id)?.unwrap();
            assert_eq!(stored.processing_status, ProcessingStatus::Completed);
            assert_eq!(stored.data_points_count, 120);
            assert_eq!(stored.metadata["parser"], "delimited");
            assert_eq!(stored.attempt_count, 1);
            assert!(stored.last_processed_at.is_some());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_transitions_are_idempotent() {
        let db = test_db();
        let record = seed(&db, "fp-1");

        db.with_conn(|conn| {
            mark_processing(conn, &record.id, Utc::now())?;
            assert_eq!(
                mark_processing(conn, &record.id, Utc::now())?,
                TransitionOutcome::Unchanged
            );
            let errors = vec!["parse failed".to_string()];
            assert_eq!(
                mark_failed(conn, &record.id, &errors, Utc::now())?,
                TransitionOutcome::Applied
            );
            assert_eq!(
                mark_failed(conn, &record.id, &errors, Utc::now())?,
                TransitionOutcome::Unchanged
            );

            let stored = find_by_id(conn, &record.id)?.unwrap();
            assert_eq!(stored.processing_errors, errors);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_processing_never_entered_from_completed() {
        let db = test_db();
        let record = seed(&db, "fp-1");

        db.with_conn(|conn| {
            mark_processing(conn, &record.id, Utc::now())?;
            mark_completed(conn, &record.id, 1, &serde_json::Map::new(), Utc::now())?;
            assert_eq!(
                mark_processing(conn, &record.id, Utc::now())?,
                TransitionOutcome::Rejected {
                    current: ProcessingStatus::Completed
                }
            );

            assert_eq!(
                reset_for_reprocessing(conn, &record.id, Utc::now())?,
                TransitionOutcome::Applied
            );
            assert_eq!(
                mark_processing(conn, &record.id, Utc::now())?,
                TransitionOutcome::Applied
            );
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_failed_can_be_retried() {
        let db = test_db();
        let record = seed(&db, "fp-1");

        db.with_conn(|conn| {
            mark_processing(conn, &record.id, Utc::now())?;
            mark_failed(conn, &record.id, &["boom".to_string()], Utc::now())?;
            assert_eq!(
                mark_processing(conn, &record.id, Utc::now())?,
                TransitionOutcome::Applied
            );
            let stored = find_by_id(conn, &record.id)?.unwrap();
            assert_eq!(stored.attempt_count, 2);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_error_history_is_capped() {
        let db = test_db();
        let record = seed(&db, "fp-1");

        db.with_conn(|conn| {
            for attempt in 0..(MAX_ERROR_HISTORY + 5) {
                mark_processing(conn, &record.id, Utc::now())?;
                mark_failed(conn, &record.id, &[format!("attempt {}", attempt)], Utc::now())?;
            }
            let stored = find_by_id(conn, &record.id)?.unwrap();
            assert_eq!(stored.processing_errors.len(), MAX_ERROR_HISTORY);
            assert_eq!(
                stored.processing_errors.last().map(String::as_str),
                Some(format!("attempt {}", MAX_ERROR_HISTORY + 4).as_str())
            );
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_mark_skipped_records_reason() {
        let db = test_db();
        let record = seed(&db, "fp-1");

        db.with_conn(|conn| {
            assert_eq!(
                mark_skipped(conn, &record.id, "reprocessing of failed files disabled", Utc::now())?,
                TransitionOutcome::Applied
            );
            let stored = find_by_id(conn, &record.id)?.unwrap();
            assert_eq!(stored.processing_status, ProcessingStatus::Skipped);
            assert_eq!(
                stored.metadata["skipReason"],
                "reprocessing of failed files disabled"
            );
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_transition_on_missing_record() {
        let db = test_db();
        db.with_conn(|conn| {
            assert_eq!(
                mark_processing(conn, "nope", Utc::now())?,
                TransitionOutcome::Missing
            );
            assert_eq!(
                mark_failed(conn, "nope", &[], Utc::now())?,
                TransitionOutcome::Missing
            );
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_decode_status_and_queries() {
        let db = test_db();
        db.with_conn(|conn| {
            let (can, _) = upsert_seen(
                conn,
                &identity("fp-can", "/data/org/v1/CAN/CAN_v1_20250101.txt"),
                "org",
                "v1",
                FileType::Can,
                Utc::now(),
            )?;
            let (can_done, _) = upsert_seen(
                conn,
                &identity("fp-can-2", "/data/org/v1/CAN/CAN_v1_20250102.txt"),
                "org",
                "v1",
                FileType::Can,
                Utc::now(),
            )?;
            assert!(update_decode_status(
                conn,
                &can_done.id,
                DecodeStatus::Decoded,
                Some(Path::new("/data/org/v1/CAN/CAN_v1_20250102_decoded.csv")),
                Utc::now(),
            )?);

            let needing = find_needing_decode(conn, "org", 10)?;
            assert_eq!(needing.len(), 1);
            assert_eq!(needing[0].id, can.id);

            let pending = find_by_status(conn, "org", ProcessingStatus::Pending, Some("v1"), 10)?;
            assert_eq!(pending.len(), 2);
            let other_vehicle =
                find_by_status(conn, "org", ProcessingStatus::Pending, Some("v2"), 10)?;
            assert!(other_vehicle.is_empty());
            Ok(())
        })
        .unwrap();
    }
}
