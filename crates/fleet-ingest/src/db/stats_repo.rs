//! Processing statistics repository: aggregate views over `file_records`.

use rusqlite::{params, Connection};
use serde::Serialize;

use super::DatabaseError;
use crate::state::{DecodeStatus, FileType, ProcessingStatus};

/// Count of records in one processing status.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StatusCount {
    pub status: ProcessingStatus,
    pub count: u64,
}

/// Per-file-type aggregate.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileTypeStat {
    pub file_type: FileType,
    pub total_files: u64,
    pub completed: u64,
    pub failed: u64,
    pub data_points: u64,
}

/// Decode side channel counts for CAN records.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DecodeStats {
    pub not_decoded: u64,
    pub decoded: u64,
    pub decoding_failed: u64,
}

/// Organization-wide processing summary.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingStats {
    pub organization_id: String,
    pub total_files: u64,
    pub total_data_points: u64,
    pub by_status: Vec<StatusCount>,
    pub by_file_type: Vec<FileTypeStat>,
    pub decode: DecodeStats,
}

impl ProcessingStats {
    pub fn count_for(&self, status: ProcessingStatus) -> u64 {
        self.by_status
            .iter()
            .find(|s| s.status == status)
            .map(|s| s.count)
            .unwrap_or(0)
    }
}

/// Summarises every record of an organization, optionally narrowed to one vehicle.
pub fn processing_stats(
    conn: &Connection,
    organization_id: &str,
    vehicle_id: Option<&str>,
) -> Result<ProcessingStats, DatabaseError> {
    // `?2 IS NULL` lets one statement serve both the org and vehicle views.
    let scope = "organization_id = ?1 AND (?2 IS NULL OR vehicle_id = ?2)";

    let (total_files, total_data_points): (i64, i64) = conn.query_row(
        &format!(
            "SELECT COUNT(*), COALESCE(SUM(data_points_count), 0) FROM file_records WHERE {}",
            scope
        ),
        params![organization_id, vehicle_id],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;

    let mut stmt = conn.prepare(&format!(
        "SELECT processing_status, COUNT(*) FROM file_records WHERE {}
         GROUP BY processing_status ORDER BY processing_status",
        scope
    ))?;
    let by_status = stmt
        .query_map(params![organization_id, vehicle_id], |row| {
            Ok(StatusCount {
                status: row.get(0)?,
                count: row.get::<_, i64>(1)?.max(0) as u64,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare(&format!(
        "SELECT file_type, COUNT(*),
                SUM(CASE WHEN processing_status = 'COMPLETED' THEN 1 ELSE 0 END),
                SUM(CASE WHEN processing_status = 'FAILED' THEN 1 ELSE 0 END),
                COALESCE(SUM(data_points_count), 0)
         FROM file_records WHERE {}
         GROUP BY file_type ORDER BY file_type",
        scope
    ))?;
    let by_file_type = stmt
        .query_map(params![organization_id, vehicle_id], |row| {
            Ok(FileTypeStat {
                file_type: row.get(0)?,
                total_files: row.get::<_, i64>(1)?.max(0) as u64,
                completed: row.get::<_, i64>(2)?.max(0) as u64,
                failed: row.get::<_, i64>(3)?.max(0) as u64,
                data_points: row.get::<_, i64>(4)?.max(0) as u64,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut decode = DecodeStats::default();
    let mut stmt = conn.prepare(&format!(
        "SELECT decode_status, COUNT(*) FROM file_records
         WHERE {} AND file_type = 'CAN' GROUP BY decode_status",
        scope
    ))?;
    let rows = stmt.query_map(params![organization_id, vehicle_id], |row| {
        Ok((row.get::<_, DecodeStatus>(0)?, row.get::<_, i64>(1)?))
    })?;
    for row in rows {
        let (status, count) = row?;
        let count = count.max(0) as u64;
        match status {
            DecodeStatus::NotDecoded => decode.not_decoded = count,
            DecodeStatus::Decoded => decode.decoded = count,
            DecodeStatus::DecodingFailed => decode.decoding_failed = count,
        }
    }

    Ok(ProcessingStats {
        organization_id: organization_id.to_string(),
        total_files: total_files.max(0) as u64,
        total_data_points: total_data_points.max(0) as u64,
        by_status,
        by_file_type,
        decode,
    })
}
