//! Data point repository: persisted parse output per file record.

use rusqlite::{params, Connection};

use super::DatabaseError;
use crate::state::FileRecord;
use crate::streaming::DataPoint;

/// Replaces every data point of `record` with `points`.
///
/// Meant to run inside the caller's transaction so a retried attempt never
/// leaves duplicates behind.
pub fn replace_for_file(
    conn: &Connection,
    record: &FileRecord,
    points: &[DataPoint],
) -> Result<u64, DatabaseError> {
    conn.execute(
        "DELETE FROM data_points WHERE file_record_id = ?1",
        params![record.id],
    )?;

    let mut stmt = conn.prepare_cached(
        "INSERT INTO data_points (file_record_id, organization_id, vehicle_id, file_type,
         line_number, recorded_at, payload) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )?;

    let mut inserted = 0u64;
    for point in points {
        let payload = serde_json::to_string(&point.fields).map_err(|e| DatabaseError::Json {
            column: "payload",
            source: e,
        })?;
        stmt.execute(params![
            record.id,
            record.organization_id,
            record.vehicle_id,
            record.file_type,
            point.line_number as i64,
            point.recorded_at,
            payload,
        ])?;
        inserted += 1;
    }

    Ok(inserted)
}

/// Number of stored data points for a record.
pub fn count_for_file(conn: &Connection, file_record_id: &str) -> Result<u64, DatabaseError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM data_points WHERE file_record_id = ?1",
        params![file_record_id],
        |r| r.get(0),
    )?;
    Ok(count.max(0) as u64)
}

/// Loads the stored points of a record in line order.
pub fn list_for_file(
    conn: &Connection,
    file_record_id: &str,
    limit: u64,
) -> Result<Vec<DataPoint>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT line_number, recorded_at, payload FROM data_points
         WHERE file_record_id = ?1 ORDER BY line_number ASC LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(params![file_record_id, limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(line_number, recorded_at, payload)| {
            let fields = serde_json::from_str(&payload).map_err(|e| DatabaseError::Json {
                column: "payload",
                source: e,
            })?;
            Ok(DataPoint {
                line_number: line_number.max(0) as u64,
                recorded_at,
                fields,
            })
        })
        .collect()
}
