//! File record model and its enum columns.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
#[error("Unknown {kind} value '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// Telemetry file family. Selects parser, validation rules and directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileType {
    Can,
    Stability,
    Gps,
    Rotativo,
}

text_enum!(FileType, "file type", {
    Can => "CAN",
    Stability => "STABILITY",
    Gps => "GPS",
    Rotativo => "ROTATIVO",
});

impl FileType {
    pub const ALL: [FileType; 4] = [
        FileType::Can,
        FileType::Stability,
        FileType::Gps,
        FileType::Rotativo,
    ];

    /// Sub-directory of a vehicle directory holding this type's files.
    pub fn directory_name(&self) -> &'static str {
        self.as_str()
    }

    /// Prefix every file of this type starts with (`GPS_...`).
    pub fn file_prefix(&self) -> &'static str {
        self.as_str()
    }

    /// CAN frames must go through the external decoder before parsing.
    pub fn requires_decoding(&self) -> bool {
        matches!(self, FileType::Can)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Skipped,
}

text_enum!(ProcessingStatus, "processing status", {
    Pending => "PENDING",
    Processing => "PROCESSING",
    Completed => "COMPLETED",
    Failed => "FAILED",
    Skipped => "SKIPPED",
});

impl ProcessingStatus {
    /// Terminal for the current content unless an operator forces a rerun.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessingStatus::Completed | ProcessingStatus::Skipped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecodeStatus {
    NotDecoded,
    Decoded,
    DecodingFailed,
}

text_enum!(DecodeStatus, "decode status", {
    NotDecoded => "NOT_DECODED",
    Decoded => "DECODED",
    DecodingFailed => "DECODING_FAILED",
});

/// One row per distinct file content seen for an organization.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub id: String,
    pub organization_id: String,
    pub fingerprint: String,
    pub path: PathBuf,
    pub name: String,
    pub size_bytes: u64,
    pub vehicle_id: String,
    pub file_type: FileType,
    pub processing_status: ProcessingStatus,
    pub decode_status: DecodeStatus,
    pub decoded_path: Option<PathBuf>,
    pub data_points_count: u64,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub processing_errors: Vec<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub attempt_count: u32,
    /// Set when the current attempt entered PROCESSING.
    pub processing_started_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_type_round_trips_through_text() {
        for file_type in FileType::ALL {
            let parsed: FileType = file_type.as_str().parse().unwrap();
            assert_eq!(parsed, file_type);
        }
        assert!("IMU".parse::<FileType>().is_err());
    }

    #[test]
    fn test_only_can_requires_decoding() {
        assert!(FileType::Can.requires_decoding());
        assert!(!FileType::Gps.requires_decoding());
        assert!(!FileType::Stability.requires_decoding());
        assert!(!FileType::Rotativo.requires_decoding());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(ProcessingStatus::Completed.is_terminal());
        assert!(ProcessingStatus::Skipped.is_terminal());
        assert!(!ProcessingStatus::Failed.is_terminal());
        assert!(!ProcessingStatus::Processing.is_terminal());
    }

    #[test]
    fn test_status_display_matches_column_text() {
        assert_eq!(ProcessingStatus::Processing.to_string(), "PROCESSING");
        assert_eq!(DecodeStatus::DecodingFailed.to_string(), "DECODING_FAILED");
    }
}
