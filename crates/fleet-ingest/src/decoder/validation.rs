//! Pre-flight checks on raw telemetry files.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};

use crate::error::{IngestError, Result};

/// Bytes read from the head of a file when sampling lines.
const SAMPLE_BYTES: u64 = 256 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ValidationRules {
    /// Size ceiling for raw CAN logs. Other types are streamed at any size.
    pub max_file_bytes: u64,
    /// Non-empty lines inspected by the content heuristic.
    pub sample_lines: usize,
}

impl Default for ValidationRules {
    fn default() -> Self {
        Self {
            max_file_bytes: 100 * 1024 * 1024,
            sample_lines: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub valid: bool,
    pub error: Option<String>,
    pub sampled_lines: usize,
    pub matching_lines: usize,
}

impl ValidationReport {
    fn invalid(error: impl Into<String>) -> Self {
        Self {
            valid: false,
            error: Some(error.into()),
            sampled_lines: 0,
            matching_lines: 0,
        }
    }

    /// Converts a failed report into a `Validation` error for `path`.
    pub fn into_result(self, path: &Path) -> Result<Self> {
        if self.valid {
            Ok(self)
        } else {
            let reason = self.error.unwrap_or_else(|| "invalid file".to_string());
            Err(IngestError::validation(path, reason))
        }
    }
}

/// Existence, size and content-shape checks for a raw CAN log.
pub async fn validate_can_file(path: &Path, rules: &ValidationRules) -> Result<ValidationReport> {
    let basic = validate_telemetry_file(path).await?;
    if !basic.valid {
        return Ok(basic);
    }
    let len = tokio::fs::metadata(path)
        .await
        .map_err(|e| IngestError::io(path, e))?
        .len();
    if len > rules.max_file_bytes {
        return Ok(ValidationReport::invalid(format!(
            "file is {} bytes, limit is {}",
            len, rules.max_file_bytes
        )));
    }

    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| IngestError::io(path, e))?;
    let mut lines = BufReader::new(file.take(SAMPLE_BYTES)).lines();

    let mut sampled = 0usize;
    let mut matching = 0usize;
    while sampled < rules.sample_lines {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            // Binary garbage, treat the rest of the sample as non-matching.
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                sampled += 1;
                break;
            }
            Err(e) => return Err(IngestError::io(path, e)),
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        sampled += 1;
        if looks_like_frame(line) {
            matching += 1;
        }
    }

    if sampled == 0 {
        return Ok(ValidationReport::invalid("no non-empty lines in sample"));
    }
    let valid = matching * 2 >= sampled;
    Ok(ValidationReport {
        valid,
        error: (!valid).then(|| {
            format!(
                "only {} of {} sampled lines look like CAN frames",
                matching, sampled
            )
        }),
        sampled_lines: sampled,
        matching_lines: matching,
    })
}

/// Existence and emptiness checks shared by every file type.
pub async fn validate_telemetry_file(path: &Path) -> Result<ValidationReport> {
    let meta = match tokio::fs::metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(ValidationReport::invalid("file does not exist"));
        }
        Err(e) => return Err(IngestError::io(path, e)),
    };
    if !meta.is_file() {
        return Ok(ValidationReport::invalid("not a regular file"));
    }
    if meta.len() == 0 {
        return Ok(ValidationReport::invalid("file is empty"));
    }
    Ok(ValidationReport {
        valid: true,
        error: None,
        sampled_lines: 0,
        matching_lines: 0,
    })
}

/// A delimiter plus at least one numeric token.
fn looks_like_frame(line: &str) -> bool {
    let delimiters: &[char] = &[';', ',', '\t', ' '];
    if !line.contains(delimiters) {
        return false;
    }
    line.split(delimiters)
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .any(is_numeric_token)
}

fn is_numeric_token(token: &str) -> bool {
    if let Some(hex) = token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
    {
        return !hex.is_empty() && hex.chars().all(|c| c.is_ascii_hexdigit());
    }
    token.parse::<f64>().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, content: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[tokio::test]
    async fn test_frames_pass() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "CAN_1.txt",
            b"0.001 1 18FEF100x Rx d 8 01 02 03\n0.002 1 0CF00400x Rx d 8 ff 00\n",
        );
        let report = validate_can_file(&path, &ValidationRules::default())
            .await
            .unwrap();
        assert!(report.valid);
        assert_eq!(report.sampled_lines, 2);
        assert_eq!(report.matching_lines, 2);
    }

    #[tokio::test]
    async fn test_prose_fails_heuristic() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "CAN_1.txt",
            b"hello there\nthis is not a log\nneither is this\n0.1;2\n",
        );
        let report = validate_can_file(&path, &ValidationRules::default())
            .await
            .unwrap();
        assert!(!report.valid);
        assert!(report.error.unwrap().contains("1 of 4"));
    }

    #[tokio::test]
    async fn test_missing_empty_and_oversized() {
        let dir = TempDir::new().unwrap();
        let rules = ValidationRules {
            max_file_bytes: 8,
            sample_lines: 5,
        };

        let missing = validate_can_file(&dir.path().join("nope.txt"), &rules)
            .await
            .unwrap();
        assert_eq!(missing.error.as_deref(), Some("file does not exist"));

        let empty = write(&dir, "empty.txt", b"");
        let report = validate_telemetry_file(&empty).await.unwrap();
        assert_eq!(report.error.as_deref(), Some("file is empty"));

        let big = write(&dir, "big.txt", b"0.1;2;3;4;5\n");
        let report = validate_can_file(&big, &rules).await.unwrap();
        assert!(!report.valid);
        assert!(report.error.unwrap().contains("limit is 8"));
    }

    #[tokio::test]
    async fn test_size_ceiling_applies_only_to_can() {
        let dir = TempDir::new().unwrap();
        let rules = ValidationRules::default();
        let path = dir.path().join("GPS_20250314_001.txt");
        let file = std::fs::File::create(&path).unwrap();
        file.set_len(150 * 1024 * 1024).unwrap();

        let report = validate_telemetry_file(&path).await.unwrap();
        assert!(report.valid, "{:?}", report.error);

        let can = dir.path().join("CAN_20250314_001.txt");
        std::fs::File::create(&can)
            .unwrap()
            .set_len(rules.max_file_bytes + 1)
            .unwrap();
        let report = validate_can_file(&can, &rules).await.unwrap();
        assert!(!report.valid);
        assert!(report.error.unwrap().contains("limit is"));
    }

    #[tokio::test]
    async fn test_into_result_maps_to_validation_error() {
        let dir = TempDir::new().unwrap();
        let empty = write(&dir, "empty.txt", b"");
        let err = validate_telemetry_file(&empty)
            .await
            .unwrap()
            .into_result(&empty)
            .unwrap_err();
        assert!(matches!(err, IngestError::Validation { .. }));
    }

    #[test]
    fn test_numeric_tokens() {
        assert!(is_numeric_token("12.5"));
        assert!(is_numeric_token("0x1F"));
        assert!(!is_numeric_token("0x"));
        assert!(!is_numeric_token("Rx"));
        assert!(looks_like_frame("a;1"));
        assert!(!looks_like_frame("12345"));
    }
}
