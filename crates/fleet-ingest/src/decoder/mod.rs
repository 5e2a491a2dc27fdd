//! External CAN decoding.
//!
//! Raw CAN logs are turned into a sibling CSV artifact (`CAN_x.txt` becomes
//! `CAN_x_decoded.csv`) by an out-of-process decoder. An existing non-empty
//! artifact is always reused, which makes decoding idempotent across runs.

mod adapter;
pub mod backend;
pub mod validation;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use adapter::CanDecoder;
pub use backend::{BackendOutput, DecoderBackend, SubprocessDecoder};
pub use validation::{validate_can_file, validate_telemetry_file, ValidationReport, ValidationRules};

use crate::error::{IngestError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DecoderConfig {
    pub program: String,
    /// Arguments placed before the source path.
    pub args: Vec<String>,
    pub timeout_ms: u64,
    /// Extra time the watchdog allows after the timeout before giving up on
    /// the process.
    pub kill_grace_ms: u64,
    pub decoded_suffix: String,
    pub output_cap_bytes: usize,
    pub validation: ValidationRules,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            program: "can-decoder".to_string(),
            args: Vec::new(),
            timeout_ms: 300_000,
            kill_grace_ms: 5_000,
            decoded_suffix: "_decoded.csv".to_string(),
            output_cap_bytes: 64 * 1024,
            validation: ValidationRules::default(),
        }
    }
}

impl DecoderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecodeOutcome {
    pub success: bool,
    pub decoded_path: Option<PathBuf>,
    pub error: Option<String>,
    /// Rows in the decoded artifact.
    pub message_count: Option<u64>,
    /// The artifact already existed and the backend was not invoked.
    pub reused_artifact: bool,
    /// Whether a later attempt may succeed.
    pub transient: bool,
}

impl DecodeOutcome {
    fn decoded(path: PathBuf, rows: u64) -> Self {
        Self {
            success: true,
            decoded_path: Some(path),
            error: None,
            message_count: Some(rows),
            reused_artifact: false,
            transient: false,
        }
    }

    fn reused(path: PathBuf, rows: u64) -> Self {
        Self {
            reused_artifact: true,
            ..Self::decoded(path, rows)
        }
    }

    fn failed(error: String, transient: bool) -> Self {
        Self {
            success: false,
            decoded_path: None,
            error: Some(error),
            message_count: None,
            reused_artifact: false,
            transient,
        }
    }

    /// The artifact path on success, a `Decoding` error otherwise.
    pub fn into_result(self, source: &Path) -> Result<PathBuf> {
        match (self.success, self.decoded_path) {
            (true, Some(path)) => Ok(path),
            _ => Err(IngestError::Decoding {
                path: source.to_path_buf(),
                reason: self.error.unwrap_or_else(|| "decoder failed".to_string()),
                transient: self.transient,
            }),
        }
    }
}
