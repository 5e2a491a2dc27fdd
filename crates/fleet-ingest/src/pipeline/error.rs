use std::path::Path;

use serde::Serialize;

use crate::error::{ErrorCategory, IngestError, Severity};
use crate::state::FileType;

/// Step of the per-file flow an error surfaced in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Scan,
    Decide,
    Register,
    AcquireLock,
    Transition,
    Validate,
    Process,
    Release,
    Run,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Scan => "scan",
            Stage::Decide => "decide",
            Stage::Register => "register",
            Stage::AcquireLock => "acquire_lock",
            Stage::Transition => "transition",
            Stage::Validate => "validate",
            Stage::Process => "process",
            Stage::Release => "release",
            Stage::Run => "run",
        }
    }
}

/// One failure reported in a run result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileError {
    /// File name, or empty for run-level failures.
    pub file: String,
    pub file_type: Option<FileType>,
    pub operation: String,
    pub category: ErrorCategory,
    pub severity: Severity,
    pub message: String,
}

impl FileError {
    pub fn new(path: &Path, file_type: FileType, stage: Stage, error: &IngestError) -> Self {
        Self {
            file: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
            file_type: Some(file_type),
            operation: stage.as_str().to_string(),
            category: error.category(),
            severity: error.severity(),
            message: error.to_string(),
        }
    }

    /// A failure not tied to one file.
    pub fn run_level(stage: Stage, error: &IngestError) -> Self {
        Self {
            file: String::new(),
            file_type: None,
            operation: stage.as_str().to_string(),
            category: error.category(),
            severity: error.severity(),
            message: error.to_string(),
        }
    }

    /// A panic caught at a file or run boundary.
    pub fn panicked(file: String, file_type: Option<FileType>, message: String) -> Self {
        Self {
            file,
            file_type,
            operation: Stage::Run.as_str().to_string(),
            category: ErrorCategory::Processing,
            severity: Severity::Critical,
            message: format!("panic: {}", message),
        }
    }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
