use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::db::DatabaseError;
use crate::state::ProcessingStatus;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Invalid environment override '{key}': {reason}")]
    InvalidOverride { key: String, reason: String },

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },
}

/// Top-level error for every ingestion operation.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("File operation failed for '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Validation failed for '{path}': {reason}")]
    Validation { path: PathBuf, reason: String },

    #[error("Decoding failed for '{path}': {reason}")]
    Decoding {
        path: PathBuf,
        reason: String,
        /// Whether another attempt may succeed (non-zero exit, empty output).
        transient: bool,
    },

    #[error("Resource '{resource}' is already being processed by '{holder}'")]
    LockContention { resource: String, holder: String },

    #[error("Lock '{lock_id}' is no longer active")]
    LockExpired { lock_id: String },

    #[error("Invalid state transition for record '{record_id}': {from} -> {to}")]
    InvalidTransition {
        record_id: String,
        from: ProcessingStatus,
        to: ProcessingStatus,
    },

    #[error("{operation} timed out after {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Processing failed: {0}")]
    Processing(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Record not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, IngestError>;

/// Error taxonomy used in results and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    FileSystem,
    Store,
    Network,
    Validation,
    Decoding,
    Concurrency,
    Timeout,
    Processing,
    Configuration,
    Cancelled,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::FileSystem => "FILE_SYSTEM",
            ErrorCategory::Store => "STORE",
            ErrorCategory::Network => "NETWORK",
            ErrorCategory::Validation => "VALIDATION",
            ErrorCategory::Decoding => "DECODING",
            ErrorCategory::Concurrency => "CONCURRENCY",
            ErrorCategory::Timeout => "TIMEOUT",
            ErrorCategory::Processing => "PROCESSING",
            ErrorCategory::Configuration => "CONFIGURATION",
            ErrorCategory::Cancelled => "CANCELLED",
        }
    }
}

/// Severity only selects the log level and whether the error is reported as
/// critical. It never influences retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl IngestError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        IngestError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn validation(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        IngestError::Validation {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            IngestError::Config(_) => ErrorCategory::Configuration,
            IngestError::Database(DatabaseError::Cancelled) => ErrorCategory::Cancelled,
            IngestError::Database(_) | IngestError::NotFound(_) => ErrorCategory::Store,
            IngestError::InvalidTransition { .. } => ErrorCategory::Store,
            IngestError::Io { .. } => ErrorCategory::FileSystem,
            IngestError::Validation { .. } => ErrorCategory::Validation,
            IngestError::Decoding { .. } => ErrorCategory::Decoding,
            IngestError::LockContention { .. } | IngestError::LockExpired { .. } => {
                ErrorCategory::Concurrency
            }
            IngestError::Timeout { .. } => ErrorCategory::Timeout,
            IngestError::Network(_) => ErrorCategory::Network,
            IngestError::Processing(_) => ErrorCategory::Processing,
            IngestError::Cancelled(_) => ErrorCategory::Cancelled,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            IngestError::Config(_) => Severity::Critical,
            IngestError::Database(DatabaseError::LockPoisoned) => Severity::Critical,
            IngestError::Database(DatabaseError::Migration { .. }) => Severity::Critical,
            IngestError::Database(DatabaseError::Cancelled) => Severity::Low,
            IngestError::Database(_) | IngestError::InvalidTransition { .. } => Severity::High,
            IngestError::Validation { .. }
            | IngestError::LockContention { .. }
            | IngestError::Cancelled(_) => Severity::Low,
            IngestError::Io { .. }
            | IngestError::Decoding { .. }
            | IngestError::LockExpired { .. }
            | IngestError::Timeout { .. }
            | IngestError::Network(_)
            | IngestError::Processing(_)
            | IngestError::NotFound(_) => Severity::Medium,
        }
    }

    /// Default retry classifier: transient store, network and decoder
    /// failures, lock contention and timeouts.
    pub fn is_retryable(&self) -> bool {
        match self {
            IngestError::Database(e) => e.is_transient(),
            IngestError::Io { source, .. } => matches!(
                source.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
            ),
            IngestError::Decoding { transient, .. } => *transient,
            IngestError::LockContention { .. }
            | IngestError::Timeout { .. }
            | IngestError::Network(_) => true,
            _ => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, IngestError::Timeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            IngestError::Cancelled(_) | IngestError::Database(DatabaseError::Cancelled)
        )
    }

    /// Emits this error through `log` at the level its severity calls for.
    pub fn log(&self, context: &str) {
        match self.severity() {
            Severity::Low => log::debug!("{}: {} [{}]", context, self, self.category().as_str()),
            Severity::Medium => log::warn!("{}: {} [{}]", context, self, self.category().as_str()),
            Severity::High | Severity::Critical => {
                log::error!("{}: {} [{}]", context, self, self.category().as_str())
            }
        }
    }
}
