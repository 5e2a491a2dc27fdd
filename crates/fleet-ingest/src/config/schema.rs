use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::decoder::DecoderConfig;
use crate::pipeline::PipelineConfig;
use crate::resilience::ResilienceConfig;
use crate::streaming::StreamingConfig;

/// Complete service configuration. Every field has a default, so `{}` is a
/// valid config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IngestConfig {
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub streaming: StreamingConfig,
    pub resilience: ResilienceConfig,
    pub locks: LockConfig,
    pub decoder: DecoderConfig,
    pub pipeline: PipelineConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DatabaseConfig {
    /// SQLite file, or `:memory:`.
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "fleet-ingest.db".to_string(),
        }
    }
}

impl DatabaseConfig {
    pub fn is_in_memory(&self) -> bool {
        self.path == ":memory:"
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StorageConfig {
    /// Root of the `{organization}/{vehicle}/{TYPE}` tree.
    pub base_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_path: "./data".to_string(),
        }
    }
}

impl StorageConfig {
    pub fn base_path(&self) -> PathBuf {
        PathBuf::from(&self.base_path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LockConfig {
    pub ttl_ms: u64,
    pub sweep_interval_ms: u64,
    /// A PROCESSING record untouched for this long is taken over.
    pub stale_processing_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 30 * 60 * 1000,
            sweep_interval_ms: 60 * 1000,
            stale_processing_ms: 30 * 60 * 1000,
        }
    }
}

impl LockConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn stale_processing_after(&self) -> Duration {
        Duration::from_millis(self.stale_processing_ms)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    /// Full `EnvFilter` directive; overrides `level` when set.
    pub filter: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            filter: None,
        }
    }
}
