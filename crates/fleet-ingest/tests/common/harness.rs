//! Test harness for isolated pipeline runs.
//!
//! Each `TestHarness` owns a temporary `{base}/{organization}/{vehicle}/{TYPE}`
//! tree, an in-memory database and a fake CAN decoder, wired together through
//! `IngestService` exactly as production code does.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use fleet_ingest::config::DatabaseConfig;
use fleet_ingest::streaming::ParserRegistry;
use fleet_ingest::{
    Database, DecoderBackend, FileRecord, FileType, InMemoryMetrics, IngestConfig, IngestService,
    OrganizationRequest, OrganizationResult, ProcessOptions, VehicleRequest, VehicleResult,
};

use super::builders::{DecoderScript, FakeDecoder, TelemetryFileBuilder};

pub const ORG: &str = "org-1";
pub const VEHICLE: &str = "veh-1";

pub struct TestHarness {
    temp_dir: TempDir,
    pub base: PathBuf,
    pub service: IngestService,
    pub decoder: Arc<FakeDecoder>,
    pub metrics: Arc<InMemoryMetrics>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_parsers(ParserRegistry::new())
    }

    pub fn with_parsers(parsers: ParserRegistry) -> Self {
        Self::build(parsers, fast_config())
    }

    pub fn build(parsers: ParserRegistry, config: IngestConfig) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let base = temp_dir.path().join("telemetry");
        std::fs::create_dir_all(&base).expect("Failed to create base dir");

        let mut config = config;
        config.storage.base_path = base.to_string_lossy().into_owned();

        let decoder = Arc::new(FakeDecoder::new(DecoderScript::Rows(4)));
        let metrics = Arc::new(InMemoryMetrics::new());
        let backend: Arc<dyn DecoderBackend> = decoder.clone();
        let db = Database::open_in_memory().expect("Failed to open database");
        let service =
            IngestService::with_database(&config, db, metrics.clone(), parsers, Some(backend))
                .expect("Failed to build service");

        Self {
            temp_dir,
            base,
            service,
            decoder,
            metrics,
        }
    }

    pub fn type_dir(&self, vehicle: &str, file_type: FileType) -> PathBuf {
        let dir = self
            .base
            .join(ORG)
            .join(vehicle)
            .join(file_type.directory_name());
        std::fs::create_dir_all(&dir).expect("Failed to create type dir");
        dir
    }

    /// Writes a telemetry file for [`VEHICLE`].
    pub fn write(&self, builder: TelemetryFileBuilder, file_type: FileType) -> PathBuf {
        self.write_for(VEHICLE, builder, file_type)
    }

    pub fn write_for(
        &self,
        vehicle: &str,
        builder: TelemetryFileBuilder,
        file_type: FileType,
    ) -> PathBuf {
        let path = self.type_dir(vehicle, file_type).join(builder.file_name());
        std::fs::write(&path, builder.content()).expect("Failed to write telemetry file");
        path
    }

    pub fn request(&self, options: ProcessOptions) -> VehicleRequest {
        self.service.vehicle_request(ORG, VEHICLE, None, options)
    }

    pub async fn run(&self) -> VehicleResult {
        self.run_with(ProcessOptions::default()).await
    }

    pub async fn run_with(&self, options: ProcessOptions) -> VehicleResult {
        let request = self.request(options);
        self.service
            .process_vehicle(&request, &CancellationToken::new())
            .await
    }

    pub async fn run_organization(&self) -> OrganizationResult {
        let request = OrganizationRequest::new(ORG, &self.base);
        self.service
            .process_organization(&request, &CancellationToken::new())
            .await
    }

    /// The stored record for the file currently at `path`.
    pub async fn record_for(&self, path: &Path) -> Option<FileRecord> {
        let identity = fleet_ingest::state::identify(path)
            .await
            .expect("Failed to fingerprint");
        self.service
            .store()
            .find_by_fingerprint(ORG, &identity.fingerprint)
            .await
            .expect("Failed to query record")
    }

    pub async fn active_locks(&self) -> u64 {
        self.service
            .locks()
            .active_count()
            .await
            .expect("Failed to count locks")
    }

    /// Moves the start of a record's current attempt `age` into the past, as
    /// if the run that claimed it had died.
    pub fn backdate_processing(&self, record_id: &str, age: chrono::Duration) {
        let started = (chrono::Utc::now() - age).to_rfc3339();
        self.service
            .store()
            .database()
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE file_records SET processing_started_at = ?1, updated_at = ?1
                     WHERE id = ?2",
                    rusqlite::params![started, record_id],
                )?;
                Ok(())
            })
            .expect("Failed to backdate record");
    }

    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }
}

/// Defaults with retry backoff shrunk so failing files finish quickly.
pub fn fast_config() -> IngestConfig {
    let mut config = IngestConfig {
        database: DatabaseConfig {
            path: ":memory:".to_string(),
        },
        ..Default::default()
    };
    config.resilience.retry.base_delay_ms = 5;
    config.resilience.retry.max_delay_ms = 20;
    config.resilience.retry.timeout_max_delay_ms = 20;
    config
}
