//! Composition root: builds every component once and hands them to the
//! pipeline by `Arc`.

use std::path::Path;
use std::sync::Arc;

use chrono::NaiveDate;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::IngestConfig;
use crate::db::{lock_repo, stats_repo::ProcessingStats, Database};
use crate::decoder::{CanDecoder, DecoderBackend};
use crate::error::Result;
use crate::locks::LockManager;
use crate::metrics::{HealthStatus, MetricsSink};
use crate::pipeline::{
    Components, IngestPipeline, OrganizationRequest, OrganizationResult, ProcessOptions,
    VehicleRequest, VehicleResult,
};
use crate::resilience::ResilienceController;
use crate::state::{FileRecord, FileStateStore};
use crate::streaming::{ParserRegistry, StreamingProcessor};

pub struct IngestService {
    config: IngestConfig,
    db: Database,
    store: Arc<FileStateStore>,
    locks: Arc<LockManager>,
    metrics: Arc<dyn MetricsSink>,
    pipeline: IngestPipeline,
}

impl IngestService {
    /// Opens the database (running migrations) and wires the pipeline. With
    /// no `backend`, CAN files are decoded by the configured subprocess.
    pub fn open(
        config: &IngestConfig,
        metrics: Arc<dyn MetricsSink>,
        backend: Option<Arc<dyn DecoderBackend>>,
    ) -> Result<Self> {
        let db = if config.database.is_in_memory() {
            Database::open_in_memory()?
        } else {
            Database::open(Path::new(&config.database.path))?
        };
        Self::with_database(config, db, metrics, ParserRegistry::new(), backend)
    }

    /// Wires the pipeline over an already opened database and a caller-built
    /// parser registry.
    pub fn with_database(
        config: &IngestConfig,
        db: Database,
        metrics: Arc<dyn MetricsSink>,
        parsers: ParserRegistry,
        backend: Option<Arc<dyn DecoderBackend>>,
    ) -> Result<Self> {
        let store = Arc::new(FileStateStore::new(
            db.clone(),
            config.locks.stale_processing_after(),
        ));
        let locks = Arc::new(LockManager::new(db.clone(), config.locks.ttl()));
        let resilience = Arc::new(ResilienceController::new(
            db.clone(),
            config.resilience.clone(),
        ));
        let streaming = Arc::new(StreamingProcessor::new(config.streaming.clone()));
        let decoder = Arc::new(match backend {
            Some(backend) => CanDecoder::new(config.decoder.clone(), backend),
            None => CanDecoder::from_config(config.decoder.clone()),
        });

        let pipeline = IngestPipeline::new(
            config.pipeline.clone(),
            Components {
                store: Arc::clone(&store),
                locks: Arc::clone(&locks),
                resilience,
                streaming,
                decoder: Arc::clone(&decoder),
                parsers: Arc::new(parsers),
                metrics: Arc::clone(&metrics),
            },
        );

        log::info!(
            "Ingest service ready (database: {}, base path: {}, decoder: {})",
            config.database.path,
            config.storage.base_path,
            decoder.backend_name()
        );

        Ok(Self {
            config: config.clone(),
            db,
            store,
            locks,
            metrics,
            pipeline,
        })
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn pipeline(&self) -> &IngestPipeline {
        &self.pipeline
    }

    pub fn store(&self) -> &FileStateStore {
        &self.store
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// A request rooted at the configured storage base path.
    pub fn vehicle_request(
        &self,
        organization_id: &str,
        vehicle_id: &str,
        date: Option<NaiveDate>,
        options: ProcessOptions,
    ) -> VehicleRequest {
        let mut request = VehicleRequest::new(
            organization_id,
            vehicle_id,
            self.config.storage.base_path(),
        )
        .with_options(options);
        if let Some(date) = date {
            request = request.with_date(date);
        }
        request
    }

    pub async fn process_vehicle(
        &self,
        request: &VehicleRequest,
        cancel: &CancellationToken,
    ) -> VehicleResult {
        self.pipeline.process_vehicle(request, cancel).await
    }

    pub async fn process_organization(
        &self,
        request: &OrganizationRequest,
        cancel: &CancellationToken,
    ) -> OrganizationResult {
        self.pipeline.process_organization(request, cancel).await
    }

    pub async fn pending_files(
        &self,
        organization_id: &str,
        vehicle_id: Option<&str>,
        limit: u64,
    ) -> Result<Vec<FileRecord>> {
        self.store
            .pending_files(organization_id, vehicle_id, limit)
            .await
    }

    pub async fn files_needing_decode(
        &self,
        organization_id: &str,
        limit: u64,
    ) -> Result<Vec<FileRecord>> {
        self.store.files_needing_decode(organization_id, limit).await
    }

    pub async fn processing_stats(
        &self,
        organization_id: &str,
        vehicle_id: Option<&str>,
    ) -> Result<ProcessingStats> {
        self.store
            .processing_stats(organization_id, vehicle_id)
            .await
    }

    /// Registers `state_store` and `lock_manager` probes with the sink.
    pub fn register_health_checks(&self) {
        let db = self.db.clone();
        self.metrics.register_health_check(
            "state_store",
            Arc::new(move || match db.ping() {
                Ok(()) => HealthStatus::healthy("database reachable"),
                Err(e) => HealthStatus::unhealthy(e.to_string()),
            }),
        );

        let db = self.db.clone();
        self.metrics.register_health_check(
            "lock_manager",
            Arc::new(move || match db.with_conn(lock_repo::count_active) {
                Ok(n) => HealthStatus::healthy(format!("{} active lock(s)", n)),
                Err(e) => HealthStatus::unhealthy(e.to_string()),
            }),
        );
    }

    /// Starts the periodic expired-lock sweep; stops when `shutdown` fires.
    pub fn spawn_lock_sweeper(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        self.locks
            .spawn_sweeper(self.config.locks.sweep_interval(), shutdown)
    }
}
