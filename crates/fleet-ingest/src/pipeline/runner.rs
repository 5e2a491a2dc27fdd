use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures_util::future::join_all;
use futures_util::stream::{self, StreamExt};
use futures_util::FutureExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info_span, Instrument};

use crate::db::{data_point_repo, file_repo};
use crate::decoder::{validate_telemetry_file, CanDecoder};
use crate::error::{IngestError, Result};
use crate::locks::{file_resource_id, vehicle_resource_id, LockGrant, LockManager, ResourceType};
use crate::metrics::{self, labels, MetricKind, MetricsSink};
use crate::resilience::{OperationClass, ResilienceController};
use crate::state::{
    check_transition, DecisionReason, DecodeStatus, FileRecord, FileStateStore, FileType,
    ProcessingStatus,
};
use crate::streaming::{DataPoint, ParserRegistry, StreamingOutcome, StreamingProcessor};

use super::config::PipelineConfig;
use super::context::{FileContext, LockLedger, OrganizationRequest, VehicleRequest};
use super::error::{panic_message, FileError, Stage};
use super::result::{FileOutcome, FileReport, OrganizationResult, VehicleResult};
use super::scanner::{ScannedFile, VehicleScanner};

/// Line errors copied into a completed record's metadata.
const LINE_ERROR_SAMPLES: usize = 10;

/// Shared services the pipeline drives.
#[derive(Clone)]
pub struct Components {
    pub store: Arc<FileStateStore>,
    pub locks: Arc<LockManager>,
    pub resilience: Arc<ResilienceController>,
    pub streaming: Arc<StreamingProcessor>,
    pub decoder: Arc<CanDecoder>,
    pub parsers: Arc<ParserRegistry>,
    pub metrics: Arc<dyn MetricsSink>,
}

/// Parsed output of one attempt, waiting to be committed.
struct Staged {
    points: Vec<DataPoint>,
    outcome: StreamingOutcome,
    decoded_path: Option<PathBuf>,
}

pub struct IngestPipeline {
    config: PipelineConfig,
    parts: Components,
}

impl IngestPipeline {
    pub fn new(config: PipelineConfig, parts: Components) -> Self {
        Self { config, parts }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Ingests every telemetry file of one vehicle.
    ///
    /// Never fails: errors and panics are folded into the result, and every
    /// lock taken during the run is released before returning.
    pub async fn process_vehicle(
        &self,
        request: &VehicleRequest,
        cancel: &CancellationToken,
    ) -> VehicleResult {
        let started = Instant::now();
        let ledger = LockLedger::default();
        let owner = format!("ingest-{}", uuid::Uuid::new_v4());
        let span = info_span!("vehicle",
            organization = %request.organization_id,
            vehicle = %request.vehicle_id,
            owner = %owner,
        );

        let run = AssertUnwindSafe(self.run_vehicle(request, &owner, &ledger, cancel))
            .catch_unwind()
            .instrument(span)
            .await;

        let mut result = match run {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload);
                log::error!(
                    "Run for vehicle {}/{} panicked: {}",
                    request.organization_id,
                    request.vehicle_id,
                    message
                );
                let mut result = VehicleResult::new(&request.organization_id, &request.vehicle_id);
                result
                    .errors
                    .push(FileError::panicked(String::new(), None, message));
                result
            }
        };

        let outstanding = ledger.drain();
        if !outstanding.is_empty() {
            let released = self.parts.locks.release_all(&outstanding).await;
            log::debug!(
                "Released {} of {} locks held at end of run",
                released,
                outstanding.len()
            );
        }

        result.processing_time_ms = started.elapsed().as_millis() as u64;
        self.record_vehicle_metrics(&result);
        log::info!(
            "Vehicle {}/{}: {} new, {} reprocessed, {} skipped, {} failed, {} data points in {}ms",
            result.organization_id,
            result.vehicle_id,
            result.new_files,
            result.reprocessed_files,
            result.skipped_files,
            result.failed_files,
            result.total_data_points,
            result.processing_time_ms
        );
        result
    }

    /// Runs [`IngestPipeline::process_vehicle`] for each vehicle of an
    /// organization over a bounded pool.
    pub async fn process_organization(
        &self,
        request: &OrganizationRequest,
        cancel: &CancellationToken,
    ) -> OrganizationResult {
        let started = Instant::now();
        let mut result = OrganizationResult::new(&request.organization_id);

        let vehicles = match &request.vehicle_ids {
            Some(ids) => ids.clone(),
            None => match VehicleScanner::new(&request.base_path)
                .list_vehicles(&request.organization_id)
            {
                Ok(vehicles) => vehicles,
                Err(e) => {
                    e.log("list vehicles");
                    result.errors.push(FileError::run_level(Stage::Scan, &e));
                    result.processing_time_ms = started.elapsed().as_millis() as u64;
                    return result;
                }
            },
        };

        let span = info_span!("organization",
            organization = %request.organization_id,
            vehicles = vehicles.len(),
        );
        let mut vehicle_results: Vec<VehicleResult> = stream::iter(vehicles)
            .map(|vehicle_id| {
                let vehicle_request = request.vehicle_request(&vehicle_id);
                async move { self.process_vehicle(&vehicle_request, cancel).await }
            })
            .buffer_unordered(self.config.vehicle_concurrency.max(1))
            .collect::<Vec<_>>()
            .instrument(span)
            .await;

        vehicle_results.sort_by(|a, b| a.vehicle_id.cmp(&b.vehicle_id));
        for vehicle in vehicle_results {
            result.add_vehicle(vehicle);
        }
        result.processing_time_ms = started.elapsed().as_millis() as u64;
        result
    }

    async fn run_vehicle(
        &self,
        request: &VehicleRequest,
        owner: &str,
        ledger: &LockLedger,
        cancel: &CancellationToken,
    ) -> VehicleResult {
        let mut result = VehicleResult::new(&request.organization_id, &request.vehicle_id);

        let vehicle_key = vehicle_resource_id(&request.organization_id, &request.vehicle_id);
        let grant = self
            .parts
            .locks
            .acquire(
                &vehicle_key,
                ResourceType::Vehicle,
                owner,
                Some(self.config.vehicle_lock_ttl()),
            )
            .await;
        match grant {
            Ok(LockGrant {
                granted: true,
                lock_id: Some(lock_id),
                ..
            }) => ledger.record(&lock_id),
            Ok(grant) => {
                log::info!(
                    "Vehicle {} is held by {}, not processing",
                    vehicle_key,
                    grant.held_by.as_deref().unwrap_or("another run")
                );
                result.vehicle_busy = true;
                return result;
            }
            Err(e) => {
                e.log("acquire vehicle lock");
                result
                    .errors
                    .push(FileError::run_level(Stage::AcquireLock, &e));
                return result;
            }
        }

        let files = match VehicleScanner::new(&request.base_path).scan(
            &request.organization_id,
            &request.vehicle_id,
            request.date,
        ) {
            Ok(files) => files,
            Err(e) => {
                e.log("scan vehicle directory");
                result.errors.push(FileError::run_level(Stage::Scan, &e));
                return result;
            }
        };
        result.files_seen = files.len() as u64;

        let mut by_type: BTreeMap<FileType, Vec<ScannedFile>> = BTreeMap::new();
        for file in files {
            by_type.entry(file.file_type).or_default().push(file);
        }

        let sub_pipelines = FileType::ALL.into_iter().map(|file_type| {
            let files = by_type.remove(&file_type).unwrap_or_default();
            self.run_file_type(file_type, files, request, owner, ledger, cancel)
        });
        for reports in join_all(sub_pipelines).await {
            for report in reports {
                result.absorb_report(report);
            }
        }
        result
    }

    async fn run_file_type(
        &self,
        file_type: FileType,
        files: Vec<ScannedFile>,
        request: &VehicleRequest,
        owner: &str,
        ledger: &LockLedger,
        cancel: &CancellationToken,
    ) -> Vec<FileReport> {
        if files.is_empty() {
            return Vec::new();
        }
        let span = info_span!("file_type", file_type = %file_type, files = files.len());
        stream::iter(files)
            .map(|file| self.process_file_guarded(file, request, owner, ledger, cancel))
            .buffer_unordered(self.config.max_concurrent_files.max(1))
            .collect::<Vec<_>>()
            .instrument(span)
            .await
    }

    /// File boundary: turns errors and panics into a failed outcome and
    /// releases the file lock. A lock left behind stays in the ledger for the
    /// end-of-run cleanup.
    async fn process_file_guarded(
        &self,
        file: ScannedFile,
        request: &VehicleRequest,
        owner: &str,
        ledger: &LockLedger,
        cancel: &CancellationToken,
    ) -> FileReport {
        let name = file
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let file_type = file.file_type;
        let span = info_span!("file", name = %name, file_type = %file_type);
        let mut ctx = FileContext::new(file);

        let attempt = AssertUnwindSafe(self.process_file(&mut ctx, request, owner, ledger, cancel))
            .catch_unwind()
            .instrument(span)
            .await;

        let outcome = match attempt {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                e.log(&format!("{} {}", ctx.stage.as_str(), ctx.file.path.display()));
                self.mark_failed_quietly(&ctx, &e).await;
                FileOutcome::Failed(FileError::new(&ctx.file.path, file_type, ctx.stage, &e))
            }
            Err(payload) => {
                let message = panic_message(payload);
                log::error!("Processing {} panicked: {}", ctx.file.path.display(), message);
                let e = IngestError::Processing(format!("panic: {}", message));
                self.mark_failed_quietly(&ctx, &e).await;
                FileOutcome::Failed(FileError::panicked(name, Some(file_type), message))
            }
        };

        let mut release_error = None;
        if let Some(lock_id) = ctx.lock_id.take() {
            match self.parts.locks.release(&lock_id).await {
                Ok(_) => ledger.forget(&lock_id),
                Err(e) => {
                    e.log("release file lock");
                    release_error = Some(FileError::new(
                        &ctx.file.path,
                        file_type,
                        Stage::Release,
                        &e,
                    ));
                }
            }
        }

        self.record_file_metrics(file_type, &outcome);
        FileReport {
            outcome,
            release_error,
        }
    }

    async fn process_file(
        &self,
        ctx: &mut FileContext,
        request: &VehicleRequest,
        owner: &str,
        ledger: &LockLedger,
        cancel: &CancellationToken,
    ) -> Result<FileOutcome> {
        let policy = request.options.policy();
        let path = ctx.file.path.clone();
        let file_type = ctx.file.file_type;
        let store = &self.parts.store;

        ctx.stage = Stage::Decide;
        let decision = store
            .decide(&path, &request.organization_id, policy)
            .await?;
        if !decision.should_process {
            if let Some(existing) = &decision.existing {
                if matches!(
                    existing.processing_status,
                    ProcessingStatus::Pending | ProcessingStatus::Failed
                ) {
                    ctx.stage = Stage::Transition;
                    store
                        .mark_skipped(&existing.id, decision.reason.as_str())
                        .await?;
                }
            }
            log::debug!(
                "Skipping {}: {}",
                path.display(),
                decision.reason.as_str()
            );
            return Ok(skipped(decision.reason.as_str()));
        }

        if file_type.requires_decoding()
            && !request.options.decode_can_files
            && self.parts.decoder.needs_decoding(&path).await?
        {
            log::info!(
                "Skipping {}: decoding disabled and no decoded artifact",
                path.display()
            );
            return Ok(skipped("decoding disabled"));
        }

        let identity = decision
            .identity
            .ok_or_else(|| IngestError::validation(&path, "file identity unavailable"))?;
        let lock_key = file_resource_id(&request.organization_id, &identity.fingerprint);

        ctx.stage = Stage::Register;
        let (record, created) = store
            .register_identity(
                identity,
                file_type,
                &request.vehicle_id,
                &request.organization_id,
            )
            .await?;
        ctx.record_id = Some(record.id.clone());

        ctx.stage = Stage::AcquireLock;
        let grant = self
            .parts
            .locks
            .acquire(
                &lock_key,
                ResourceType::File,
                owner,
                Some(self.config.file_lock_ttl()),
            )
            .await?;
        let lock_id = match grant {
            LockGrant {
                granted: true,
                lock_id: Some(lock_id),
                ..
            } => lock_id,
            grant => {
                log::info!(
                    "Skipping {}: held by {}",
                    path.display(),
                    grant.held_by.as_deref().unwrap_or("another run")
                );
                return Ok(skipped("locked by another run"));
            }
        };
        ledger.record(&lock_id);
        ctx.lock_id = Some(lock_id);

        // Another run may have finished the file between the first decision
        // and the lock.
        ctx.stage = Stage::Decide;
        let current = store.redecide(&record.id, policy).await?;
        if !current.should_process {
            return Ok(skipped(current.reason.as_str()));
        }

        ctx.stage = Stage::Transition;
        match current.reason {
            DecisionReason::ForcedReprocess => store.reset_for_reprocessing(&record.id).await?,
            DecisionReason::StaleProcessing => {
                log::warn!(
                    "Taking over {}: previous attempt never finished",
                    path.display()
                );
                store
                    .mark_failed(&record.id, vec![current.reason.as_str().to_string()])
                    .await?;
            }
            _ => {}
        }
        store.mark_processing(&record.id).await?;
        ctx.processing = true;

        ctx.stage = Stage::Validate;
        self.validate(&path, file_type).await?;

        ctx.stage = Stage::Process;
        let data_points = self
            .ingest(&record, &path, request.options.decode_can_files, cancel)
            .await?;
        log::info!(
            "Ingested {} ({} data points)",
            path.display(),
            data_points
        );

        Ok(if created {
            FileOutcome::New { data_points }
        } else {
            FileOutcome::Reprocessed { data_points }
        })
    }

    async fn validate(&self, path: &Path, file_type: FileType) -> Result<()> {
        let report = if file_type.requires_decoding() {
            self.parts.decoder.validate(path).await?
        } else {
            validate_telemetry_file(path).await?
        };
        report.into_result(path).map(|_| ())
    }

    /// Decode (CAN), parse and persist as one retried transactional unit.
    /// Decoding runs under the external-decode deadline and parsing under the
    /// file deadline; the unit as a whole also gets the store deadline for
    /// its commit.
    async fn ingest(
        &self,
        record: &FileRecord,
        path: &Path,
        decode_enabled: bool,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let file_type = record.file_type;
        let parser = self.parts.parsers.get(file_type);
        let resilience = &self.parts.resilience;
        let timeouts = &resilience.config().timeouts;
        let mut budget =
            timeouts.for_class(OperationClass::File) + timeouts.for_class(OperationClass::Store);
        if file_type.requires_decoding() && self.parts.decoder.needs_decoding(path).await? {
            budget += timeouts.for_class(OperationClass::ExternalDecode);
        }

        let commit_record = record.clone();
        let operation = format!("ingest {}", record.name);
        let decode_operation = format!("decode {}", record.name);
        let parse_operation = format!("parse {}", record.name);
        resilience
            .with_transaction(
                &operation,
                Some(budget),
                cancel,
                |token| {
                    let parser = Arc::clone(&parser);
                    let decode_operation = &decode_operation;
                    let parse_operation = &parse_operation;
                    async move {
                        let decoded_path = if file_type.requires_decoding() {
                            let decoded = resilience
                                .with_timeout(
                                    decode_operation,
                                    OperationClass::ExternalDecode,
                                    None,
                                    &token,
                                    |step| async move {
                                        self.decoded_source(record, path, decode_enabled, &step)
                                            .await
                                    },
                                )
                                .await
                                .into_result()?;
                            Some(decoded)
                        } else {
                            None
                        };
                        let source = decoded_path.as_deref().unwrap_or(path);

                        let (points, outcome) = resilience
                            .with_timeout(
                                parse_operation,
                                OperationClass::File,
                                None,
                                &token,
                                |step| async move {
                                    let mut points = Vec::new();
                                    let outcome = self
                                        .parts
                                        .streaming
                                        .process_auto(
                                            source,
                                            parser.as_ref(),
                                            |batch| {
                                                points.extend(batch);
                                                Ok(())
                                            },
                                            &step,
                                        )
                                        .await?;
                                    Ok((points, outcome))
                                },
                            )
                            .await
                            .into_result()?;
                        Ok::<_, IngestError>(Staged {
                            points,
                            outcome,
                            decoded_path,
                        })
                    }
                },
                move |tx, staged: Staged| {
                    let count = data_point_repo::replace_for_file(tx, &commit_record, &staged.points)?;
                    let metadata = completion_metadata(&staged);
                    let outcome = file_repo::mark_completed(
                        tx,
                        &commit_record.id,
                        count,
                        &metadata,
                        Utc::now(),
                    )?;
                    check_transition(outcome, &commit_record.id, ProcessingStatus::Completed)?;
                    Ok(count)
                },
            )
            .await
    }

    /// Path of the decoded artifact for a CAN source, decoding if needed.
    async fn decoded_source(
        &self,
        record: &FileRecord,
        path: &Path,
        decode_enabled: bool,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let decoder = &self.parts.decoder;
        if !decode_enabled && decoder.needs_decoding(path).await? {
            return Err(IngestError::Decoding {
                path: path.to_path_buf(),
                reason: "decoding disabled and no decoded artifact".to_string(),
                transient: false,
            });
        }

        let outcome = decoder.decode(path, cancel).await?;
        let status = if outcome.success {
            DecodeStatus::Decoded
        } else {
            DecodeStatus::DecodingFailed
        };
        if status != record.decode_status || outcome.decoded_path != record.decoded_path {
            self.parts
                .store
                .update_decode_status(&record.id, status, outcome.decoded_path.clone())
                .await?;
        }
        outcome.into_result(path)
    }

    async fn mark_failed_quietly(&self, ctx: &FileContext, error: &IngestError) {
        if !ctx.processing {
            return;
        }
        let Some(record_id) = &ctx.record_id else {
            return;
        };
        if let Err(e) = self
            .parts
            .store
            .mark_failed(record_id, vec![error.to_string()])
            .await
        {
            log::error!("Could not mark {} FAILED: {}", record_id, e);
        }
    }

    fn record_file_metrics(&self, file_type: FileType, outcome: &FileOutcome) {
        let sink = self.parts.metrics.as_ref();
        let (status, data_points) = match outcome {
            FileOutcome::New { data_points } => ("new", *data_points),
            FileOutcome::Reprocessed { data_points } => ("reprocessed", *data_points),
            FileOutcome::Skipped { .. } => ("skipped", 0),
            FileOutcome::Failed(error) => {
                metrics::report_critical(sink, &error.operation, error.category, error.severity);
                ("failed", 0)
            }
        };
        sink.record_metric(
            "ingest_files_total",
            1.0,
            MetricKind::Counter,
            &labels([("file_type", file_type.as_str()), ("status", status)]),
        );
        if data_points > 0 {
            sink.record_metric(
                "ingest_data_points_total",
                data_points as f64,
                MetricKind::Counter,
                &labels([("file_type", file_type.as_str())]),
            );
        }
    }

    fn record_vehicle_metrics(&self, result: &VehicleResult) {
        let sink = self.parts.metrics.as_ref();
        // File-level failures were already reported per file.
        for error in result.errors.iter().filter(|e| e.file_type.is_none()) {
            metrics::report_critical(sink, &error.operation, error.category, error.severity);
        }
        sink.record_metric(
            "ingest_vehicle_duration_ms",
            result.processing_time_ms as f64,
            MetricKind::Histogram,
            &labels([("organization", result.organization_id.as_str())]),
        );
        if result.vehicle_busy {
            sink.record_metric(
                "ingest_vehicle_busy_total",
                1.0,
                MetricKind::Counter,
                &labels([("organization", result.organization_id.as_str())]),
            );
        }
    }
}

fn skipped(reason: &str) -> FileOutcome {
    FileOutcome::Skipped {
        reason: reason.to_string(),
    }
}

fn completion_metadata(staged: &Staged) -> serde_json::Map<String, serde_json::Value> {
    let outcome = &staged.outcome;
    let mut metadata = serde_json::Map::new();
    metadata.insert("linesRead".to_string(), json!(outcome.lines_read));
    metadata.insert("bytesRead".to_string(), json!(outcome.bytes_read));
    metadata.insert("lineErrors".to_string(), json!(outcome.error_count));
    metadata.insert("peakBufferedBytes".to_string(), json!(outcome.peak_buffered_bytes));
    metadata.insert("peakMemoryBytes".to_string(), json!(outcome.peak_memory_bytes));
    metadata.insert(
        "memoryCeilingExceeded".to_string(),
        json!(outcome.memory_ceiling_exceeded),
    );
    metadata.insert("parseMs".to_string(), json!(outcome.elapsed_ms));
    if let Some(path) = &staged.decoded_path {
        metadata.insert("decodedPath".to_string(), json!(path.display().to_string()));
    }
    if !outcome.errors.is_empty() {
        let samples: Vec<String> = outcome
            .errors
            .iter()
            .take(LINE_ERROR_SAMPLES)
            .map(|e| format!("line {}: {}", e.line_number, e.message))
            .collect();
        metadata.insert("lineErrorSamples".to_string(), json!(samples));
    }
    metadata
}
