//! End-to-end runs of the vehicle pipeline over a temporary telemetry tree.

mod common;

use std::sync::{Arc, OnceLock};

use chrono::NaiveDate;
use tokio_util::sync::CancellationToken;

use common::harness::{ORG, VEHICLE};
use common::{TelemetryFileBuilder, TestHarness};
use fleet_ingest::locks::{file_resource_id, vehicle_resource_id};
use fleet_ingest::streaming::{DelimitedLineParser, LineParseError, LineParser, ParserRegistry};
use fleet_ingest::{
    DataPoint, Database, ErrorCategory, FileType, ProcessOptions, ProcessingStatus, ResourceType,
};

fn gps(sequence: u32) -> TelemetryFileBuilder {
    TelemetryFileBuilder::new(FileType::Gps).sequence(sequence)
}

#[tokio::test]
async fn test_first_run_ingests_every_type() {
    let harness = TestHarness::new();
    harness.write(gps(1).rows(6), FileType::Gps);
    harness.write(
        TelemetryFileBuilder::new(FileType::Stability).rows(3),
        FileType::Stability,
    );
    harness.write(
        TelemetryFileBuilder::new(FileType::Rotativo).rows(2),
        FileType::Rotativo,
    );
    let can = harness.write(TelemetryFileBuilder::new(FileType::Can), FileType::Can);

    let result = harness.run().await;

    assert_eq!(result.files_seen, 4);
    assert_eq!(result.new_files, 4, "errors: {:?}", result.errors);
    assert_eq!(result.failed_files, 0);
    // 6 + 3 + 2 parsed rows, plus 4 rows in the decoded CAN artifact.
    assert_eq!(result.total_data_points, 15);
    assert!(!result.vehicle_busy);

    let record = harness.record_for(&can).await.unwrap();
    assert_eq!(record.processing_status, ProcessingStatus::Completed);
    assert_eq!(record.data_points_count, 4);
    assert_eq!(record.decoded_path, Some(harness.decoder.artifact_for(&can)));
    assert_eq!(harness.active_locks().await, 0);
}

#[tokio::test]
async fn test_second_run_is_idempotent() {
    let harness = TestHarness::new();
    for seq in 1..=3 {
        harness.write(gps(seq), FileType::Gps);
    }

    let first = harness.run().await;
    assert_eq!(first.new_files, 3);

    let second = harness.run().await;
    assert_eq!(second.new_files, 0);
    assert_eq!(second.reprocessed_files, 0);
    assert_eq!(second.skipped_files, 3);
    assert_eq!(second.total_data_points, 0);

    let stats = harness.service.processing_stats(ORG, Some(VEHICLE)).await.unwrap();
    assert_eq!(stats.total_files, 3);
    assert_eq!(stats.count_for(ProcessingStatus::Completed), 3);
    assert_eq!(stats.total_data_points, first.total_data_points);
}

#[tokio::test]
async fn test_forced_reprocess_replaces_data_points() {
    let harness = TestHarness::new();
    let path = harness.write(gps(1).rows(5), FileType::Gps);
    harness.run().await;

    let result = harness
        .run_with(ProcessOptions {
            reprocess_completed: true,
            ..Default::default()
        })
        .await;

    assert_eq!(result.reprocessed_files, 1);
    assert_eq!(result.new_files, 0);
    let record = harness.record_for(&path).await.unwrap();
    assert_eq!(record.data_points_count, 5);
    let stats = harness.service.processing_stats(ORG, None).await.unwrap();
    assert_eq!(stats.total_data_points, 5);
}

#[tokio::test]
async fn test_renamed_file_is_not_ingested_twice() {
    let harness = TestHarness::new();
    let path = harness.write(gps(1), FileType::Gps);
    harness.run().await;

    let renamed = path.with_file_name("GPS_20250314_099.txt");
    std::fs::rename(&path, &renamed).unwrap();
    let result = harness.run().await;

    assert_eq!(result.new_files, 0);
    assert_eq!(result.skipped_files, 1);
    let stats = harness.service.processing_stats(ORG, None).await.unwrap();
    assert_eq!(stats.total_files, 1);
}

#[tokio::test]
async fn test_changed_content_is_a_new_file() {
    let harness = TestHarness::new();
    let path = harness.write(gps(1), FileType::Gps);
    harness.run().await;

    let mut content = std::fs::read_to_string(&path).unwrap();
    content.push_str("2025-03-14 12:00:00;40.5;-3.7;60;x\n");
    std::fs::write(&path, content).unwrap();
    let result = harness.run().await;

    assert_eq!(result.new_files, 1);
    let stats = harness.service.processing_stats(ORG, None).await.unwrap();
    assert_eq!(stats.total_files, 2);
}

/// Fails every line of a file whose rows are marked `POISON`.
fn poisoned_gps_registry() -> ParserRegistry {
    let fallback = DelimitedLineParser::new();
    ParserRegistry::new().with(
        FileType::Gps,
        Arc::new(
            move |line: &str, line_number: u64| -> Result<Option<DataPoint>, LineParseError> {
                if line.contains("POISON") {
                    return Err("poisoned row".into());
                }
                fallback.parse_line(line, line_number)
            },
        ),
    )
}

#[tokio::test]
async fn test_one_bad_file_does_not_stop_the_others() {
    let harness = TestHarness::with_parsers(poisoned_gps_registry());
    for seq in 1..=10 {
        let builder = if seq == 5 {
            gps(seq).raw("POISON;1\nPOISON;2\nPOISON;3\n")
        } else {
            gps(seq).rows(2)
        };
        harness.write(builder, FileType::Gps);
    }

    let result = harness.run().await;

    assert_eq!(result.failed_files, 1);
    assert_eq!(result.processed_files(), 9);
    assert_eq!(result.total_data_points, 18);
    assert_eq!(result.errors.len(), 1);
    let error = &result.errors[0];
    assert_eq!(error.file, "GPS_20250314_005.txt");
    assert_eq!(error.file_type, Some(FileType::Gps));
    assert_eq!(error.category, ErrorCategory::Processing);
    assert!(error.message.contains("poisoned row"));

    let pending = harness.service.pending_files(ORG, None, 100).await.unwrap();
    assert!(pending.is_empty());
    assert_eq!(harness.active_locks().await, 0);
}

#[tokio::test]
async fn test_failed_file_is_retried_unless_disabled() {
    let harness = TestHarness::with_parsers(poisoned_gps_registry());
    let path = harness.write(gps(1).raw("POISON;1\n"), FileType::Gps);

    let first = harness.run().await;
    assert_eq!(first.failed_files, 1);
    let record = harness.record_for(&path).await.unwrap();
    assert_eq!(record.processing_status, ProcessingStatus::Failed);

    let retried = harness.run().await;
    assert_eq!(retried.failed_files, 1);
    assert_eq!(retried.reprocessed_files, 0);

    let declined = harness
        .run_with(ProcessOptions {
            reprocess_failed: false,
            ..Default::default()
        })
        .await;
    assert_eq!(declined.skipped_files, 1);
    let record = harness.record_for(&path).await.unwrap();
    assert_eq!(record.processing_status, ProcessingStatus::Skipped);
}

#[tokio::test]
async fn test_parser_panic_is_contained() {
    let registry = ParserRegistry::new().with(
        FileType::Stability,
        Arc::new(
            |line: &str, _line_number: u64| -> Result<Option<DataPoint>, LineParseError> {
                if line.contains("PANIC") {
                    panic!("parser blew up");
                }
                Ok(None)
            },
        ),
    );
    let harness = TestHarness::with_parsers(registry);
    let bad = harness.write(
        TelemetryFileBuilder::new(FileType::Stability).raw("PANIC,1\n"),
        FileType::Stability,
    );
    harness.write(gps(1).rows(3), FileType::Gps);

    let result = harness.run().await;

    assert_eq!(result.new_files, 1);
    assert_eq!(result.failed_files, 1);
    assert!(result.errors[0].message.contains("parser blew up"));
    let record = harness.record_for(&bad).await.unwrap();
    assert_eq!(record.processing_status, ProcessingStatus::Failed);
    assert_eq!(harness.active_locks().await, 0);
}

#[tokio::test]
async fn test_failed_lock_release_is_reported() {
    // Drops the lock table while the file is being parsed, so the data commit
    // succeeds but the lease cannot be released.
    let database: Arc<OnceLock<Database>> = Arc::new(OnceLock::new());
    let slot = Arc::clone(&database);
    let fallback = DelimitedLineParser::new();
    let registry = ParserRegistry::new().with(
        FileType::Gps,
        Arc::new(
            move |line: &str, line_number: u64| -> Result<Option<DataPoint>, LineParseError> {
                if let Some(db) = slot.get() {
                    db.with_conn(|conn| {
                        conn.execute_batch("DROP TABLE IF EXISTS processing_locks")?;
                        Ok(())
                    })
                    .map_err(|e| e.to_string())?;
                }
                fallback.parse_line(line, line_number)
            },
        ),
    );
    let harness = TestHarness::with_parsers(registry);
    let _ = database.set(harness.service.store().database().clone());
    let path = harness.write(gps(1).rows(2), FileType::Gps);

    let result = harness.run().await;

    assert_eq!(result.new_files, 1, "errors: {:?}", result.errors);
    assert_eq!(result.failed_files, 0);
    assert_eq!(result.total_data_points, 2);
    assert_eq!(result.errors.len(), 1);
    let error = &result.errors[0];
    assert_eq!(error.operation, "release");
    assert_eq!(error.file, "GPS_20250314_001.txt");
    let record = harness.record_for(&path).await.unwrap();
    assert_eq!(record.processing_status, ProcessingStatus::Completed);
}

#[tokio::test]
async fn test_busy_vehicle_is_not_touched() {
    let harness = TestHarness::new();
    harness.write(gps(1), FileType::Gps);
    let grant = harness
        .service
        .locks()
        .acquire(
            &vehicle_resource_id(ORG, VEHICLE),
            ResourceType::Vehicle,
            "other-run",
            None,
        )
        .await
        .unwrap();
    assert!(grant.granted);

    let result = harness.run().await;

    assert!(result.vehicle_busy);
    assert_eq!(result.files_seen, 0);
    assert_eq!(result.processed_files(), 0);
    // Only the foreign lease remains.
    assert_eq!(harness.active_locks().await, 1);
}

#[tokio::test]
async fn test_locked_file_is_skipped() {
    let harness = TestHarness::new();
    let locked = harness.write(gps(1), FileType::Gps);
    harness.write(gps(2), FileType::Gps);
    let identity = fleet_ingest::state::identify(&locked).await.unwrap();
    harness
        .service
        .locks()
        .acquire(
            &file_resource_id(ORG, &identity.fingerprint),
            ResourceType::File,
            "other-run",
            None,
        )
        .await
        .unwrap();

    let result = harness.run().await;

    assert_eq!(result.new_files, 1);
    assert_eq!(result.skipped_files, 1);
    let record = harness.record_for(&locked).await.unwrap();
    assert_eq!(record.processing_status, ProcessingStatus::Pending);
}

#[tokio::test]
async fn test_abandoned_attempt_is_taken_over() {
    let harness = TestHarness::new();
    let path = harness.write(gps(1).rows(3), FileType::Gps);
    let store = harness.service.store();
    let (record, _) = store
        .register_or_update(&path, FileType::Gps, VEHICLE, ORG)
        .await
        .unwrap();
    store.mark_processing(&record.id).await.unwrap();

    // A live attempt is left alone.
    let result = harness.run().await;
    assert_eq!(result.skipped_files, 1);
    let record = harness.record_for(&path).await.unwrap();
    assert_eq!(record.processing_status, ProcessingStatus::Processing);

    // The run that claimed it died long ago.
    harness.backdate_processing(&record.id, chrono::Duration::hours(2));
    let result = harness.run().await;

    assert_eq!(result.reprocessed_files, 1, "errors: {:?}", result.errors);
    assert_eq!(result.skipped_files, 0);
    assert_eq!(result.total_data_points, 3);
    let record = harness.record_for(&path).await.unwrap();
    assert_eq!(record.processing_status, ProcessingStatus::Completed);
    assert_eq!(record.data_points_count, 3);
    assert_eq!(record.attempt_count, 2);
    assert_eq!(harness.active_locks().await, 0);

    // Later runs see the completed row.
    let result = harness.run().await;
    assert_eq!(result.skipped_files, 1);
    assert_eq!(result.reprocessed_files, 0);
}

#[tokio::test]
async fn test_date_filter() {
    let harness = TestHarness::new();
    harness.write(gps(1).date("20250314"), FileType::Gps);
    harness.write(gps(2).date("20250315"), FileType::Gps);

    let request = harness.service.vehicle_request(
        ORG,
        VEHICLE,
        NaiveDate::from_ymd_opt(2025, 3, 15),
        ProcessOptions::default(),
    );
    let result = harness
        .service
        .process_vehicle(&request, &CancellationToken::new())
        .await;

    assert_eq!(result.files_seen, 1);
    assert_eq!(result.new_files, 1);
}

#[tokio::test]
async fn test_missing_vehicle_directory_yields_empty_result() {
    let harness = TestHarness::new();
    let result = harness.run().await;
    assert_eq!(result.files_seen, 0);
    assert!(result.errors.is_empty());
    assert_eq!(harness.active_locks().await, 0);
}

#[tokio::test]
async fn test_organization_run_covers_every_vehicle() {
    let harness = TestHarness::new();
    harness.write_for("veh-a", gps(1).rows(2).salt("a"), FileType::Gps);
    harness.write_for("veh-b", gps(1).rows(3).salt("b"), FileType::Gps);
    harness.write_for(
        "veh-b",
        TelemetryFileBuilder::new(FileType::Rotativo).rows(1).salt("b"),
        FileType::Rotativo,
    );

    let result = harness.run_organization().await;

    assert_eq!(result.vehicles.len(), 2);
    assert_eq!(result.new_files, 3);
    assert_eq!(result.total_data_points, 6);
    assert_eq!(result.busy_vehicles, 0);
    assert_eq!(result.vehicles[0].vehicle_id, "veh-a");
}

#[tokio::test]
async fn test_metrics_are_reported() {
    let harness = TestHarness::new();
    harness.write(gps(1).rows(4), FileType::Gps);
    harness.run().await;

    assert_eq!(harness.metrics.total("ingest_files_total"), 1.0);
    assert_eq!(harness.metrics.total("ingest_data_points_total"), 4.0);
    assert!(harness
        .metrics
        .samples()
        .iter()
        .any(|s| s.name == "ingest_vehicle_duration_ms"));
}
