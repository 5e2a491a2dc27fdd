//! Table-driven tests for configuration loading and validation.

mod common;

use std::sync::Arc;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use fleet_ingest::config::{load_config, load_config_from_str, ConfigSource, LogFormat};
use fleet_ingest::{IngestService, NoopMetrics, ProcessOptions};

struct ConfigTestCase {
    name: &'static str,
    config_json: &'static str,
    should_succeed: bool,
    expected_error: Option<&'static str>,
}

const JSON_CONFIG_TESTS: &[ConfigTestCase] = &[
    ConfigTestCase {
        name: "empty_object",
        config_json: "{}",
        should_succeed: true,
        expected_error: None,
    },
    ConfigTestCase {
        name: "valid_full",
        config_json: r#"{
            "database": { "path": "/var/lib/fleet/ingest.db" },
            "storage": { "basePath": "/srv/telemetry" },
            "streaming": {
                "chunkSizeBytes": 65536,
                "bufferChunks": 8,
                "maxLineBytes": 4096,
                "memoryCeilingBytes": 268435456,
                "memorySampleIntervalMs": 250,
                "maxRecordedErrors": 50,
                "maxConcurrentFiles": 2,
                "streamingThresholdBytes": 1048576
            },
            "resilience": {
                "timeouts": { "fileMs": 60000, "storeMs": 5000, "networkMs": 10000,
                              "externalDecodeMs": 120000, "cancelGraceMs": 500 },
                "retry": { "maxRetries": 2, "baseDelayMs": 200, "maxDelayMs": 2000,
                           "timeoutMaxDelayMs": 1000 },
                "isolation": "immediate"
            },
            "locks": { "ttlMs": 600000, "sweepIntervalMs": 30000, "staleProcessingMs": 900000 },
            "decoder": {
                "program": "/opt/can/decoder",
                "args": ["--dbc", "/opt/can/fleet.dbc"],
                "timeoutMs": 120000,
                "killGraceMs": 2000,
                "decodedSuffix": "_decoded.csv",
                "outputCapBytes": 32768,
                "validation": { "maxFileBytes": 52428800, "sampleLines": 10 }
            },
            "pipeline": { "maxConcurrentFiles": 4, "vehicleConcurrency": 1,
                          "vehicleLockTtlMs": 600000, "fileLockTtlMs": 600000 },
            "logging": { "level": "debug", "format": "json", "filter": null }
        }"#,
        should_succeed: true,
        expected_error: None,
    },
    ConfigTestCase {
        name: "invalid_json",
        config_json: r#"{ "storage": "#,
        should_succeed: false,
        expected_error: Some("Failed to parse config JSON"),
    },
    ConfigTestCase {
        name: "invalid_unknown_section",
        config_json: r#"{ "email": {} }"#,
        should_succeed: false,
        expected_error: Some("Schema validation failed"),
    },
    ConfigTestCase {
        name: "invalid_log_level",
        config_json: r#"{ "logging": { "level": "verbose" } }"#,
        should_succeed: false,
        expected_error: Some("Schema validation failed"),
    },
    ConfigTestCase {
        name: "invalid_isolation",
        config_json: r#"{ "resilience": { "isolation": "serializable" } }"#,
        should_succeed: false,
        expected_error: Some("Schema validation failed"),
    },
    ConfigTestCase {
        name: "invalid_zero_concurrency",
        config_json: r#"{ "pipeline": { "maxConcurrentFiles": 0 } }"#,
        should_succeed: false,
        expected_error: Some("Schema validation failed"),
    },
    ConfigTestCase {
        name: "invalid_line_larger_than_ceiling",
        config_json: r#"{ "streaming": { "maxLineBytes": 2048, "memoryCeilingBytes": 1024 } }"#,
        should_succeed: false,
        expected_error: Some("maxLineBytes"),
    },
    ConfigTestCase {
        name: "invalid_blank_decoder_program",
        config_json: r#"{ "decoder": { "program": "   " } }"#,
        should_succeed: false,
        expected_error: Some("decoder.program"),
    },
];

#[test]
fn test_json_config_loading() {
    for test_case in JSON_CONFIG_TESTS {
        let result = load_config_from_str(test_case.config_json);

        if test_case.should_succeed {
            assert!(
                result.is_ok(),
                "Test '{}': Expected success but got error: {:?}",
                test_case.name,
                result.err()
            );
        } else {
            assert!(
                result.is_err(),
                "Test '{}': Expected error but got success",
                test_case.name
            );

            if let Some(expected_error) = test_case.expected_error {
                let error_msg = result.err().unwrap().to_string();
                assert!(
                    error_msg.contains(expected_error),
                    "Test '{}': Expected error containing '{}', got '{}'",
                    test_case.name,
                    expected_error,
                    error_msg
                );
            }
        }
    }
}

#[test]
fn test_full_config_values() {
    let config = load_config_from_str(JSON_CONFIG_TESTS[1].config_json).unwrap();
    assert_eq!(config.decoder.args, vec!["--dbc", "/opt/can/fleet.dbc"]);
    assert_eq!(config.pipeline.vehicle_concurrency, 1);
    assert_eq!(config.logging.format, LogFormat::Json);
    assert_eq!(config.locks.stale_processing_ms, 900_000);
}

#[tokio::test]
async fn test_service_from_config_file() {
    let dir = TempDir::new().unwrap();
    let base = dir.path().join("data");
    let vehicle_gps = base.join("org").join("veh").join("GPS");
    std::fs::create_dir_all(&vehicle_gps).unwrap();
    std::fs::write(
        vehicle_gps.join("GPS_20250314_001.txt"),
        "timestamp;lat;lon\n2025-03-14 10:00:00;40.4;-3.7\n",
    )
    .unwrap();

    let db_path = dir.path().join("state").join("ingest.db");
    let config_path = dir.path().join("ingest.json");
    std::fs::write(
        &config_path,
        serde_json::json!({
            "database": { "path": db_path.to_string_lossy() },
            "storage": { "basePath": base.to_string_lossy() }
        })
        .to_string(),
    )
    .unwrap();

    let config = load_config(&[ConfigSource::Defaults, ConfigSource::JsonFile(config_path)]).unwrap();
    let service = IngestService::open(&config, Arc::new(NoopMetrics), None).unwrap();
    let request = service.vehicle_request("org", "veh", None, ProcessOptions::default());
    let result = service
        .process_vehicle(&request, &CancellationToken::new())
        .await;

    assert_eq!(result.new_files, 1, "errors: {:?}", result.errors);
    assert!(db_path.exists());

    // Reopening the same database sees the completed record.
    drop(service);
    let service = IngestService::open(&config, Arc::new(NoopMetrics), None).unwrap();
    let result = service
        .process_vehicle(&request, &CancellationToken::new())
        .await;
    assert_eq!(result.skipped_files, 1);
}
