//! Builders for telemetry files and a scriptable decoder backend.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use fleet_ingest::decoder::BackendOutput;
use fleet_ingest::{DecoderBackend, FileType, IngestError, Result};

/// Builds the text content of one telemetry file.
pub struct TelemetryFileBuilder {
    file_type: FileType,
    date: String,
    sequence: u32,
    rows: usize,
    salt: String,
    raw: Option<String>,
}

impl TelemetryFileBuilder {
    pub fn new(file_type: FileType) -> Self {
        Self {
            file_type,
            date: "20250314".to_string(),
            sequence: 1,
            rows: 5,
            salt: String::new(),
            raw: None,
        }
    }

    /// Date stamp in the file name, as `YYYYMMDD`.
    pub fn date(mut self, date: &str) -> Self {
        self.date = date.to_string();
        self
    }

    pub fn sequence(mut self, sequence: u32) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn rows(mut self, rows: usize) -> Self {
        self.rows = rows;
        self
    }

    /// Extra text folded into every row so otherwise identical files get
    /// distinct fingerprints.
    pub fn salt(mut self, salt: &str) -> Self {
        self.salt = salt.to_string();
        self
    }

    /// Replaces the generated body.
    pub fn raw(mut self, content: &str) -> Self {
        self.raw = Some(content.to_string());
        self
    }

    pub fn file_name(&self) -> String {
        format!(
            "{}_{}_{:03}.txt",
            self.file_type.file_prefix(),
            self.date,
            self.sequence
        )
    }

    pub fn content(&self) -> String {
        if let Some(raw) = &self.raw {
            return raw.clone();
        }
        let tag = format!("{}{}", self.sequence, self.salt);
        match self.file_type {
            FileType::Can => (0..self.rows)
                .map(|i| format!("{}.{:03} 1 18FEF1{:02}x Rx d 8 {} 01 02\n", i, self.sequence, i % 100, tag))
                .collect(),
            FileType::Gps => {
                let mut out = String::from("timestamp;lat;lon;speed;tag\n");
                for i in 0..self.rows {
                    out.push_str(&format!(
                        "2025-03-14 10:{:02}:{:02};40.41{};-3.70{};{};{}\n",
                        i / 60 % 60,
                        i % 60,
                        i,
                        i,
                        50 + i,
                        tag
                    ));
                }
                out
            }
            FileType::Stability | FileType::Rotativo => {
                let mut out = String::from("timestamp,ax,ay,az,tag\n");
                for i in 0..self.rows {
                    out.push_str(&format!(
                        "2025-03-14 11:{:02}:{:02},0.{},-0.{},9.81,{}\n",
                        i / 60 % 60,
                        i % 60,
                        i,
                        i,
                        tag
                    ));
                }
                out
            }
        }
    }
}

/// What the fake decoder does when invoked.
#[derive(Debug, Clone)]
pub enum DecoderScript {
    /// Writes an artifact with this many data rows, exits 0.
    Rows(usize),
    /// Exits non-zero with this stderr.
    Fail(String),
    /// Exits 0 without writing anything.
    NoArtifact,
    /// Never finishes on its own; gives up only when cancelled.
    Hang,
}

/// In-process stand-in for the external decoder.
pub struct FakeDecoder {
    suffix: String,
    script: Mutex<DecoderScript>,
    calls: AtomicU32,
    decoded: Mutex<Vec<PathBuf>>,
}

impl FakeDecoder {
    pub fn new(script: DecoderScript) -> Self {
        Self {
            suffix: "_decoded.csv".to_string(),
            script: Mutex::new(script),
            calls: AtomicU32::new(0),
            decoded: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_script(&self, script: DecoderScript) {
        *self.script.lock().unwrap() = script;
    }

    pub fn decoded_sources(&self) -> Vec<PathBuf> {
        self.decoded.lock().unwrap().clone()
    }

    pub fn artifact_for(&self, source: &Path) -> PathBuf {
        let stem = source.file_stem().unwrap().to_string_lossy();
        source.with_file_name(format!("{}{}", stem, self.suffix))
    }
}

/// Writes a decoded artifact body with a header and `rows` data lines.
pub fn decoded_body(rows: usize) -> String {
    let mut out = String::from("timestamp;can_id;signal;value\n");
    for i in 0..rows {
        out.push_str(&format!(
            "2025-03-14 10:00:{:02};18FEF1{:02};EngineSpeed;{}\n",
            i % 60,
            i % 100,
            800 + i
        ));
    }
    out
}

impl DecoderBackend for FakeDecoder {
    fn decode<'a>(
        &'a self,
        source: &'a Path,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<BackendOutput>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.decoded.lock().unwrap().push(source.to_path_buf());
            let script = self.script.lock().unwrap().clone();
            let (exit_code, stderr) = match script {
                DecoderScript::Rows(rows) => {
                    std::fs::write(self.artifact_for(source), decoded_body(rows)).unwrap();
                    (0, String::new())
                }
                DecoderScript::Fail(stderr) => (2, stderr),
                DecoderScript::NoArtifact => (0, String::new()),
                DecoderScript::Hang => {
                    cancel.cancelled().await;
                    return Err(IngestError::Cancelled("decoder stopped".to_string()));
                }
            };
            Ok(BackendOutput {
                exit_code: Some(exit_code),
                success: exit_code == 0,
                stdout: String::new(),
                stderr,
                elapsed_ms: 1,
            })
        })
    }

    fn name(&self) -> &str {
        "fake"
    }
}
