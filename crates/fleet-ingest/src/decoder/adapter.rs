use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use super::backend::{DecoderBackend, SubprocessDecoder};
use super::validation::{validate_can_file, ValidationReport};
use super::{DecodeOutcome, DecoderConfig};
use crate::error::{IngestError, Result};

/// Tail of captured stderr carried into failure messages.
const STDERR_TAIL_CHARS: usize = 500;

/// Drives the external decoder and owns the sibling-artifact convention.
#[derive(Clone)]
pub struct CanDecoder {
    config: DecoderConfig,
    backend: Arc<dyn DecoderBackend>,
}

impl CanDecoder {
    pub fn new(config: DecoderConfig, backend: Arc<dyn DecoderBackend>) -> Self {
        Self { config, backend }
    }

    /// Uses a [`SubprocessDecoder`] built from `config`.
    pub fn from_config(config: DecoderConfig) -> Self {
        let backend = SubprocessDecoder::new(&config.program, config.args.clone())
            .with_timeout(config.timeout(), config.kill_grace())
            .with_output_cap(config.output_cap_bytes);
        Self::new(config, Arc::new(backend))
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// `<dir>/<stem><suffix>` next to `source`.
    pub fn decoded_path_for(&self, source: &Path) -> PathBuf {
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        source.with_file_name(format!("{}{}", stem, self.config.decoded_suffix))
    }

    pub fn is_decoded_artifact(&self, path: &Path) -> bool {
        path.file_name()
            .map(|n| n.to_string_lossy().ends_with(&self.config.decoded_suffix))
            .unwrap_or(false)
    }

    /// False for artifacts themselves and for sources with a non-empty
    /// artifact. A zero-byte artifact is left over from a failed run; it is
    /// deleted and the source needs decoding again.
    pub async fn needs_decoding(&self, source: &Path) -> Result<bool> {
        if self.is_decoded_artifact(source) {
            return Ok(false);
        }
        let artifact = self.decoded_path_for(source);
        Ok(self.usable_artifact(&artifact).await?.is_none())
    }

    /// Returns the artifact's size if it exists and is non-empty, removing
    /// it if it is empty.
    async fn usable_artifact(&self, artifact: &Path) -> Result<Option<u64>> {
        match tokio::fs::metadata(artifact).await {
            Ok(meta) if meta.len() > 0 => Ok(Some(meta.len())),
            Ok(_) => {
                log::warn!("Removing empty decoded artifact {}", artifact.display());
                match tokio::fs::remove_file(artifact).await {
                    Ok(()) => Ok(None),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                    Err(e) => Err(IngestError::io(artifact, e)),
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(IngestError::io(artifact, e)),
        }
    }

    /// Produces the decoded artifact for `source`, or reuses a non-empty one
    /// without invoking the backend.
    ///
    /// Decoder failures are reported in the outcome. Only timeouts,
    /// cancellation and filesystem errors are returned as `Err`.
    pub async fn decode(&self, source: &Path, cancel: &CancellationToken) -> Result<DecodeOutcome> {
        let artifact = self.decoded_path_for(source);
        if self.usable_artifact(&artifact).await?.is_some() {
            let rows = count_rows(&artifact).await?;
            log::debug!(
                "Reusing decoded artifact {} ({} rows)",
                artifact.display(),
                rows
            );
            return Ok(DecodeOutcome::reused(artifact, rows));
        }

        log::info!(
            "Decoding {} with {} backend",
            source.display(),
            self.backend.name()
        );
        let output = match self.backend.decode(source, cancel).await {
            Ok(output) => output,
            Err(IngestError::Decoding {
                reason, transient, ..
            }) => return Ok(DecodeOutcome::failed(reason, transient)),
            Err(e) => return Err(e),
        };

        if !output.success {
            let code = output
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            let mut reason = format!("decoder exited with {}", code);
            let detail = stderr_tail(&output.stderr, &output.stdout);
            if !detail.is_empty() {
                reason.push_str(": ");
                reason.push_str(&detail);
            }
            return Ok(DecodeOutcome::failed(reason, true));
        }

        match self.usable_artifact(&artifact).await? {
            Some(_) => {
                let rows = count_rows(&artifact).await?;
                log::info!(
                    "Decoded {} in {}ms ({} rows)",
                    source.display(),
                    output.elapsed_ms,
                    rows
                );
                Ok(DecodeOutcome::decoded(artifact, rows))
            }
            None => Ok(DecodeOutcome::failed(
                format!(
                    "decoder exited 0 but {} is missing or empty",
                    artifact.display()
                ),
                true,
            )),
        }
    }

    pub async fn validate(&self, path: &Path) -> Result<ValidationReport> {
        validate_can_file(path, &self.config.validation).await
    }
}

/// Non-empty lines in `path`.
async fn count_rows(path: &Path) -> Result<u64> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| IngestError::io(path, e))?;
    let mut reader = BufReader::new(file);
    let mut buf = Vec::new();
    let mut rows = 0u64;
    loop {
        buf.clear();
        let n = reader
            .read_until(b'\n', &mut buf)
            .await
            .map_err(|e| IngestError::io(path, e))?;
        if n == 0 {
            break;
        }
        if buf.iter().any(|b| !b.is_ascii_whitespace()) {
            rows += 1;
        }
    }
    Ok(rows)
}

fn stderr_tail(stderr: &str, stdout: &str) -> String {
    let text = if stderr.trim().is_empty() { stdout } else { stderr };
    let text = text.trim();
    let skip = text.chars().count().saturating_sub(STDERR_TAIL_CHARS);
    text.chars().skip(skip).collect()
}
