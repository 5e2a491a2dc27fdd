//! Chunked, memory-bounded line processing.
//!
//! A file is read in fixed-size chunks. Complete lines go through the parser,
//! a partial last line is carried into the next chunk, and parsed items are
//! held for `buffer_chunks` chunks before being handed to the sink in one
//! batch. What the processor holds at any moment is therefore bounded by the
//! chunk size, the window depth and `max_line_bytes`, not by the file size.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use super::memory::MemoryWatch;
use super::parser::LineParser;
use crate::error::{IngestError, Result};

/// Tuning knobs for [`StreamingProcessor`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StreamingConfig {
    pub chunk_size_bytes: usize,
    /// Chunks whose items are buffered before one sink call.
    pub buffer_chunks: usize,
    /// Longest accepted line. Longer lines are recorded as errors and dropped.
    pub max_line_bytes: usize,
    pub memory_ceiling_bytes: u64,
    pub memory_sample_interval_ms: u64,
    /// Line errors kept verbatim; the total is always counted.
    pub max_recorded_errors: usize,
    /// Pool size for [`StreamingProcessor::process_many`].
    pub max_concurrent_files: usize,
    /// Files smaller than this are parsed in one read.
    pub streaming_threshold_bytes: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            chunk_size_bytes: 64 * 1024,
            buffer_chunks: 10,
            max_line_bytes: 1024 * 1024,
            memory_ceiling_bytes: 512 * 1024 * 1024,
            memory_sample_interval_ms: 1_000,
            max_recorded_errors: 1_000,
            max_concurrent_files: 3,
            streaming_threshold_bytes: 10 * 1024 * 1024,
        }
    }
}

impl StreamingConfig {
    /// Halves the chunk size and the window depth.
    pub fn low_memory(&self) -> Self {
        Self {
            chunk_size_bytes: (self.chunk_size_bytes / 2).max(1),
            buffer_chunks: (self.buffer_chunks / 2).max(1),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LineError {
    pub line_number: u64,
    pub message: String,
}

/// What one streaming run observed.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingOutcome {
    pub items_produced: u64,
    pub lines_read: u64,
    pub bytes_read: u64,
    pub errors: Vec<LineError>,
    pub error_count: u64,
    pub peak_memory_bytes: u64,
    pub peak_buffered_bytes: u64,
    pub memory_ceiling_exceeded: bool,
    pub elapsed_ms: u64,
}

/// Per-file results of [`StreamingProcessor::process_many`].
#[derive(Debug, Default)]
pub struct MultiFileOutcome {
    pub results: Vec<(PathBuf, Result<StreamingOutcome>)>,
    pub total_items: u64,
    pub total_line_errors: u64,
    pub failed_files: usize,
}

/// Parse state shared by the chunked and whole-file paths.
struct LineCollector<'a, P: LineParser + ?Sized> {
    parser: &'a P,
    max_recorded_errors: usize,
    window: Vec<P::Item>,
    window_bytes: usize,
    line_number: u64,
    outcome: StreamingOutcome,
}

impl<'a, P: LineParser + ?Sized> LineCollector<'a, P> {
    fn new(parser: &'a P, max_recorded_errors: usize) -> Self {
        Self {
            parser,
            max_recorded_errors,
            window: Vec::new(),
            window_bytes: 0,
            line_number: 0,
            outcome: StreamingOutcome::default(),
        }
    }

    fn record_error(&mut self, line_number: u64, message: String) {
        self.outcome.error_count += 1;
        if self.outcome.errors.len() < self.max_recorded_errors {
            self.outcome.errors.push(LineError {
                line_number,
                message,
            });
        }
    }

    fn next_line_number(&mut self) -> u64 {
        self.line_number += 1;
        self.outcome.lines_read += 1;
        self.line_number
    }

    fn handle_line(&mut self, raw: &[u8]) {
        let line_number = self.next_line_number();
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        if raw.iter().all(u8::is_ascii_whitespace) {
            return;
        }

        let text = String::from_utf8_lossy(raw);
        match self.parser.parse_line(&text, line_number) {
            Ok(Some(item)) => {
                self.window.push(item);
                self.window_bytes += raw.len();
                self.outcome.items_produced += 1;
            }
            Ok(None) => {}
            Err(e) => self.record_error(line_number, e.0),
        }
    }

    fn note_buffered(&mut self, extra: usize) {
        let held = (self.window_bytes + extra) as u64;
        self.outcome.peak_buffered_bytes = self.outcome.peak_buffered_bytes.max(held);
    }

    fn flush<S>(&mut self, sink: &mut S) -> Result<()>
    where
        S: FnMut(Vec<P::Item>) -> Result<()>,
    {
        if self.window.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.window);
        self.window_bytes = 0;
        sink(batch)
    }

    fn finish(mut self, path: &Path, started: Instant) -> Result<StreamingOutcome> {
        self.outcome.elapsed_ms = started.elapsed().as_millis() as u64;
        if self.outcome.items_produced == 0 && self.outcome.error_count > 0 {
            let first = self
                .outcome
                .errors
                .first()
                .map(|e| format!(" (line {}: {})", e.line_number, e.message))
                .unwrap_or_default();
            return Err(IngestError::Processing(format!(
                "no items parsed from {}: {} line error(s){}",
                path.display(),
                self.outcome.error_count,
                first
            )));
        }
        Ok(self.outcome)
    }
}

#[derive(Debug, Clone, Default)]
pub struct StreamingProcessor {
    config: StreamingConfig,
}

impl StreamingProcessor {
    pub fn new(config: StreamingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    /// Same processor with halved chunk size and window depth.
    pub fn low_memory(&self) -> Self {
        Self::new(self.config.low_memory())
    }

    /// Streams `path` through `parser`, handing batches of items to `sink`.
    ///
    /// Line errors are collected, not raised. The call fails when nothing
    /// was parsed but at least one line errored, on I/O failure, on sink
    /// failure, and on cancellation (checked between chunks).
    pub async fn process<P, S>(
        &self,
        path: &Path,
        parser: &P,
        mut sink: S,
        cancel: &CancellationToken,
    ) -> Result<StreamingOutcome>
    where
        P: LineParser + ?Sized,
        S: FnMut(Vec<P::Item>) -> Result<()> + Send,
    {
        let started = Instant::now();
        let watch = self.start_watch(path, cancel);
        let result = self.stream_chunks(path, parser, &mut sink, cancel, started).await;
        let memory = watch.finish().await;

        result.map(|mut outcome| {
            outcome.peak_memory_bytes = memory.peak_bytes;
            outcome.memory_ceiling_exceeded = memory.ceiling_exceeded;
            log::debug!(
                "Streamed {}: {} items, {} line errors, {} bytes in {}ms",
                path.display(),
                outcome.items_produced,
                outcome.error_count,
                outcome.bytes_read,
                outcome.elapsed_ms
            );
            outcome
        })
    }

    async fn stream_chunks<P, S>(
        &self,
        path: &Path,
        parser: &P,
        sink: &mut S,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<StreamingOutcome>
    where
        P: LineParser + ?Sized,
        S: FnMut(Vec<P::Item>) -> Result<()> + Send,
    {
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| IngestError::io(path, e))?;

        let chunk_size = self.config.chunk_size_bytes.max(1);
        let buffer_chunks = self.config.buffer_chunks.max(1);
        let max_line = self.config.max_line_bytes.max(1);

        let mut collector = LineCollector::new(parser, self.config.max_recorded_errors);
        let mut buf = vec![0u8; chunk_size];
        let mut carry: Vec<u8> = Vec::new();
        // Set while skipping the rest of an overlong line.
        let mut discarding = false;
        let mut chunks_in_window = 0usize;

        loop {
            if cancel.is_cancelled() {
                return Err(IngestError::Cancelled(format!(
                    "streaming {} cancelled",
                    path.display()
                )));
            }

            let n = file
                .read(&mut buf)
                .await
                .map_err(|e| IngestError::io(path, e))?;
            if n == 0 {
                break;
            }
            collector.outcome.bytes_read += n as u64;
            collector.note_buffered(carry.len() + n);

            let chunk = &buf[..n];
            let mut start = 0;
            while let Some(offset) = chunk[start..].iter().position(|b| *b == b'\n') {
                let end = start + offset;
                let segment = &chunk[start..end];
                start = end + 1;

                if discarding {
                    discarding = false;
                    continue;
                }
                if carry.is_empty() {
                    if segment.len() > max_line {
                        let line_number = collector.next_line_number();
                        collector.record_error(line_number, overlong(max_line));
                    } else {
                        collector.handle_line(segment);
                    }
                } else {
                    carry.extend_from_slice(segment);
                    if carry.len() > max_line {
                        let line_number = collector.next_line_number();
                        collector.record_error(line_number, overlong(max_line));
                    } else {
                        collector.handle_line(&carry);
                    }
                    carry.clear();
                }
            }

            if !discarding {
                carry.extend_from_slice(&chunk[start..]);
                if carry.len() > max_line {
                    let line_number = collector.next_line_number();
                    collector.record_error(line_number, overlong(max_line));
                    carry.clear();
                    discarding = true;
                }
            }

            chunks_in_window += 1;
            if chunks_in_window >= buffer_chunks {
                collector.flush(&mut *sink)?;
                chunks_in_window = 0;
            }
            tokio::task::yield_now().await;
        }

        if !carry.is_empty() && !discarding {
            collector.handle_line(&carry);
        }
        collector.flush(&mut *sink)?;
        collector.finish(path, started)
    }

    /// Reads the whole file and parses it in one pass. Same error semantics
    /// as [`StreamingProcessor::process`], for files below the streaming
    /// threshold.
    pub async fn parse_whole<P, S>(
        &self,
        path: &Path,
        parser: &P,
        mut sink: S,
        cancel: &CancellationToken,
    ) -> Result<StreamingOutcome>
    where
        P: LineParser + ?Sized,
        S: FnMut(Vec<P::Item>) -> Result<()> + Send,
    {
        let started = Instant::now();
        let watch = self.start_watch(path, cancel);

        let result = async {
            let content = tokio::fs::read(path)
                .await
                .map_err(|e| IngestError::io(path, e))?;
            if cancel.is_cancelled() {
                return Err(IngestError::Cancelled(format!(
                    "parsing {} cancelled",
                    path.display()
                )));
            }

            let mut collector = LineCollector::new(parser, self.config.max_recorded_errors);
            collector.outcome.bytes_read = content.len() as u64;
            collector.note_buffered(content.len());

            let mut lines = content.split(|b| *b == b'\n').peekable();
            while let Some(line) = lines.next() {
                // A trailing newline leaves one empty segment that is not a line.
                if line.is_empty() && lines.peek().is_none() {
                    break;
                }
                collector.handle_line(line);
            }
            collector.flush(&mut sink)?;
            collector.finish(path, started)
        }
        .await;

        let memory = watch.finish().await;
        result.map(|mut outcome| {
            outcome.peak_memory_bytes = memory.peak_bytes;
            outcome.memory_ceiling_exceeded = memory.ceiling_exceeded;
            outcome
        })
    }

    /// Picks [`StreamingProcessor::parse_whole`] for small files and
    /// [`StreamingProcessor::process`] otherwise.
    pub async fn process_auto<P, S>(
        &self,
        path: &Path,
        parser: &P,
        sink: S,
        cancel: &CancellationToken,
    ) -> Result<StreamingOutcome>
    where
        P: LineParser + ?Sized,
        S: FnMut(Vec<P::Item>) -> Result<()> + Send,
    {
        let size = tokio::fs::metadata(path)
            .await
            .map_err(|e| IngestError::io(path, e))?
            .len();
        if size < self.config.streaming_threshold_bytes {
            self.parse_whole(path, parser, sink, cancel).await
        } else {
            self.process(path, parser, sink, cancel).await
        }
    }

    /// Streams several files over a pool of `max_concurrent_files`. One
    /// file's failure never affects the others.
    pub async fn process_many<P, S, F>(
        &self,
        paths: Vec<PathBuf>,
        parser: &P,
        make_sink: F,
        cancel: &CancellationToken,
    ) -> MultiFileOutcome
    where
        P: LineParser + ?Sized,
        S: FnMut(Vec<P::Item>) -> Result<()> + Send,
        F: Fn(&Path) -> S,
    {
        let pool = self.config.max_concurrent_files.max(1);
        let results: Vec<(PathBuf, Result<StreamingOutcome>)> = stream::iter(paths)
            .map(|path| {
                let sink = make_sink(&path);
                async move {
                    let result = self.process(&path, parser, sink, cancel).await;
                    (path, result)
                }
            })
            .buffer_unordered(pool)
            .collect()
            .await;

        let mut outcome = MultiFileOutcome::default();
        for (_, result) in &results {
            match result {
                Ok(o) => {
                    outcome.total_items += o.items_produced;
                    outcome.total_line_errors += o.error_count;
                }
                Err(_) => outcome.failed_files += 1,
            }
        }
        outcome.results = results;
        outcome
    }

    fn start_watch(&self, path: &Path, cancel: &CancellationToken) -> MemoryWatch {
        MemoryWatch::start(
            path.display().to_string(),
            self.config.memory_ceiling_bytes,
            Duration::from_millis(self.config.memory_sample_interval_ms.max(1)),
            cancel,
        )
    }
}

fn overlong(max_line: usize) -> String {
    format!("line exceeds {} bytes", max_line)
}
