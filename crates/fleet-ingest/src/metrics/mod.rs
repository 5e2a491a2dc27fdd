//! The narrow metrics and health-check surface the pipeline reports through.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::error::{ErrorCategory, IngestError, Severity};

pub const CRITICAL_ERRORS_METRIC: &str = "ingest_critical_errors_total";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

pub type Labels = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub detail: String,
}

impl HealthStatus {
    pub fn healthy(detail: impl Into<String>) -> Self {
        Self {
            healthy: true,
            detail: detail.into(),
        }
    }

    pub fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            healthy: false,
            detail: detail.into(),
        }
    }
}

pub type HealthProbe = Arc<dyn Fn() -> HealthStatus + Send + Sync>;

/// Fire-and-forget sink. Implementations must not block or fail.
pub trait MetricsSink: Send + Sync {
    fn record_metric(&self, name: &str, value: f64, kind: MetricKind, labels: &Labels);

    fn register_health_check(&self, name: &str, probe: HealthProbe);
}

/// Builds a label map from string pairs.
pub fn labels<const N: usize>(pairs: [(&str, &str); N]) -> Labels {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Counts a failure under [`CRITICAL_ERRORS_METRIC`] when its severity is
/// critical.
pub fn report_critical(
    sink: &dyn MetricsSink,
    operation: &str,
    category: ErrorCategory,
    severity: Severity,
) {
    if severity != Severity::Critical {
        return;
    }
    sink.record_metric(
        CRITICAL_ERRORS_METRIC,
        1.0,
        MetricKind::Counter,
        &labels([("operation", operation), ("category", category.as_str())]),
    );
}

pub fn report_error(sink: &dyn MetricsSink, operation: &str, error: &IngestError) {
    report_critical(sink, operation, error.category(), error.severity());
}

/// Discards everything.
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_metric(&self, _name: &str, _value: f64, _kind: MetricKind, _labels: &Labels) {}

    fn register_health_check(&self, _name: &str, _probe: HealthProbe) {}
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSample {
    pub name: String,
    pub value: f64,
    pub kind: MetricKind,
    pub labels: Labels,
}

/// Keeps samples and probes in memory, for tests and embedding.
#[derive(Default)]
pub struct InMemoryMetrics {
    samples: Mutex<Vec<MetricSample>>,
    probes: Mutex<BTreeMap<String, HealthProbe>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn samples(&self) -> Vec<MetricSample> {
        self.samples.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Sum of every sample recorded under `name`.
    pub fn total(&self, name: &str) -> f64 {
        self.samples
            .lock()
            .map(|s| s.iter().filter(|m| m.name == name).map(|m| m.value).sum())
            .unwrap_or(0.0)
    }

    pub fn health_check_names(&self) -> Vec<String> {
        self.probes
            .lock()
            .map(|p| p.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Runs every registered probe.
    pub fn run_health_checks(&self) -> BTreeMap<String, HealthStatus> {
        // Clone the probes out so a probe can't deadlock by registering another.
        let probes: Vec<(String, HealthProbe)> = match self.probes.lock() {
            Ok(p) => p.iter().map(|(k, v)| (k.clone(), Arc::clone(v))).collect(),
            Err(_) => return BTreeMap::new(),
        };
        probes
            .into_iter()
            .map(|(name, probe)| (name, probe()))
            .collect()
    }
}

impl MetricsSink for InMemoryMetrics {
    fn record_metric(&self, name: &str, value: f64, kind: MetricKind, labels: &Labels) {
        if let Ok(mut samples) = self.samples.lock() {
            samples.push(MetricSample {
                name: name.to_string(),
                value,
                kind,
                labels: labels.clone(),
            });
        }
    }

    fn register_health_check(&self, name: &str, probe: HealthProbe) {
        if let Ok(mut probes) = self.probes.lock() {
            probes.insert(name.to_string(), probe);
        }
    }
}
