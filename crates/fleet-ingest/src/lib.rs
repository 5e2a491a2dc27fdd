#[macro_use]
mod macros;

pub mod config;
pub mod db;
pub mod decoder;
pub mod error;
pub mod locks;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod resilience;
pub mod service;
pub mod state;
pub mod streaming;

pub use config::{load_config, ConfigSource, IngestConfig};
pub use db::{Database, DatabaseError};
pub use decoder::{CanDecoder, DecodeOutcome, DecoderBackend, SubprocessDecoder};
pub use error::{ConfigError, ErrorCategory, IngestError, Result, Severity};
pub use locks::{LockManager, ResourceType};
pub use logging::init_logging;
pub use metrics::{InMemoryMetrics, MetricsSink, NoopMetrics};
pub use pipeline::{
    IngestPipeline, OrganizationRequest, OrganizationResult, ProcessOptions, VehicleRequest,
    VehicleResult,
};
pub use resilience::ResilienceController;
pub use service::IngestService;
pub use state::{FileRecord, FileStateStore, FileType, ProcessingStatus};
pub use streaming::{DataPoint, LineParser, StreamingProcessor};
