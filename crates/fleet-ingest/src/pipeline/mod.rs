//! Per-vehicle orchestration: scan, decide, lock, decode, parse, persist.

pub mod config;
pub mod context;
pub mod error;
pub mod result;
pub mod runner;
pub mod scanner;

pub use config::{PipelineConfig, ProcessOptions};
pub use context::{OrganizationRequest, VehicleRequest};
pub use error::{FileError, Stage};
pub use result::{FileOutcome, FileReport, OrganizationResult, VehicleResult};
pub use runner::{Components, IngestPipeline};
pub use scanner::{ScannedFile, VehicleScanner};
