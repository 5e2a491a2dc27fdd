//! Shared test utilities for fleet-ingest integration tests.
//!
//! This module provides:
//! - `TestHarness` for isolated runs over a temporary telemetry tree
//! - Builders for telemetry files and a scriptable fake CAN decoder

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::TestHarness;
