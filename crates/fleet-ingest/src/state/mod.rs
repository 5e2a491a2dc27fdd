//! File identity and the durable per-fingerprint state machine.

pub mod fingerprint;
pub mod record;
pub mod store;

pub use fingerprint::{compute_fingerprint, identify, identify_file, FileIdentity};
pub use record::{DecodeStatus, FileRecord, FileType, ParseEnumError, ProcessingStatus};
pub use store::{check_transition, Decision, DecisionReason, FileStateStore, ReprocessPolicy};
