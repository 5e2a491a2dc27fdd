//! Memory-bounded telemetry parsing.

pub mod memory;
pub mod parser;
pub mod processor;

pub use memory::{MemorySummary, MemoryWatch};
pub use parser::{
    DataPoint, DelimitedLineParser, LineParseError, LineParser, ParserRegistry, SharedParser,
};
pub use processor::{
    LineError, MultiFileOutcome, StreamingConfig, StreamingOutcome, StreamingProcessor,
};
