//! Line parsers turning telemetry text into [`DataPoint`]s.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::FileType;

/// A parse failure on one line. Carries only the message; the processor
/// attaches the line number.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct LineParseError(pub String);

impl From<&str> for LineParseError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

impl From<String> for LineParseError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

/// One parsed telemetry sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataPoint {
    pub line_number: u64,
    pub recorded_at: Option<String>,
    pub fields: serde_json::Map<String, serde_json::Value>,
}

/// Parses a single line. `Ok(None)` means the line carries no item
/// (blank, comment, header).
pub trait LineParser: Send + Sync {
    type Item: Send;

    fn parse_line(
        &self,
        line: &str,
        line_number: u64,
    ) -> Result<Option<Self::Item>, LineParseError>;
}

impl<F, T> LineParser for F
where
    F: Fn(&str, u64) -> Result<Option<T>, LineParseError> + Send + Sync,
    T: Send,
{
    type Item = T;

    fn parse_line(&self, line: &str, line_number: u64) -> Result<Option<T>, LineParseError> {
        self(line, line_number)
    }
}

const CANDIDATE_DELIMITERS: [char; 3] = [';', ',', '\t'];

/// Generic delimited-text parser used when no type-specific parser is
/// registered. Numbers are coerced, everything else is kept as text.
#[derive(Debug, Clone, Default)]
pub struct DelimitedLineParser {
    delimiter: Option<char>,
    column_names: Vec<String>,
}

impl DelimitedLineParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fixes the delimiter instead of detecting it per line.
    pub fn with_delimiter(mut self, delimiter: char) -> Self {
        self.delimiter = Some(delimiter);
        self
    }

    pub fn with_columns<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.column_names = names.into_iter().map(Into::into).collect();
        self
    }

    fn detect_delimiter(&self, line: &str) -> Option<char> {
        if let Some(d) = self.delimiter {
            return line.contains(d).then_some(d);
        }
        CANDIDATE_DELIMITERS
            .iter()
            .map(|d| (*d, line.matches(*d).count()))
            .filter(|(_, count)| *count > 0)
            .max_by_key(|(_, count)| *count)
            .map(|(d, _)| d)
    }

    fn column_name(&self, index: usize) -> String {
        self.column_names
            .get(index)
            .cloned()
            .unwrap_or_else(|| format!("field_{}", index))
    }
}

fn coerce(token: &str) -> serde_json::Value {
    if let Ok(int) = token.parse::<i64>() {
        return serde_json::Value::from(int);
    }
    if let Ok(float) = token.parse::<f64>() {
        if let Some(number) = serde_json::Number::from_f64(float) {
            return serde_json::Value::Number(number);
        }
    }
    serde_json::Value::String(token.to_string())
}

fn is_numeric(token: &str) -> bool {
    token.parse::<f64>().is_ok()
}

fn looks_like_timestamp(token: &str) -> bool {
    !is_numeric(token)
        && token.chars().any(|c| c.is_ascii_digit())
        && (token.contains(':') || token.contains('-') || token.contains('/'))
}

impl LineParser for DelimitedLineParser {
    type Item = DataPoint;

    fn parse_line(&self, line: &str, line_number: u64) -> Result<Option<DataPoint>, LineParseError> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }

        let delimiter = self
            .detect_delimiter(line)
            .ok_or_else(|| LineParseError::from("no field delimiter found"))?;
        let tokens: Vec<&str> = line.split(delimiter).map(str::trim).collect();

        if line_number == 1 && !tokens.iter().any(|t| is_numeric(t)) {
            return Ok(None);
        }
        if tokens.iter().all(|t| t.is_empty()) {
            return Err("line contains only delimiters".into());
        }

        let recorded_at = tokens
            .first()
            .filter(|t| looks_like_timestamp(t))
            .map(|t| t.to_string());

        let fields = tokens
            .iter()
            .enumerate()
            .map(|(i, token)| (self.column_name(i), coerce(token)))
            .collect();

        Ok(Some(DataPoint {
            line_number,
            recorded_at,
            fields,
        }))
    }
}

pub type SharedParser = Arc<dyn LineParser<Item = DataPoint>>;

/// Maps each file type to its parser, falling back to [`DelimitedLineParser`].
#[derive(Clone)]
pub struct ParserRegistry {
    parsers: HashMap<FileType, SharedParser>,
    fallback: SharedParser,
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self {
            parsers: HashMap::new(),
            fallback: Arc::new(DelimitedLineParser::new()),
        }
    }
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, file_type: FileType, parser: SharedParser) -> &mut Self {
        self.parsers.insert(file_type, parser);
        self
    }

    pub fn with(mut self, file_type: FileType, parser: SharedParser) -> Self {
        self.register(file_type, parser);
        self
    }

    pub fn get(&self, file_type: FileType) -> SharedParser {
        self.parsers
            .get(&file_type)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.fallback))
    }
}
