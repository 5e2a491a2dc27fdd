use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use crate::config::schema::IngestConfig;
use crate::error::ConfigError;

const SCHEMA_JSON: &str = include_str!("../../../../schema/config-v1.json");

pub const DEFAULT_ENV_PREFIX: &str = "FLEET_INGEST";

/// One layer of configuration. Later layers override earlier ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Defaults,
    JsonFile(PathBuf),
    /// `{PREFIX}__SECTION__KEY=value`, keys in SCREAMING_SNAKE_CASE.
    Environment { prefix: String },
}

impl ConfigSource {
    /// Defaults, then `path` if given, then the process environment.
    pub fn standard(path: Option<&Path>) -> Vec<ConfigSource> {
        let mut sources = vec![ConfigSource::Defaults];
        if let Some(path) = path {
            sources.push(ConfigSource::JsonFile(path.to_path_buf()));
        }
        sources.push(ConfigSource::Environment {
            prefix: DEFAULT_ENV_PREFIX.to_string(),
        });
        sources
    }
}

/// Resolves `sources` in order, then validates the merged result.
pub fn load_config(sources: &[ConfigSource]) -> Result<IngestConfig, ConfigError> {
    let mut merged = defaults_value()?;

    for source in sources {
        match source {
            ConfigSource::Defaults => {}
            ConfigSource::JsonFile(path) => {
                let content =
                    std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
                        path: path.to_path_buf(),
                        source: e,
                    })?;
                let overlay: Value = serde_json::from_str(&content)?;
                deep_merge(&mut merged, overlay);
                log::debug!("Merged config file {}", path.display());
            }
            ConfigSource::Environment { prefix } => {
                apply_env_overrides(&mut merged, prefix, std::env::vars())?;
            }
        }
    }

    finish(merged)
}

/// Parses `content` over the defaults, without environment overrides.
pub fn load_config_from_str(content: &str) -> Result<IngestConfig, ConfigError> {
    let mut merged = defaults_value()?;
    let overlay: Value = serde_json::from_str(content)?;
    deep_merge(&mut merged, overlay);
    finish(merged)
}

fn defaults_value() -> Result<Value, ConfigError> {
    Ok(serde_json::to_value(IngestConfig::default())?)
}

fn finish(merged: Value) -> Result<IngestConfig, ConfigError> {
    validate_schema(&merged)?;
    let config: IngestConfig = serde_json::from_value(merged)?;
    validate_config(&config)?;
    Ok(config)
}

/// Objects merge key by key; anything else replaces.
fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Applies every `{prefix}__A__B_C=value` pair as `a.bC = value`. The value
/// is coerced to the type already present at that path.
fn apply_env_overrides<I>(merged: &mut Value, prefix: &str, vars: I) -> Result<(), ConfigError>
where
    I: IntoIterator<Item = (String, String)>,
{
    let marker = format!("{}__", prefix);
    for (key, raw) in vars {
        let Some(rest) = key.strip_prefix(&marker) else {
            continue;
        };
        let segments: Vec<String> = rest
            .split("__")
            .filter(|s| !s.is_empty())
            .map(camel_case)
            .collect();
        if segments.is_empty() {
            return Err(ConfigError::InvalidOverride {
                key,
                reason: "no config path after prefix".to_string(),
            });
        }

        let (last, parents) = segments.split_last().ok_or_else(|| ConfigError::InvalidOverride {
            key: key.clone(),
            reason: "no config path after prefix".to_string(),
        })?;
        let mut node = &mut *merged;
        for segment in parents {
            let object = node.as_object_mut().ok_or_else(|| ConfigError::InvalidOverride {
                key: key.clone(),
                reason: format!("'{}' is not a section", segment),
            })?;
            node = object
                .entry(segment.clone())
                .or_insert_with(|| Value::Object(Map::new()));
        }
        let object = node.as_object_mut().ok_or_else(|| ConfigError::InvalidOverride {
            key: key.clone(),
            reason: "parent is not a section".to_string(),
        })?;

        let value = coerce(&raw, object.get(last)).map_err(|reason| ConfigError::InvalidOverride {
            key: key.clone(),
            reason,
        })?;
        log::debug!("Config override from environment: {}", key);
        object.insert(last.clone(), value);
    }
    Ok(())
}

fn coerce(raw: &str, existing: Option<&Value>) -> Result<Value, String> {
    match existing {
        Some(Value::String(_)) => Ok(Value::String(raw.to_string())),
        Some(Value::Bool(_)) => raw
            .parse::<bool>()
            .map(Value::Bool)
            .map_err(|_| format!("expected true or false, got '{}'", raw)),
        Some(Value::Number(_)) => serde_json::from_str::<serde_json::Number>(raw)
            .map(Value::Number)
            .map_err(|_| format!("expected a number, got '{}'", raw)),
        Some(Value::Array(_)) | Some(Value::Object(_)) => {
            serde_json::from_str(raw).map_err(|e| format!("expected JSON: {}", e))
        }
        Some(Value::Null) | None => Ok(serde_json::from_str(raw)
            .unwrap_or_else(|_| Value::String(raw.to_string()))),
    }
}

/// `CHUNK_SIZE_BYTES` -> `chunkSizeBytes`.
fn camel_case(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for (i, word) in segment.split('_').filter(|w| !w.is_empty()).enumerate() {
        let lower = word.to_ascii_lowercase();
        if i == 0 {
            out.push_str(&lower);
        } else {
            let mut chars = lower.chars();
            if let Some(first) = chars.next() {
                out.push(first.to_ascii_uppercase());
                out.push_str(chars.as_str());
            }
        }
    }
    out
}

fn validate_schema(json_value: &Value) -> Result<(), ConfigError> {
    let schema: Value = serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
        message: format!("Invalid embedded schema JSON: {}", e),
    })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let error_messages: Vec<String> = validator
        .iter_errors(json_value)
        .map(|e| e.to_string())
        .collect();
    if !error_messages.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: error_messages.join("; "),
        });
    }

    Ok(())
}

fn validate_config(config: &IngestConfig) -> Result<(), ConfigError> {
    let streaming = &config.streaming;
    if streaming.max_line_bytes > streaming.memory_ceiling_bytes as usize {
        return Err(invalid(format!(
            "streaming.maxLineBytes ({}) exceeds streaming.memoryCeilingBytes ({})",
            streaming.max_line_bytes, streaming.memory_ceiling_bytes
        )));
    }

    let retry = &config.resilience.retry;
    if retry.base_delay_ms > retry.max_delay_ms {
        return Err(invalid(format!(
            "resilience.retry.baseDelayMs ({}) exceeds maxDelayMs ({})",
            retry.base_delay_ms, retry.max_delay_ms
        )));
    }

    let decoder = &config.decoder;
    if decoder.program.trim().is_empty() {
        return Err(invalid("decoder.program must not be blank".to_string()));
    }
    if decoder.decoded_suffix.ends_with(".txt") {
        // Artifacts would be picked up by the scanner as raw files.
        return Err(invalid(format!(
            "decoder.decodedSuffix '{}' must not end in .txt",
            decoder.decoded_suffix
        )));
    }

    if config.locks.stale_processing_ms < config.pipeline.file_lock_ttl_ms {
        log::warn!(
            "locks.staleProcessingMs ({}) is shorter than pipeline.fileLockTtlMs ({}); \
             in-flight files may be taken over while still locked",
            config.locks.stale_processing_ms,
            config.pipeline.file_lock_ttl_ms
        );
    }

    Ok(())
}

fn invalid(message: String) -> ConfigError {
    ConfigError::Validation { message }
}
