//! Process-wide tracing subscriber setup.
//!
//! Library code logs through both `log` macros and `tracing` spans; the
//! `LogTracer` bridge routes the former into the same subscriber.

use std::sync::OnceLock;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogFormat, LoggingConfig};
use crate::error::ConfigError;

static INSTALLED: OnceLock<()> = OnceLock::new();

/// Builds the filter: the explicit directive if set, else `RUST_LOG`, else
/// the configured level.
pub fn build_filter(config: &LoggingConfig) -> Result<EnvFilter, ConfigError> {
    if let Some(directive) = config.filter.as_deref() {
        return EnvFilter::try_new(directive).map_err(|e| ConfigError::Validation {
            message: format!("invalid logging.filter '{}': {}", directive, e),
        });
    }
    Ok(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level)))
}

/// Installs the global subscriber. Later calls are no-ops, as is a call made
/// after some other subscriber was installed.
pub fn init_logging(config: &LoggingConfig) -> Result<(), ConfigError> {
    if INSTALLED.get().is_some() {
        return Ok(());
    }
    let filter = build_filter(config)?;

    let installed = match config.format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false),
            )
            .try_init(),
    };

    // try_init also sets up the log bridge when tracing-log is enabled; a
    // failure means a subscriber already exists.
    if installed.is_err() {
        let _ = tracing_log::LogTracer::init();
    }
    let _ = INSTALLED.set(());

    tracing::debug!(format = ?config.format, level = %config.level, "Logging initialized");
    Ok(())
}
