pub mod loader;
pub mod schema;

pub use loader::{load_config, load_config_from_str, ConfigSource, DEFAULT_ENV_PREFIX};
pub use schema::{
    DatabaseConfig, IngestConfig, LockConfig, LogFormat, LoggingConfig, StorageConfig,
};
