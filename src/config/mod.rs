//! Configuration management for farmhand
//!
//! Layered configuration, highest priority last:
//! 1. Default values (embedded in structs)
//! 2. TOML configuration file
//! 3. Environment variables (`FARMHAND__<section>__<key>`)
//! 4. Flat operational variables (`STORE_REMOTE`, `WORKSPACE_ROOT`,
//!    `JOB_POLL_INTERVAL`, `JOB_TIMEOUT`, `SSH_AGENT_QUEUE`, `DEBUG_MODE`)
//!
//! The config file defaults to `config/farmhand.toml` and can be
//! relocated with `FARMHAND_CONFIG`. Store credentials are read only from
//! the environment (`S3_ACCESS_KEY`/`S3_SECRET_KEY` or the AWS names) and
//! are never logged or serialized.

mod models;
mod sources;
mod validation;

pub use models::{Config, DispatcherConfig, ServerConfig, StoreConfig, StoreProvider, WorkerConfig};
pub use validation::ValidationError;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),

    #[error("Configuration validation failed: {0}")]
    ValidationError(#[from] ValidationError),
}

impl Config {
    /// Load configuration from all sources (file + environment).
    pub fn load() -> Result<Self, ConfigError> {
        let config = sources::load()?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific path.
    ///
    /// Useful for testing with custom configuration files.
    pub fn load_from_path(path: std::path::PathBuf) -> Result<Self, ConfigError> {
        let config = sources::load_from_sources(path)?;
        validation::validate(&config)?;
        Ok(config)
    }
}
