use super::models::Config;
use config::{ConfigError, Environment, File};
use std::env;
use std::path::PathBuf;

const CONFIG_ENV_VAR: &str = "FARMHAND_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config/farmhand.toml";
const ENV_PREFIX: &str = "FARMHAND";
const ENV_SEPARATOR: &str = "__";

/// Load configuration from multiple sources with priority:
/// 1. Defaults (embedded in structs)
/// 2. TOML file (if exists)
/// 3. `FARMHAND__*` environment variables (incl. from `.env` via dotenvy)
/// 4. Flat operational variables (`STORE_REMOTE`, `WORKSPACE_ROOT`, ...)
pub fn load() -> Result<Config, ConfigError> {
    // Load .env file if it exists (ignore errors if file doesn't exist)
    let _ = dotenvy::dotenv();

    let config_path = env::var(CONFIG_ENV_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

    let mut config = load_from_sources(config_path)?;

    apply_flat_env(&mut config);
    load_secrets(&mut config);

    Ok(config)
}

/// Apply the flat environment variables recognized for operational
/// convenience on worker hosts, where a TOML file is usually absent.
/// These win over every other source.
fn apply_flat_env(config: &mut Config) {
    if let Ok(remote) = env::var("STORE_REMOTE") {
        // rclone-style `remote_name:bucket`; a bare value is just a bucket.
        match remote.split_once(':') {
            Some((name, bucket)) if !bucket.is_empty() => {
                config.store.remote = Some(name.to_string());
                config.store.bucket = bucket.to_string();
            }
            _ => config.store.bucket = remote.clone(),
        }
        config.store.provider = super::models::StoreProvider::S3;
    }

    if let Ok(root) = env::var("WORKSPACE_ROOT") {
        config.worker.workspace_root = PathBuf::from(root);
    }

    if let Ok(secs) = env::var("JOB_POLL_INTERVAL") {
        if let Ok(secs) = secs.parse() {
            config.worker.poll_interval_secs = secs;
            config.dispatcher.poll_interval_secs = secs;
        } else {
            tracing::warn!(value = %secs, "ignoring unparseable JOB_POLL_INTERVAL");
        }
    }

    if let Ok(secs) = env::var("JOB_TIMEOUT") {
        if let Ok(secs) = secs.parse() {
            config.worker.tool_timeout_secs = secs;
        } else {
            tracing::warn!(value = %secs, "ignoring unparseable JOB_TIMEOUT");
        }
    }

    if let Ok(path) = env::var("SSH_AGENT_QUEUE") {
        config.worker.ssh_agent_queue = Some(PathBuf::from(path));
    }

    if let Ok(value) = env::var("DEBUG_MODE") {
        config.debug = matches!(value.as_str(), "1" | "true" | "yes");
    }
}

/// Load secrets from environment variables into config.
/// Secrets are never stored in TOML files, only in environment.
fn load_secrets(config: &mut Config) {
    if let Ok(access_key) = env::var("S3_ACCESS_KEY") {
        config.store.access_key = Some(access_key);
    }
    if let Ok(secret_key) = env::var("S3_SECRET_KEY") {
        config.store.secret_key = Some(secret_key);
    }

    // Alternative: AWS-style environment variable names
    if config.store.access_key.is_none() {
        if let Ok(access_key) = env::var("AWS_ACCESS_KEY_ID") {
            config.store.access_key = Some(access_key);
        }
    }
    if config.store.secret_key.is_none() {
        if let Ok(secret_key) = env::var("AWS_SECRET_ACCESS_KEY") {
            config.store.secret_key = Some(secret_key);
        }
    }
}

/// Load configuration from a specific path and environment.
/// Useful for testing with custom config files.
pub fn load_from_sources(config_path: PathBuf) -> Result<Config, ConfigError> {
    let mut builder = config::Config::builder();

    if config_path.exists() {
        tracing::info!("Loading configuration from: {}", config_path.display());
        builder = builder.add_source(File::from(config_path).required(false));
    } else {
        tracing::debug!(
            "Configuration file not found at {}, using defaults and environment overrides",
            config_path.display()
        );
    }

    // FARMHAND__WORKER__TOOL_BIN -> worker.tool_bin
    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator(ENV_SEPARATOR)
            .try_parsing(true),
    );

    let config = builder.build()?;
    config.try_deserialize()
}
