use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub server: ServerConfig,
    /// Verbose logging; also disables the tool execution timeout.
    #[serde(default)]
    pub debug: bool,
}

/// Object store provider type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreProvider {
    S3,
    #[default]
    Local,
    Memory,
}

/// Object store configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub provider: StoreProvider,
    /// Bucket name for `s3`, root directory for `local`.
    #[serde(default = "default_bucket")]
    pub bucket: String,
    pub endpoint: Option<String>,
    pub region: Option<String>,
    /// Named remote from `STORE_REMOTE` (e.g. `r2_name:bucket`), kept for
    /// operator-facing log lines.
    pub remote: Option<String>,
    /// Access key (loaded from environment, never from config files)
    #[serde(skip)]
    pub access_key: Option<String>,
    /// Secret key (loaded from environment, never from config files)
    #[serde(skip)]
    pub secret_key: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            provider: StoreProvider::default(),
            bucket: default_bucket(),
            endpoint: None,
            region: None,
            remote: None,
            access_key: None,
            secret_key: None,
        }
    }
}

fn default_bucket() -> String {
    "data/store".to_string()
}

/// Workstation-side dispatcher configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DispatcherConfig {
    /// Local job record directory; records land in `<data_dir>/jobs/`.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Local script tree mirrored to `scripts/` on every submit.
    #[serde(default = "default_scripts_dir")]
    pub scripts_dir: PathBuf,
    /// Default destination for downloaded results.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Poll interval for `wait` and the download settle check, seconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Default `wait` timeout, seconds.
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            scripts_dir: default_scripts_dir(),
            output_dir: default_output_dir(),
            poll_interval_secs: default_poll_interval(),
            wait_timeout_secs: default_wait_timeout(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_scripts_dir() -> PathBuf {
    PathBuf::from("scripts")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

fn default_poll_interval() -> u64 {
    30
}

fn default_wait_timeout() -> u64 {
    3600
}

/// GPU-host worker configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerConfig {
    /// Workspace root; `assets/` and `scripts/` under it survive across
    /// jobs as caches.
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,
    /// Pending-prefix poll interval, seconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Tool execution timeout, seconds. Ignored in debug mode.
    #[serde(default = "default_tool_timeout")]
    pub tool_timeout_secs: u64,
    /// Render tool binary invoked per job.
    #[serde(default = "default_tool_bin")]
    pub tool_bin: String,
    /// Sleep a random fraction of the poll interval before claiming.
    /// Off by default; single-worker deployments have no claim race.
    #[serde(default)]
    pub claim_jitter: bool,
    /// Optional out-of-band setup messaging path; the worker appends a
    /// ready line here at startup.
    pub ssh_agent_queue: Option<PathBuf>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workspace_root: default_workspace_root(),
            poll_interval_secs: default_poll_interval(),
            tool_timeout_secs: default_tool_timeout(),
            tool_bin: default_tool_bin(),
            claim_jitter: false,
            ssh_agent_queue: None,
        }
    }
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from("/workspace")
}

fn default_tool_timeout() -> u64 {
    3600
}

fn default_tool_bin() -> String {
    "render-tool".to_string()
}

/// HTTP API server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}
