//! Configuration module
//!
//! Settings are read from a config file, then overridden by `SHARDRUN_*`
//! environment variables, then by command-line flags.

mod env;
mod file;

pub use env::{print_env_help, EnvConfig};
pub use file::ConfigFile;
pub(crate) use env::{get_env, ENV_PREFIX};
pub(crate) use file::expand_path;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::gate::EngineKind;

/// Application configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub coordinator: CoordinatorConfig,
    pub dispatcher: DispatcherConfig,
    pub executor: ExecutorConfig,
    pub storage: StorageConfig,
    pub gate: GateConfig,
    pub watchdog: WatchdogConfig,
    pub retention: RetentionConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load from an explicit path or the first standard location, then apply
    /// environment overrides
    pub fn resolve(path: Option<&str>) -> Result<Self> {
        let env = EnvConfig::load();
        let explicit = path.map(str::to_string).or_else(|| env.config_file.clone());

        let file = match explicit {
            Some(path) => ConfigFile::load(file::expand_path(&path))?,
            None => ConfigFile::load_default()?,
        };

        let mut config = file.app;
        env.apply(&mut config);
        Ok(config)
    }
}

/// Default data directory
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("shardrun")
}

/// Coordinator service
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Listen address
    pub bind: String,

    /// Base URL other services use to reach the coordinator
    pub url: String,

    /// Directory holding run documents; unset keeps runs in memory
    pub data_dir: Option<String>,

    /// Catalog of projects, suites, environments and datasets
    pub catalog: Option<String>,

    /// Shared secret for internal endpoints
    pub internal_secret: Option<String>,

    /// Dispatcher base URL used by the trigger endpoint
    pub dispatcher_url: String,

    /// JSON-lines audit log; unset logs audit events through tracing
    pub audit_log: Option<String>,

    /// Timeout for calls to other services
    pub request_timeout_secs: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".to_string(),
            url: "http://127.0.0.1:8000".to_string(),
            data_dir: None,
            catalog: None,
            internal_secret: None,
            dispatcher_url: "http://127.0.0.1:8001".to_string(),
            audit_log: None,
            request_timeout_secs: 30,
        }
    }
}

/// Dispatcher service
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub bind: String,

    /// Queue directory; defaults to `<data dir>/queue`
    pub queue_dir: Option<String>,

    /// Executor base URL; unset disables shard dispatch
    pub executor_url: Option<String>,

    /// Maximum tasks processed at once
    pub max_concurrent: usize,

    pub max_attempts: u32,

    /// Base backoff between attempts in milliseconds
    pub backoff_ms: u64,

    /// Timeout of one executor call; must exceed the longest job
    pub executor_timeout_secs: u64,

    pub poll_interval_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8001".to_string(),
            queue_dir: None,
            executor_url: None,
            max_concurrent: 8,
            max_attempts: 3,
            backoff_ms: 500,
            executor_timeout_secs: 3900,
            poll_interval_secs: 5,
        }
    }
}

impl DispatcherConfig {
    pub fn queue_path(&self) -> PathBuf {
        self.queue_dir
            .as_deref()
            .map(file::expand_path)
            .unwrap_or_else(|| default_data_dir().join("queue"))
    }
}

/// Executor service
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub bind: String,

    /// Parent directory of per-job workspaces
    pub workspace_root: String,

    pub max_concurrent_jobs: usize,

    /// Hard timeout when the suite sets none
    pub default_timeout_secs: u64,

    /// Program spawned per job; defaults to this binary's `run-shard`
    pub command: Option<String>,

    /// Token for https repository access
    pub repo_token: Option<String>,

    /// Private key for ssh repository access
    pub ssh_key_path: Option<String>,

    /// Test runner executable
    pub runner: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8002".to_string(),
            workspace_root: std::env::temp_dir()
                .join("shardrun")
                .to_string_lossy()
                .into_owned(),
            max_concurrent_jobs: 2,
            default_timeout_secs: 3600,
            command: None,
            repo_token: None,
            ssh_key_path: None,
            runner: "pytest".to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Local,
    S3,
}

impl StorageBackend {
    pub fn parse(s: &str) -> Option<StorageBackend> {
        match s.to_lowercase().as_str() {
            "local" | "fs" => Some(StorageBackend::Local),
            "s3" | "minio" => Some(StorageBackend::S3),
            _ => None,
        }
    }
}

/// Artifact storage
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub bucket: String,

    /// Root of the local backend; defaults to `<data dir>/artifacts`
    pub local_dir: Option<String>,

    pub endpoint: Option<String>,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub force_path_style: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Local,
            bucket: "shardrun-artifacts".to_string(),
            local_dir: None,
            endpoint: None,
            region: None,
            access_key_id: None,
            secret_access_key: None,
            force_path_style: true,
        }
    }
}

impl StorageConfig {
    pub fn local_path(&self) -> PathBuf {
        self.local_dir
            .as_deref()
            .map(file::expand_path)
            .unwrap_or_else(|| default_data_dir().join("artifacts"))
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub engine: EngineKind,
}

/// Stalled run sweep
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Deadline for suites without a timeout
    pub default_deadline_secs: u64,
    /// Slack added to every deadline
    pub grace_secs: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            default_deadline_secs: 3600,
            grace_secs: 300,
        }
    }
}

/// Artifact retention sweep
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub enabled: bool,
    pub days: i64,
    pub interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            days: 30,
            interval_secs: 3600,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
