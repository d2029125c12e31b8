//! Config file discovery, loading and validation
//!
//! YAML or JSON is chosen by extension; service sections sit at the top level.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{AppConfig, StorageBackend};

/// Searched in order when no path is given
const CONFIG_LOCATIONS: &[&str] = &[
    "./shardrun.yaml",
    "./shardrun.yml",
    "./.shardrun/config.yaml",
    "~/.config/shardrun/config.yaml",
];

/// On-disk form of [`AppConfig`]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default = "default_version")]
    pub version: String,

    #[serde(flatten)]
    pub app: AppConfig,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            version: default_version(),
            app: AppConfig::default(),
        }
    }
}

impl ConfigFile {
    /// First existing standard location
    pub fn find() -> Option<PathBuf> {
        CONFIG_LOCATIONS
            .iter()
            .map(|location| expand_path(location))
            .find(|path| path.exists())
    }

    /// Load the first standard location, or defaults when none exists
    pub fn load_default() -> Result<Self> {
        match Self::find() {
            Some(path) => Self::load(&path),
            None => {
                debug!("No config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load and validate `path`
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = if is_yaml_file(path) {
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse YAML config: {}", path.display()))?
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON config: {}", path.display()))?
        };

        config.validate()?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = if is_yaml_file(path) {
            serde_yaml::to_string(self).context("Failed to serialize config")?
        } else {
            serde_json::to_string_pretty(self).context("Failed to serialize config")?
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Reject settings the services cannot run with
    pub fn validate(&self) -> Result<()> {
        if !["1.0"].contains(&self.version.as_str()) {
            anyhow::bail!("Unsupported config version: {}", self.version);
        }

        let app = &self.app;
        if app.dispatcher.max_attempts == 0 {
            anyhow::bail!("dispatcher.max_attempts must be at least 1");
        }
        if app.dispatcher.max_concurrent == 0 || app.executor.max_concurrent_jobs == 0 {
            anyhow::bail!("Concurrency limits must be at least 1");
        }
        if app.executor.default_timeout_secs == 0 {
            anyhow::bail!("executor.default_timeout_secs must be positive");
        }
        if app.dispatcher.executor_timeout_secs <= app.executor.default_timeout_secs {
            anyhow::bail!(
                "dispatcher.executor_timeout_secs ({}) must exceed executor.default_timeout_secs ({})",
                app.dispatcher.executor_timeout_secs,
                app.executor.default_timeout_secs
            );
        }
        if app.retention.days < 1 {
            anyhow::bail!("retention.days must be at least 1");
        }
        if app.storage.backend == StorageBackend::S3 && app.storage.bucket.is_empty() {
            anyhow::bail!("storage.bucket is required for the s3 backend");
        }

        Ok(())
    }

    /// Settings written by `config init`
    pub fn example() -> Self {
        let mut app = AppConfig::default();
        app.coordinator.data_dir = Some("~/.local/share/shardrun".to_string());
        app.coordinator.catalog = Some("./catalog.yaml".to_string());
        app.coordinator.internal_secret = Some("change-me".to_string());
        app.dispatcher.executor_url = Some("http://127.0.0.1:8002".to_string());
        app.storage.backend = StorageBackend::S3;
        app.storage.endpoint = Some("http://127.0.0.1:9000".to_string());
        app.storage.region = Some("us-east-1".to_string());

        Self {
            version: default_version(),
            app,
        }
    }
}

/// Expand a leading `~/`
pub(crate) fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

fn is_yaml_file(path: &Path) -> bool {
    path.extension()
        .map(|e| e == "yaml" || e == "yml")
        .unwrap_or(false)
}
