//! Environment variable configuration
//!
//! Provides `SHARDRUN_*` overrides for configuration.

use std::env;

use super::{AppConfig, StorageBackend};
use crate::gate::EngineKind;

/// Environment variable prefix
pub(crate) const ENV_PREFIX: &str = "SHARDRUN";

/// Configuration overrides read from environment variables
#[derive(Clone, Debug, Default)]
pub struct EnvConfig {
    /// Config file from SHARDRUN_CONFIG
    pub config_file: Option<String>,
    /// Log level from SHARDRUN_LOG_LEVEL
    pub log_level: Option<String>,
    /// Data directory from SHARDRUN_DATA_DIR
    pub data_dir: Option<String>,
    /// Catalog path from SHARDRUN_CATALOG
    pub catalog: Option<String>,
    /// Shared secret from SHARDRUN_INTERNAL_SECRET
    pub internal_secret: Option<String>,
    /// Coordinator URL from SHARDRUN_COORDINATOR_URL
    pub coordinator_url: Option<String>,
    /// Dispatcher URL from SHARDRUN_DISPATCHER_URL
    pub dispatcher_url: Option<String>,
    /// Executor URL from SHARDRUN_EXECUTOR_URL
    pub executor_url: Option<String>,
    /// Queue directory from SHARDRUN_QUEUE_DIR
    pub queue_dir: Option<String>,
    /// Workspace root from SHARDRUN_WORKSPACE_ROOT
    pub workspace_root: Option<String>,
    /// Executor parallelism from SHARDRUN_MAX_CONCURRENT_JOBS
    pub max_concurrent_jobs: Option<usize>,
    /// Executor timeout from SHARDRUN_JOB_TIMEOUT
    pub job_timeout: Option<u64>,
    /// Repository token from SHARDRUN_REPO_TOKEN
    pub repo_token: Option<String>,
    /// SSH key from SHARDRUN_SSH_KEY_PATH
    pub ssh_key_path: Option<String>,
    /// Gate engine from SHARDRUN_GATE_ENGINE
    pub gate_engine: Option<EngineKind>,
    /// Storage backend from SHARDRUN_STORAGE_BACKEND
    pub storage_backend: Option<StorageBackend>,
    /// Local artifact root from SHARDRUN_ARTIFACT_DIR
    pub artifact_dir: Option<String>,
    /// S3 endpoint from SHARDRUN_S3_ENDPOINT
    pub s3_endpoint: Option<String>,
    /// S3 bucket from SHARDRUN_S3_BUCKET
    pub s3_bucket: Option<String>,
    /// S3 region from SHARDRUN_S3_REGION
    pub s3_region: Option<String>,
    /// S3 key id from SHARDRUN_S3_ACCESS_KEY_ID
    pub s3_access_key_id: Option<String>,
    /// S3 secret from SHARDRUN_S3_SECRET_ACCESS_KEY
    pub s3_secret_access_key: Option<String>,
    /// Watchdog toggle from SHARDRUN_WATCHDOG
    pub watchdog: Option<bool>,
    /// Retention days from SHARDRUN_RETENTION_DAYS
    pub retention_days: Option<i64>,
}

impl EnvConfig {
    /// Load configuration from environment variables
    pub fn load() -> Self {
        Self {
            config_file: get_env("CONFIG"),
            log_level: get_env("LOG_LEVEL"),
            data_dir: get_env("DATA_DIR"),
            catalog: get_env("CATALOG"),
            internal_secret: get_env("INTERNAL_SECRET"),
            coordinator_url: get_env("COORDINATOR_URL"),
            dispatcher_url: get_env("DISPATCHER_URL"),
            executor_url: get_env("EXECUTOR_URL"),
            queue_dir: get_env("QUEUE_DIR"),
            workspace_root: get_env("WORKSPACE_ROOT"),
            max_concurrent_jobs: get_env_parse("MAX_CONCURRENT_JOBS"),
            job_timeout: get_env_parse("JOB_TIMEOUT"),
            repo_token: get_env("REPO_TOKEN"),
            ssh_key_path: get_env("SSH_KEY_PATH"),
            gate_engine: get_env("GATE_ENGINE").and_then(|v| EngineKind::parse(&v)),
            storage_backend: get_env("STORAGE_BACKEND").and_then(|v| StorageBackend::parse(&v)),
            artifact_dir: get_env("ARTIFACT_DIR"),
            s3_endpoint: get_env("S3_ENDPOINT"),
            s3_bucket: get_env("S3_BUCKET"),
            s3_region: get_env("S3_REGION"),
            s3_access_key_id: get_env("S3_ACCESS_KEY_ID"),
            s3_secret_access_key: get_env("S3_SECRET_ACCESS_KEY"),
            watchdog: get_env_bool("WATCHDOG"),
            retention_days: get_env_parse("RETENTION_DAYS"),
        }
    }

    /// Overwrite every config value that has an environment override
    pub fn apply(&self, config: &mut AppConfig) {
        fn set<T: Clone>(target: &mut T, value: &Option<T>) {
            if let Some(v) = value {
                *target = v.clone();
            }
        }
        fn set_opt<T: Clone>(target: &mut Option<T>, value: &Option<T>) {
            if value.is_some() {
                *target = value.clone();
            }
        }

        set(&mut config.logging.level, &self.log_level);
        set_opt(&mut config.coordinator.data_dir, &self.data_dir);
        set_opt(&mut config.coordinator.catalog, &self.catalog);
        set_opt(&mut config.coordinator.internal_secret, &self.internal_secret);
        set(&mut config.coordinator.url, &self.coordinator_url);
        set(&mut config.coordinator.dispatcher_url, &self.dispatcher_url);
        set_opt(&mut config.dispatcher.executor_url, &self.executor_url);
        set_opt(&mut config.dispatcher.queue_dir, &self.queue_dir);
        set(&mut config.executor.workspace_root, &self.workspace_root);
        set(&mut config.executor.max_concurrent_jobs, &self.max_concurrent_jobs);
        set(&mut config.executor.default_timeout_secs, &self.job_timeout);
        set_opt(&mut config.executor.repo_token, &self.repo_token);
        set_opt(&mut config.executor.ssh_key_path, &self.ssh_key_path);
        set(&mut config.gate.engine, &self.gate_engine);
        set(&mut config.storage.backend, &self.storage_backend);
        set_opt(&mut config.storage.local_dir, &self.artifact_dir);
        set_opt(&mut config.storage.endpoint, &self.s3_endpoint);
        set(&mut config.storage.bucket, &self.s3_bucket);
        set_opt(&mut config.storage.region, &self.s3_region);
        set_opt(&mut config.storage.access_key_id, &self.s3_access_key_id);
        set_opt(&mut config.storage.secret_access_key, &self.s3_secret_access_key);
        set(&mut config.watchdog.enabled, &self.watchdog);
        set(&mut config.retention.days, &self.retention_days);
    }
}

/// Get environment variable with prefix
pub(crate) fn get_env(name: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}_{name}"))
        .ok()
        .filter(|v| !v.is_empty())
}

/// Get environment variable and parse to type
pub(crate) fn get_env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    get_env(name).and_then(|v| v.parse().ok())
}

/// Get environment variable as boolean
pub(crate) fn get_env_bool(name: &str) -> Option<bool> {
    get_env(name).map(|v| {
        matches!(
            v.to_lowercase().as_str(),
            "1" | "true" | "yes" | "on" | "enabled"
        )
    })
}

/// Print all SHARDRUN environment variables
pub fn print_env_help() {
    println!("Environment Variables:");
    println!();
    println!("  {ENV_PREFIX}_CONFIG               Path to configuration file");
    println!("  {ENV_PREFIX}_LOG_LEVEL            Log level when RUST_LOG is unset");
    println!("  {ENV_PREFIX}_DATA_DIR             Coordinator run directory");
    println!("  {ENV_PREFIX}_CATALOG              Catalog file (YAML or JSON)");
    println!("  {ENV_PREFIX}_INTERNAL_SECRET      Shared secret for internal endpoints");
    println!("  {ENV_PREFIX}_COORDINATOR_URL      Coordinator base URL");
    println!("  {ENV_PREFIX}_DISPATCHER_URL       Dispatcher base URL");
    println!("  {ENV_PREFIX}_EXECUTOR_URL         Executor base URL");
    println!("  {ENV_PREFIX}_QUEUE_DIR            Dispatcher queue directory");
    println!("  {ENV_PREFIX}_WORKSPACE_ROOT       Executor workspace root");
    println!("  {ENV_PREFIX}_MAX_CONCURRENT_JOBS  Jobs per executor");
    println!("  {ENV_PREFIX}_JOB_TIMEOUT          Default job timeout in seconds");
    println!("  {ENV_PREFIX}_REPO_TOKEN           Token for https repositories");
    println!("  {ENV_PREFIX}_SSH_KEY_PATH         Key for ssh repositories");
    println!("  {ENV_PREFIX}_GATE_ENGINE          Dataset gate engine (health, none)");
    println!("  {ENV_PREFIX}_STORAGE_BACKEND      Artifact storage (local, s3)");
    println!("  {ENV_PREFIX}_ARTIFACT_DIR         Root of the local artifact store");
    println!("  {ENV_PREFIX}_S3_ENDPOINT          S3 endpoint URL");
    println!("  {ENV_PREFIX}_S3_BUCKET            Artifact bucket");
    println!("  {ENV_PREFIX}_S3_REGION            S3 region");
    println!("  {ENV_PREFIX}_S3_ACCESS_KEY_ID     S3 access key id");
    println!("  {ENV_PREFIX}_S3_SECRET_ACCESS_KEY S3 secret access key");
    println!("  {ENV_PREFIX}_WATCHDOG             Enable the stalled run watchdog");
    println!("  {ENV_PREFIX}_RETENTION_DAYS       Artifact retention in days");
    println!();
    println!("Example:");
    println!("  export {ENV_PREFIX}_EXECUTOR_URL=http://10.0.0.5:8002");
    println!("  shardrun dispatcher");
}

/// Builder for setting environment variables in tests
#[cfg(test)]
pub(crate) struct EnvBuilder {
    vars: Vec<(String, String)>,
}

#[cfg(test)]
impl EnvBuilder {
    pub(crate) fn new() -> Self {
        Self { vars: Vec::new() }
    }

    pub(crate) fn var(mut self, name: &str, value: impl Into<String>) -> Self {
        self.vars.push((format!("{ENV_PREFIX}_{name}"), value.into()));
        self
    }

    /// Apply and return guard that restores on drop
    pub(crate) fn apply_scoped(self) -> EnvGuard {
        let previous: Vec<_> = self
            .vars
            .iter()
            .map(|(k, _)| (k.clone(), env::var(k).ok()))
            .collect();

        for (key, value) in self.vars {
            env::set_var(key, value);
        }

        EnvGuard { previous }
    }
}

/// Guard that restores environment variables on drop
#[cfg(test)]
pub(crate) struct EnvGuard {
    previous: Vec<(String, Option<String>)>,
}

#[cfg(test)]
impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, value) in &self.previous {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }
    }
}
