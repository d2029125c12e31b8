//! Job environment handed from the executor server to `run-shard`

use serde_json::json;
use std::path::{Path, PathBuf};

use super::job::JobError;
use super::repo::RepoSource;
use super::test_runner::TestSelection;
use crate::config::{get_env, AppConfig, ExecutorConfig, StorageBackend, ENV_PREFIX};
use crate::models::{ExecuteRequest, Layer, RepoAuthMethod, ShardJob};

fn var(name: &str) -> String {
    format!("{ENV_PREFIX}_{name}")
}

/// Everything a shard process needs to know about its job
#[derive(Clone, Debug, PartialEq)]
pub struct JobEnv {
    pub job: ShardJob,
    pub repo: RepoSource,
    pub suite_name: String,
    pub environment: String,
    pub layer: Layer,
    pub tags: Vec<String>,
    pub retries: u32,
    /// Set by the server; a standalone `run-shard` acquires its own
    pub workspace_dir: Option<PathBuf>,
}

impl JobEnv {
    pub fn new(request: &ExecuteRequest, config: &ExecutorConfig, workspace: &Path) -> Self {
        let context = &request.context;
        Self {
            job: request.job,
            repo: RepoSource {
                url: context.repo_url.trim().to_string(),
                auth: context.repo_auth_method,
                token: config.repo_token.clone(),
                ssh_key_path: config.ssh_key_path.clone(),
                branch: context.branch.clone(),
                commit: context.commit.clone(),
            },
            suite_name: context.suite_name.clone(),
            environment: context.environment_name.clone(),
            layer: context.layer,
            tags: context.tags.clone(),
            retries: context.retries,
            workspace_dir: Some(workspace.to_path_buf()),
        }
    }

    /// Environment variables describing this job
    pub fn vars(&self) -> Vec<(String, String)> {
        let job = json!({
            "run_id": self.job.run_id,
            "shard_index": self.job.shard_index,
            "shard_total": self.job.shard_total,
        });
        let mut vars = vec![
            (var("JOB"), job.to_string()),
            (var("REPO_URL"), self.repo.url.clone()),
            (var("REPO_AUTH_METHOD"), self.repo.auth.as_str().to_string()),
            (var("BRANCH"), self.repo.branch.clone()),
            (var("COMMIT"), self.repo.commit.clone()),
            (var("SUITE_NAME"), self.suite_name.clone()),
            (var("ENVIRONMENT"), self.environment.clone()),
            (var("LAYER"), self.layer.as_str().to_string()),
            (var("TAGS"), self.tags.join(",")),
            (var("TEST_RETRIES"), self.retries.to_string()),
        ];
        if let Some(token) = &self.repo.token {
            vars.push((var("REPO_TOKEN"), token.clone()));
        }
        if let Some(key) = &self.repo.ssh_key_path {
            vars.push((var("SSH_KEY_PATH"), key.clone()));
        }
        if let Some(dir) = &self.workspace_dir {
            vars.push((var("WORKSPACE_DIR"), dir.to_string_lossy().into_owned()));
        }
        vars
    }

    /// Read the job from `SHARDRUN_*` variables of this process
    pub fn from_env() -> Result<Self, JobError> {
        Self::from_lookup(get_env)
    }

    /// Read the job through `lookup`, which receives names without the prefix
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, JobError> {
        let missing = |name: &str| JobError::Environment(format!("{} is not set", var(name)));

        let raw_job = lookup("JOB").ok_or_else(|| missing("JOB"))?;
        let job: ShardJob = serde_json::from_str(&raw_job)
            .map_err(|e| JobError::Environment(format!("{}: {}", var("JOB"), e)))?;
        let url = lookup("REPO_URL").ok_or_else(|| missing("REPO_URL"))?;

        let auth = match lookup("REPO_AUTH_METHOD") {
            Some(value) => RepoAuthMethod::parse(&value).ok_or_else(|| {
                JobError::Environment(format!("unknown repository auth method: {value}"))
            })?,
            None => RepoAuthMethod::default(),
        };
        let layer = match lookup("LAYER") {
            Some(value) => Layer::parse(&value)
                .ok_or_else(|| JobError::Environment(format!("unknown layer: {value}")))?,
            None => Layer::default(),
        };
        let retries = match lookup("TEST_RETRIES") {
            Some(value) => value
                .parse()
                .map_err(|_| JobError::Environment(format!("invalid retry count: {value}")))?,
            None => 0,
        };

        Ok(Self {
            job,
            repo: RepoSource {
                url,
                auth,
                token: lookup("REPO_TOKEN"),
                ssh_key_path: lookup("SSH_KEY_PATH"),
                branch: lookup("BRANCH").unwrap_or_else(|| "HEAD".to_string()),
                commit: lookup("COMMIT").unwrap_or_else(|| "HEAD".to_string()),
            },
            suite_name: lookup("SUITE_NAME").unwrap_or_else(|| "default".to_string()),
            environment: lookup("ENVIRONMENT").unwrap_or_else(|| "default".to_string()),
            layer,
            tags: lookup("TAGS")
                .map(|tags| {
                    tags.split(',')
                        .map(str::trim)
                        .filter(|t| !t.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            retries,
            workspace_dir: lookup("WORKSPACE_DIR").map(PathBuf::from),
        })
    }

    pub fn selection(&self) -> TestSelection {
        TestSelection {
            suite_name: self.suite_name.clone(),
            layer: self.layer,
            tags: self.tags.clone(),
            shard_index: self.job.shard_index,
            shard_total: self.job.shard_total,
            retries: self.retries,
        }
    }
}

/// Service settings a shard process inherits from the executor
pub fn service_vars(config: &AppConfig) -> Vec<(String, String)> {
    let storage = &config.storage;
    let backend = match storage.backend {
        StorageBackend::Local => "local",
        StorageBackend::S3 => "s3",
    };
    let mut vars = vec![
        (var("COORDINATOR_URL"), config.coordinator.url.clone()),
        (var("STORAGE_BACKEND"), backend.to_string()),
        (var("S3_BUCKET"), storage.bucket.clone()),
        (
            var("ARTIFACT_DIR"),
            storage.local_path().to_string_lossy().into_owned(),
        ),
    ];
    let optional = [
        ("INTERNAL_SECRET", &config.coordinator.internal_secret),
        ("S3_ENDPOINT", &storage.endpoint),
        ("S3_REGION", &storage.region),
        ("S3_ACCESS_KEY_ID", &storage.access_key_id),
        ("S3_SECRET_ACCESS_KEY", &storage.secret_access_key),
    ];
    for (name, value) in optional {
        if let Some(value) = value {
            vars.push((var(name), value.clone()));
        }
    }
    vars
}
