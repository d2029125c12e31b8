//! Shard job and wire payload models
//!
//! Payloads exchanged between the dispatcher, the executors and the coordinator.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::catalog::{Layer, RepoAuthMethod};
use super::run::{RunArtifact, RunId, ShardStatus, TestCounts};

/// One parallel partition of a run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardJob {
    pub run_id: RunId,
    pub shard_index: u32,
    pub shard_total: u32,
}

impl ShardJob {
    /// Stable identity used by the queue and by every status update
    pub fn key(&self) -> String {
        format!("run-{}-shard-{}", self.run_id, self.shard_index)
    }
}

impl fmt::Display for ShardJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "run {} shard {}/{}",
            self.run_id,
            self.shard_index + 1,
            self.shard_total
        )
    }
}

/// Everything an executor needs to know about a run
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobContext {
    pub run_id: RunId,
    pub project_id: u64,
    pub repo_url: String,
    #[serde(default)]
    pub repo_auth_method: RepoAuthMethod,
    pub branch: String,
    pub commit: String,
    pub suite_id: u64,
    pub suite_name: String,
    pub layer: Layer,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub shard_count: Option<u32>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    pub environment_id: u64,
    pub environment_name: String,
}

/// Body of `POST /execute`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub job: ShardJob,
    pub context: JobContext,
}

/// Successful answer of `POST /execute`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub status: String,
    pub run_id: RunId,
    pub shard_index: u32,
    #[serde(default)]
    pub outcome: Option<ShardStatus>,
}

/// Body of `PUT /internal/runs/{run_id}/results`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResultsReport {
    pub status: ShardStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard_total: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tests: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passed_tests: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_tests: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped_tests: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<RunArtifact>,
}

impl ResultsReport {
    /// Report carrying only a status for a job
    pub fn status(job: &ShardJob, status: ShardStatus) -> Self {
        Self {
            status,
            shard_index: Some(job.shard_index),
            shard_total: Some(job.shard_total),
            total_tests: None,
            passed_tests: None,
            failed_tests: None,
            skipped_tests: None,
            detail: None,
            artifacts: Vec::new(),
        }
    }

    pub fn with_counts(mut self, counts: TestCounts) -> Self {
        self.total_tests = Some(counts.total);
        self.passed_tests = Some(counts.passed);
        self.failed_tests = Some(counts.failed);
        self.skipped_tests = Some(counts.skipped);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_artifacts(mut self, artifacts: Vec<RunArtifact>) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn counts(&self) -> TestCounts {
        TestCounts::from_reported(
            self.total_tests,
            self.passed_tests,
            self.failed_tests,
            self.skipped_tests,
        )
    }
}
