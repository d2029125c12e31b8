//! Run models
//!
//! Defines the run record, its status lifecycle values and the per-shard ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Run identity
pub type RunId = u64;

/// Lifecycle status of a run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Provisioning,
    Running,
    Reporting,
    Completed,
    Failed,
    PartialFailed,
    TimedOut,
    InfraFailed,
    Cancelled,
}

impl RunStatus {
    /// Get the wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Provisioning => "provisioning",
            RunStatus::Running => "running",
            RunStatus::Reporting => "reporting",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::PartialFailed => "partial_failed",
            RunStatus::TimedOut => "timed_out",
            RunStatus::InfraFailed => "infra_failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal states never change again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed
                | RunStatus::Failed
                | RunStatus::PartialFailed
                | RunStatus::TimedOut
                | RunStatus::InfraFailed
                | RunStatus::Cancelled
        )
    }

    /// Get all statuses
    pub fn all() -> Vec<RunStatus> {
        vec![
            RunStatus::Queued,
            RunStatus::Provisioning,
            RunStatus::Running,
            RunStatus::Reporting,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::PartialFailed,
            RunStatus::TimedOut,
            RunStatus::InfraFailed,
            RunStatus::Cancelled,
        ]
    }

    /// Parse from string
    pub fn parse(s: &str) -> Option<RunStatus> {
        Self::all()
            .into_iter()
            .find(|status| status.as_str() == s.to_lowercase())
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single shard as reported by an executor
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardStatus {
    Running,
    Completed,
    Failed,
    TimedOut,
    InfraFailed,
}

impl ShardStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShardStatus::Running => "running",
            ShardStatus::Completed => "completed",
            ShardStatus::Failed => "failed",
            ShardStatus::TimedOut => "timed_out",
            ShardStatus::InfraFailed => "infra_failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ShardStatus::Running)
    }
}

impl fmt::Display for ShardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Test counts for a shard or a whole run
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCounts {
    pub total: u64,
    pub passed: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl TestCounts {
    pub fn new(passed: u64, failed: u64, skipped: u64) -> Self {
        Self {
            total: passed.saturating_add(failed).saturating_add(skipped),
            passed,
            failed,
            skipped,
        }
    }

    /// Build from optional reported values; a missing total is derived from the parts
    pub fn from_reported(
        total: Option<u64>,
        passed: Option<u64>,
        failed: Option<u64>,
        skipped: Option<u64>,
    ) -> Self {
        let passed = passed.unwrap_or(0);
        let failed = failed.unwrap_or(0);
        let skipped = skipped.unwrap_or(0);
        Self {
            total: total.unwrap_or(passed.saturating_add(failed).saturating_add(skipped)),
            passed,
            failed,
            skipped,
        }
    }

    pub fn add(&self, other: &TestCounts) -> TestCounts {
        TestCounts {
            total: self.total.saturating_add(other.total),
            passed: self.passed.saturating_add(other.passed),
            failed: self.failed.saturating_add(other.failed),
            skipped: self.skipped.saturating_add(other.skipped),
        }
    }
}

/// One slot of the shard ledger
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ShardResult {
    pub status: ShardStatus,
    #[serde(default)]
    pub counts: TestCounts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ShardResult {
    pub fn new(status: ShardStatus, counts: TestCounts) -> Self {
        Self {
            status,
            counts,
            detail: None,
            updated_at: Utc::now(),
        }
    }

    pub fn running() -> Self {
        Self::new(ShardStatus::Running, TestCounts::default())
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn at(mut self, at: DateTime<Utc>) -> Self {
        self.updated_at = at;
        self
    }
}

/// Free-form run metadata holding the shard ledger
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    /// Number of planned shards, fixed by the first dispatch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard_total: Option<u32>,

    /// Per-shard results keyed by shard index
    #[serde(default)]
    pub shards: BTreeMap<u32, ShardResult>,

    /// Index of the coverage artifacts attached to the run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage: Option<serde_json::Value>,
}

impl RunMetadata {
    /// Number of shards that reported a terminal outcome
    pub fn terminal_shards(&self) -> usize {
        self.shards
            .values()
            .filter(|s| s.status.is_terminal())
            .count()
    }

    /// Rebuild the coverage index from the run's coverage artifacts
    pub fn index_coverage(&mut self, artifacts: &[RunArtifact]) {
        let files: Vec<serde_json::Value> = artifacts
            .iter()
            .filter(|a| a.artifact_type == ArtifactType::Coverage)
            .map(|a| {
                serde_json::json!({
                    "shard_index": a.shard_index,
                    "bucket": a.bucket,
                    "storage_key": a.storage_key,
                    "size_bytes": a.size_bytes,
                })
            })
            .collect();
        self.coverage = if files.is_empty() {
            None
        } else {
            Some(serde_json::json!({ "shards": files.len(), "files": files }))
        };
    }

    /// Sum of all known shard counts
    pub fn merged_counts(&self) -> TestCounts {
        self.shards
            .values()
            .fold(TestCounts::default(), |acc, s| acc.add(&s.counts))
    }
}

/// Kind of stored artifact
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactType {
    Allure,
    Coverage,
    Screenshot,
    Log,
    Video,
}

impl ArtifactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactType::Allure => "allure",
            ArtifactType::Coverage => "coverage",
            ArtifactType::Screenshot => "screenshot",
            ArtifactType::Log => "log",
            ArtifactType::Video => "video",
        }
    }
}

impl fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to an object in artifact storage
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunArtifact {
    pub run_id: RunId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard_index: Option<u32>,
    pub artifact_type: ArtifactType,
    pub bucket: String,
    pub storage_key: String,
    pub size_bytes: u64,
    pub mime_type: String,
    pub created_at: DateTime<Utc>,
}

/// Request to create a run
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NewRun {
    pub project_id: u64,
    pub suite_id: u64,
    pub environment_id: u64,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub commit: Option<String>,
    #[serde(default)]
    pub commit_message: Option<String>,
    #[serde(default)]
    pub triggered_by: Option<String>,
}

/// A run of a suite against an environment
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub status: RunStatus,
    pub project_id: u64,
    pub suite_id: u64,
    pub environment_id: u64,
    pub branch: Option<String>,
    pub commit: Option<String>,
    pub commit_message: Option<String>,
    pub triggered_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub total_tests: u64,
    pub passed_tests: u64,
    pub failed_tests: u64,
    pub skipped_tests: u64,
    pub dataset_version: Option<String>,
    pub status_reason: Option<String>,
    #[serde(default)]
    pub run_metadata: RunMetadata,
    #[serde(default)]
    pub artifacts: Vec<RunArtifact>,
    /// Bumped by every applied mutation
    #[serde(default)]
    pub version: u64,
}

impl Run {
    /// Create a queued run
    pub fn queued(id: RunId, request: NewRun, dataset_version: Option<String>) -> Self {
        Self {
            id,
            status: RunStatus::Queued,
            project_id: request.project_id,
            suite_id: request.suite_id,
            environment_id: request.environment_id,
            branch: request.branch,
            commit: request.commit,
            commit_message: request.commit_message,
            triggered_by: request.triggered_by,
            created_at: Utc::now(),
            dispatched_at: None,
            started_at: None,
            completed_at: None,
            duration_seconds: None,
            total_tests: 0,
            passed_tests: 0,
            failed_tests: 0,
            skipped_tests: 0,
            dataset_version,
            status_reason: None,
            run_metadata: RunMetadata::default(),
            artifacts: Vec::new(),
            version: 0,
        }
    }

    pub fn counts(&self) -> TestCounts {
        TestCounts {
            total: self.total_tests,
            passed: self.passed_tests,
            failed: self.failed_tests,
            skipped: self.skipped_tests,
        }
    }

    pub fn set_counts(&mut self, counts: TestCounts) {
        self.total_tests = counts.total;
        self.passed_tests = counts.passed;
        self.failed_tests = counts.failed;
        self.skipped_tests = counts.skipped;
    }
}

impl fmt::Display for Run {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Run {} [{}] {}/{} passed",
            self.id, self.status, self.passed_tests, self.total_tests
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_terminal() {
        assert!(!RunStatus::Queued.is_terminal());
        assert!(!RunStatus::Reporting.is_terminal());
        assert!(RunStatus::PartialFailed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_status_parse() {
        assert_eq!(RunStatus::parse("timed_out"), Some(RunStatus::TimedOut));
        assert_eq!(RunStatus::parse("QUEUED"), Some(RunStatus::Queued));
        assert_eq!(RunStatus::parse("nope"), None);
    }

    #[test]
    fn test_counts_from_reported() {
        let counts = TestCounts::from_reported(None, Some(3), Some(2), None);
        assert_eq!(counts.total, 5);

        let explicit = TestCounts::from_reported(Some(9), Some(3), Some(2), Some(1));
        assert_eq!(explicit.total, 9);
    }

    #[test]
    fn test_counts_saturate() {
        let counts = TestCounts::new(u64::MAX, 1, 0);
        assert_eq!(counts.total, u64::MAX);

        let reported = TestCounts::from_reported(None, Some(u64::MAX), Some(u64::MAX), None);
        assert_eq!(reported.total, u64::MAX);

        let sum = counts.add(&TestCounts::new(1, 1, 1));
        assert_eq!(sum.passed, u64::MAX);
        assert_eq!(sum.failed, 2);
    }

    #[test]
    fn test_metadata_merge() {
        let mut meta = RunMetadata::default();
        meta.shards.insert(
            0,
            ShardResult::new(ShardStatus::Completed, TestCounts::new(5, 0, 0)),
        );
        meta.shards.insert(1, ShardResult::running());
        assert_eq!(meta.terminal_shards(), 1);
        assert_eq!(meta.merged_counts().passed, 5);
    }

    #[test]
    fn test_metadata_serializes_integer_keys() {
        let mut meta = RunMetadata::default();
        meta.shard_total = Some(2);
        meta.shards.insert(
            1,
            ShardResult::new(ShardStatus::Failed, TestCounts::new(1, 1, 0)),
        );
        let json = serde_json::to_string(&meta).unwrap();
        let back: RunMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back, meta);
    }
}
