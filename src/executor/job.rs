//! Shard job execution
//!
//! Runs one shard inside its workspace: clone, configure, install, test,
//! collect and upload artifacts, report. Everything before the test outcome
//! is known is an infrastructure failure; a failing test is an outcome.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use super::artifacts;
use super::env::JobEnv;
use super::repo::{GitFetcher, RepoFetcher};
use super::run_config::RunConfig;
use super::test_runner::{classify, runner_args, TestRunner};
use super::workspace::{REPO_DIR, STAGING_DIR};
use crate::http::Coordinator;
use crate::models::{ResultsReport, RunArtifact, ShardStatus, TestCounts};
use crate::storage::ArtifactStore;
use crate::utils::StepTimings;

/// Exit code of `run-shard` once the outcome is reported
pub const EXIT_REPORTED: i32 = 0;

/// Exit code of `run-shard` after an infrastructure failure it reported itself
pub const EXIT_INFRA: i32 = 3;

/// Printed by `run-shard` on stdout, followed by the shard status
pub const OUTCOME_MARKER: &str = "shardrun-outcome=";

/// Runner output saved in the repository so it is archived with the logs
const RUNNER_LOG: &str = "shardrun-runner.log";

/// Infrastructure failures of a shard job
#[derive(Error, Debug)]
pub enum JobError {
    #[error("Invalid job environment: {0}")]
    Environment(String),

    #[error("Workspace error: {0}")]
    Workspace(String),

    #[error("Clone failed: {0}")]
    Clone(String),

    #[error("Invalid run configuration: {0}")]
    RunConfig(String),

    #[error("Install step `{command}` failed: {message}")]
    Install { command: String, message: String },

    #[error("Test runner failed: {0}")]
    Runner(String),
}

impl JobError {
    /// Step the failure happened in
    pub fn step(&self) -> &'static str {
        match self {
            JobError::Environment(_) | JobError::Workspace(_) => "setup",
            JobError::Clone(_) => "clone",
            JobError::RunConfig(_) => "configure",
            JobError::Install { .. } => "install",
            JobError::Runner(_) => "test",
        }
    }
}

/// Terminal outcome of a shard whose tests ran
#[derive(Clone, Debug, PartialEq)]
pub struct ShardOutcome {
    pub status: ShardStatus,
    pub counts: TestCounts,
    pub artifacts: Vec<RunArtifact>,
}

/// Last `max` bytes of `text`, cut at a character boundary
pub(crate) fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

pub struct ShardJobRunner {
    env: JobEnv,
    workspace: PathBuf,
    coordinator: Arc<dyn Coordinator>,
    artifacts: Arc<dyn ArtifactStore>,
    fetcher: Arc<dyn RepoFetcher>,
    runner: TestRunner,
}

impl ShardJobRunner {
    pub fn new(
        env: JobEnv,
        workspace: impl Into<PathBuf>,
        coordinator: Arc<dyn Coordinator>,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Self {
        Self {
            env,
            workspace: workspace.into(),
            coordinator,
            artifacts,
            fetcher: Arc::new(GitFetcher::default()),
            runner: TestRunner::from_command("pytest"),
        }
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn RepoFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn with_runner(mut self, runner: TestRunner) -> Self {
        self.runner = runner;
        self
    }

    fn repo_dir(&self) -> PathBuf {
        self.workspace.join(REPO_DIR)
    }

    /// Execute the job and report its outcome.
    ///
    /// An infrastructure failure is reported as `infra_failed` before it is
    /// returned. Reporting itself is best effort.
    pub async fn run(&self) -> Result<ShardOutcome, JobError> {
        let job = self.env.job;
        info!("Starting {}", job);
        self.report(ResultsReport::status(&job, ShardStatus::Running)).await;

        let mut timings = StepTimings::start();
        let (status, counts) = match self.prepare_and_test(&mut timings).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("{} failed during {}: {}", job, e.step(), e);
                let report = ResultsReport::status(&job, ShardStatus::InfraFailed)
                    .with_detail(e.to_string());
                self.report(report).await;
                return Err(e);
            }
        };

        let repo = self.repo_dir();
        let staging = self.workspace.join(STAGING_DIR);
        let collected =
            match tokio::task::spawn_blocking(move || artifacts::collect(&repo, &staging)).await {
                Ok(collected) => collected,
                Err(e) => {
                    warn!("Artifact collection aborted: {}", e);
                    Vec::new()
                }
            };
        timings.finish("collect");
        let uploaded = artifacts::upload(self.artifacts.as_ref(), &job, &collected).await;
        timings.finish("upload");

        self.report(
            ResultsReport::status(&job, status)
                .with_counts(counts)
                .with_artifacts(uploaded.clone()),
        )
        .await;

        debug!("Step timings for {}: {}", job, timings);
        if let Some((step, took)) = timings.slowest() {
            debug!("Slowest step of {} was {} ({}ms)", job, step, took.as_millis());
        }
        info!(
            "{} {}: {} passed, {} failed, {} skipped, {} artifacts",
            job,
            status,
            counts.passed,
            counts.failed,
            counts.skipped,
            uploaded.len()
        );
        Ok(ShardOutcome {
            status,
            counts,
            artifacts: uploaded,
        })
    }

    async fn prepare_and_test(
        &self,
        timings: &mut StepTimings,
    ) -> Result<(ShardStatus, TestCounts), JobError> {
        let repo = self.repo_dir();

        self.fetcher.fetch(&self.env.repo, &repo).await?;
        timings.finish("clone");

        let config = RunConfig::load(&repo)?;
        let vars = config.environment_vars(&self.env.environment);
        timings.finish("configure");

        for command in config.install_commands(&repo) {
            install(&command, &repo, &vars).await?;
        }
        timings.finish("install");

        let args = runner_args(&self.env.selection(), &config, &repo);
        let output = self.runner.run(&args, &repo, &vars).await?;
        if let Err(e) = tokio::fs::write(repo.join(RUNNER_LOG), &output.log).await {
            warn!("Failed to save runner output: {}", e);
        }
        timings.finish("test");

        if output.exit_code != 0 {
            debug!("Runner output tail:\n{}", tail(&output.log, 2000));
        }
        classify(output.exit_code, output.counts)
    }

    async fn report(&self, report: ResultsReport) {
        let job = self.env.job;
        if let Err(e) = self.coordinator.report(job.run_id, &report).await {
            warn!("Failed to report {} for {}: {}", report.status, job, e);
        }
    }
}

async fn install(command: &str, repo: &Path, vars: &[(String, String)]) -> Result<(), JobError> {
    info!("Installing: {}", command);
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(repo)
        .envs(vars.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .output()
        .await
        .map_err(|e| JobError::Install {
            command: command.to_string(),
            message: e.to_string(),
        })?;

    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(JobError::Install {
        command: command.to_string(),
        message: format!(
            "exited with {}: {}",
            output.status.code().unwrap_or(-1),
            tail(stderr.trim(), 500)
        ),
    })
}
