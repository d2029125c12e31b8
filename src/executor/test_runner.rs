//! External test runner invocation
//!
//! Builds the pytest command line for a shard and reads the pass/fail/skip
//! counts back from its terminal summary.

use std::path::Path;
use tokio::process::Command;
use tracing::{debug, info};

use super::job::JobError;
use super::run_config::RunConfig;
use crate::models::{Layer, ShardStatus, TestCounts};

/// pytest exit code when no tests were collected
pub const NO_TESTS_COLLECTED: i32 = 5;

/// Report directories written by the runner, relative to the repository
pub const ALLURE_RESULTS_DIR: &str = "allure-results";

/// Which tests a shard runs
#[derive(Clone, Debug, PartialEq)]
pub struct TestSelection {
    pub suite_name: String,
    pub layer: Layer,
    pub tags: Vec<String>,
    pub shard_index: u32,
    pub shard_total: u32,
    pub retries: u32,
}

impl TestSelection {
    /// Marker expression selecting layer, suite and tags
    pub fn marker_expression(&self) -> String {
        let mut parts = vec![self.layer.as_str().to_string()];
        let suite = marker_name(&self.suite_name);
        if !suite.is_empty() {
            parts.push(format!("suite_{suite}"));
        }
        let tags: Vec<String> = self
            .tags
            .iter()
            .map(|t| marker_name(t))
            .filter(|t| !t.is_empty())
            .collect();
        match tags.len() {
            0 => {}
            1 => parts.push(tags[0].clone()),
            _ => parts.push(format!("({})", tags.join(" or "))),
        }
        parts.join(" and ")
    }
}

fn marker_name(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Full runner argument list for a shard
pub fn runner_args(selection: &TestSelection, config: &RunConfig, repo: &Path) -> Vec<String> {
    let mut args = vec!["-m".to_string(), selection.marker_expression()];

    if selection.shard_total > 1 {
        args.extend([
            "--shard-id".to_string(),
            selection.shard_index.to_string(),
            "--num-shards".to_string(),
            selection.shard_total.to_string(),
        ]);
    }
    if selection.retries > 0 {
        args.extend(["--reruns".to_string(), selection.retries.to_string()]);
    }

    args.extend([
        "--alluredir".to_string(),
        repo.join(ALLURE_RESULTS_DIR).to_string_lossy().into_owned(),
        "--cov".to_string(),
        ".".to_string(),
        "--cov-report".to_string(),
        "xml".to_string(),
        "--cov-report".to_string(),
        "html".to_string(),
    ]);
    args.extend(config.runner_args.iter().cloned());
    args.push(config.test_dir(repo).to_string_lossy().into_owned());
    args
}

/// Counts from the runner's final summary line, e.g.
/// `==== 5 passed, 2 failed, 1 skipped in 3.21s ====`
pub fn parse_summary(output: &str) -> Option<TestCounts> {
    output.lines().rev().find_map(parse_summary_line)
}

fn parse_summary_line(line: &str) -> Option<TestCounts> {
    let text = line.trim().trim_matches('=').trim();
    let (outcomes, _duration) = text.rsplit_once(" in ")?;

    let mut counts = TestCounts::default();
    let mut seen = false;
    for segment in outcomes.split(", ") {
        let mut words = segment.split_whitespace();
        let n: u64 = words.next()?.parse().ok()?;
        let kind = words.next()?;
        match kind {
            "passed" | "xpassed" => counts.passed += n,
            "failed" | "error" | "errors" => counts.failed += n,
            "skipped" | "xfailed" => counts.skipped += n,
            "warning" | "warnings" | "deselected" | "rerun" | "reruns" => {}
            _ => return None,
        }
        seen = true;
    }
    if !seen {
        return None;
    }
    counts.total = counts.passed + counts.failed + counts.skipped;
    Some(counts)
}

/// Map the runner's exit code and counts to a shard outcome.
///
/// A non-zero exit without any counts means the runner itself broke.
pub fn classify(
    exit_code: i32,
    counts: Option<TestCounts>,
) -> Result<(ShardStatus, TestCounts), JobError> {
    match exit_code {
        0 => Ok((ShardStatus::Completed, counts.unwrap_or_default())),
        NO_TESTS_COLLECTED => Ok((ShardStatus::Completed, counts.unwrap_or_default())),
        code => match counts {
            Some(counts) if counts.total > 0 => Ok((ShardStatus::Failed, counts)),
            _ => Err(JobError::Runner(format!(
                "runner exited with {code} without a test summary"
            ))),
        },
    }
}

/// Raw result of one runner invocation
#[derive(Clone, Debug)]
pub struct RunnerOutput {
    pub exit_code: i32,
    pub counts: Option<TestCounts>,
    /// Combined stdout and stderr
    pub log: String,
}

/// Invokes the configured runner executable
#[derive(Clone, Debug, PartialEq)]
pub struct TestRunner {
    program: String,
    leading_args: Vec<String>,
}

impl TestRunner {
    /// Runner from a command line such as `python -m pytest`
    pub fn from_command(command: &str) -> Self {
        let mut words = command.split_whitespace().map(str::to_string);
        Self {
            program: words.next().unwrap_or_else(|| "pytest".to_string()),
            leading_args: words.collect(),
        }
    }

    pub async fn run(
        &self,
        args: &[String],
        repo: &Path,
        vars: &[(String, String)],
    ) -> Result<RunnerOutput, JobError> {
        info!("Running tests: {} {}", self.program, args.join(" "));
        let output = Command::new(&self.program)
            .args(&self.leading_args)
            .args(args)
            .envs(vars.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(repo)
            .output()
            .await
            .map_err(|e| JobError::Runner(format!("Failed to start {}: {}", self.program, e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let exit_code = output.status.code().unwrap_or(-1);
        let counts = parse_summary(&stdout);
        debug!("Runner exited with {}, counts {:?}", exit_code, counts);

        Ok(RunnerOutput {
            exit_code,
            counts,
            log: format!("{stdout}{stderr}"),
        })
    }
}
