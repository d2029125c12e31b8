//! Executor HTTP surface
//!
//! `POST /execute` runs one shard in a child process and answers only when the
//! child exits or the hard timeout fires. The child reports its own outcome;
//! the server reports on its behalf when the child never gets the chance.

use axum::body::Bytes;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use std::collections::HashSet;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use super::env::JobEnv;
use super::job::{tail, EXIT_INFRA, EXIT_REPORTED, OUTCOME_MARKER};
use super::workspace::Workspace;
use crate::api::{health_routes, ApiError};
use crate::config::ExecutorConfig;
use crate::http::Coordinator;
use crate::models::{ExecuteRequest, ExecuteResponse, ResultsReport, ShardJob, ShardStatus};
use crate::utils::StepTimings;

/// Child process launched per job
#[derive(Clone, Debug)]
pub struct ShardCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Service settings passed to every child
    pub vars: Vec<(String, String)>,
}

impl ShardCommand {
    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

#[derive(Clone)]
pub struct ExecutorState {
    config: Arc<ExecutorConfig>,
    command: Arc<ShardCommand>,
    coordinator: Arc<dyn Coordinator>,
    slots: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

/// Marks a job as executing until dropped
struct Claim {
    key: String,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl Drop for Claim {
    fn drop(&mut self) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        in_flight.remove(&self.key);
    }
}

impl ExecutorState {
    pub fn new(
        config: ExecutorConfig,
        command: ShardCommand,
        coordinator: Arc<dyn Coordinator>,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1)));
        Self {
            config: Arc::new(config),
            command: Arc::new(command),
            coordinator,
            slots,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Claim `job` unless it is already executing here
    fn claim(&self, job: &ShardJob) -> Option<Claim> {
        let key = job.key();
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !in_flight.insert(key.clone()) {
            return None;
        }
        Some(Claim {
            key,
            in_flight: self.in_flight.clone(),
        })
    }

    async fn report(&self, job: &ShardJob, status: ShardStatus, detail: impl Into<String>) {
        let report = ResultsReport::status(job, status).with_detail(detail);
        if let Err(e) = self.coordinator.report(job.run_id, &report).await {
            warn!("Failed to report {} for {}: {}", status, job, e);
        }
    }
}

pub fn router(state: ExecutorState) -> Router {
    Router::new()
        .route("/execute", post(execute))
        .merge(health_routes())
        .with_state(state)
}

/// Status written by the child after the marker
fn parse_outcome(stdout: &str) -> Option<ShardStatus> {
    stdout.lines().rev().find_map(|line| {
        let status = line.trim().strip_prefix(OUTCOME_MARKER)?;
        serde_json::from_value(serde_json::Value::String(status.to_string())).ok()
    })
}

async fn execute(
    State(state): State<ExecutorState>,
    body: Bytes,
) -> Result<Json<ExecuteResponse>, ApiError> {
    let request: ExecuteRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::bad_request(format!("Invalid execute request: {e}")))?;
    let job = request.job;
    if job.run_id == 0 {
        return Err(ApiError::bad_request("job.run_id required"));
    }
    if request.context.repo_url.trim().is_empty() {
        state
            .report(&job, ShardStatus::InfraFailed, "project has no repository URL")
            .await;
        return Err(ApiError::bad_request(
            "Project has no repo_url; set a cloneable Git URL in the project settings",
        ));
    }

    let _claim = state
        .claim(&job)
        .ok_or_else(|| ApiError::conflict(format!("{job} is already executing here")))?;
    let _permit = state
        .slots
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| ApiError::internal("executor is shutting down"))?;

    let workspace = match Workspace::acquire(Path::new(&state.config.workspace_root), &job) {
        Ok(workspace) => workspace,
        Err(e) => {
            let detail = format!("cannot create workspace: {e}");
            state.report(&job, ShardStatus::InfraFailed, &detail).await;
            return Err(ApiError::bad_gateway(detail));
        }
    };

    let timeout_secs = request
        .context
        .timeout_secs
        .filter(|t| *t > 0)
        .unwrap_or(state.config.default_timeout_secs);
    let env = JobEnv::new(&request, &state.config, workspace.path());
    let mut cmd = state.command.command();
    cmd.envs(env.vars());

    info!("Executing {} (timeout {}s)", job, timeout_secs);
    let mut timings = StepTimings::start();
    let result = tokio::time::timeout(Duration::from_secs(timeout_secs), cmd.output()).await;

    let output = match result {
        Err(_) => {
            warn!("{} exceeded {}s and was killed", job, timeout_secs);
            let detail = format!("hard timeout of {timeout_secs}s exceeded");
            state.report(&job, ShardStatus::TimedOut, &detail).await;
            return Err(ApiError::gateway_timeout(format!("{job}: {detail}")));
        }
        Ok(Err(e)) => {
            error!("Failed to start shard process for {}: {}", job, e);
            let detail = format!("cannot start shard process: {e}");
            state.report(&job, ShardStatus::InfraFailed, &detail).await;
            return Err(ApiError::bad_gateway(detail));
        }
        Ok(Ok(output)) => output,
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let code = output.status.code().unwrap_or(-1);
    let elapsed = timings.finish("process");
    debug!(
        "Shard process for {} exited with {} after {}s",
        job,
        code,
        elapsed.as_secs()
    );

    match code {
        EXIT_REPORTED => {
            let outcome = parse_outcome(&stdout);
            info!(
                "{} finished: {}",
                job,
                outcome.map(|s| s.as_str()).unwrap_or("unknown")
            );
            Ok(Json(ExecuteResponse {
                status: "completed".to_string(),
                run_id: job.run_id,
                shard_index: job.shard_index,
                outcome,
            }))
        }
        EXIT_INFRA => {
            warn!("{} failed on infrastructure:\n{}", job, tail(&stdout, 2000));
            Err(ApiError::bad_gateway(format!(
                "{job}: infrastructure failure, see executor logs"
            )))
        }
        code => {
            error!(
                "Shard process for {} crashed with {}:\n{}{}",
                job,
                code,
                tail(&stdout, 2000),
                tail(&stderr, 2000)
            );
            let detail = format!("shard process exited with {code}");
            state.report(&job, ShardStatus::InfraFailed, &detail).await;
            Err(ApiError::bad_gateway(format!("{job}: {detail}")))
        }
    }
}
