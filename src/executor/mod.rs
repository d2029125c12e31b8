//! Shard executor
//!
//! The executor service accepts shard jobs over HTTP and runs each one in a
//! child `run-shard` process bounded by a hard timeout. The child clones the
//! repository, runs the tests, uploads artifacts and reports the outcome.

mod artifacts;
mod env;
mod job;
mod repo;
mod run_config;
mod server;
mod test_runner;
mod workspace;

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::config::{expand_path, AppConfig};
use crate::http::{Coordinator, HttpCoordinator};
use crate::storage;
use env::{service_vars, JobEnv};
use job::{JobError, ShardJobRunner, EXIT_INFRA, EXIT_REPORTED, OUTCOME_MARKER};
use server::{router, ExecutorState, ShardCommand};
use test_runner::TestRunner;
use workspace::Workspace;

fn coordinator_client(config: &AppConfig) -> Result<Arc<dyn Coordinator>> {
    Ok(Arc::new(HttpCoordinator::from_config(&config.coordinator)?))
}

/// Child command from configuration; defaults to this binary's `run-shard`.
///
/// `config_path` is handed down so children load the same file.
fn shard_command(config: &AppConfig, config_path: Option<&str>) -> Result<ShardCommand> {
    let (program, args) = match &config.executor.command {
        Some(command) => {
            let mut words = command.split_whitespace().map(str::to_string);
            let program = words
                .next()
                .ok_or_else(|| anyhow::anyhow!("executor.command is empty"))?;
            (program, words.collect())
        }
        None => {
            let exe = std::env::current_exe().context("Cannot locate the shardrun binary")?;
            (
                exe.to_string_lossy().into_owned(),
                vec!["run-shard".to_string()],
            )
        }
    };
    let mut vars = service_vars(config);
    if let Some(path) = config_path {
        vars.push(("SHARDRUN_CONFIG".to_string(), path.to_string()));
    }
    Ok(ShardCommand {
        program,
        args,
        vars,
    })
}

/// Fully wired executor, ready to serve
pub struct ExecutorService {
    state: ExecutorState,
}

impl ExecutorService {
    pub fn build(config: &AppConfig, config_path: Option<&str>) -> Result<Self> {
        let mut settings = config.executor.clone();
        let root = expand_path(&settings.workspace_root);
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create workspace root: {}", root.display()))?;
        settings.workspace_root = root.to_string_lossy().into_owned();

        let command = shard_command(config, config_path)?;
        info!(
            "Executor: {} parallel jobs, workspaces under {}, child {} {}",
            settings.max_concurrent_jobs,
            settings.workspace_root,
            command.program,
            command.args.join(" ")
        );
        Ok(Self {
            state: ExecutorState::new(settings, command, coordinator_client(config)?),
        })
    }

    pub async fn serve(self, listener: TcpListener, shutdown: watch::Receiver<bool>) -> Result<()> {
        crate::api::serve(
            "Executor",
            listener,
            router(self.state),
            crate::api::wait_for_shutdown(shutdown),
        )
        .await
    }
}

/// Run the shard described by the `SHARDRUN_*` job environment.
///
/// Returns the process exit code: [`EXIT_REPORTED`] once the outcome is
/// reported, [`EXIT_INFRA`] after an infrastructure failure.
pub async fn run_shard(config: &AppConfig) -> Result<i32> {
    let env = JobEnv::from_env()?;
    let coordinator = coordinator_client(config)?;
    let artifacts = storage::build(&config.storage).await;

    // Launched by hand there is no server-provided workspace
    let (workspace_dir, _workspace) = match &env.workspace_dir {
        Some(dir) => (dir.clone(), None),
        None => {
            let root = expand_path(&config.executor.workspace_root);
            let workspace = Workspace::acquire(Path::new(&root), &env.job)
                .map_err(|e| JobError::Workspace(e.to_string()))?;
            (workspace.path().to_path_buf(), Some(workspace))
        }
    };

    let runner = ShardJobRunner::new(env, workspace_dir, coordinator, artifacts)
        .with_runner(TestRunner::from_command(&config.executor.runner));
    match runner.run().await {
        Ok(outcome) => {
            info!(
                "Reported {} with {} tests and {} artifacts",
                outcome.status,
                outcome.counts.total,
                outcome.artifacts.len()
            );
            println!("{OUTCOME_MARKER}{}", outcome.status);
            Ok(EXIT_REPORTED)
        }
        Err(_) => Ok(EXIT_INFRA),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_command_from_config() {
        let mut config = AppConfig::default();
        config.executor.command = Some("/opt/shardrun/bin/shardrun run-shard".to_string());
        config.coordinator.url = "http://coordinator:8000".to_string();

        let command = shard_command(&config, Some("/etc/shardrun.yaml")).unwrap();
        assert_eq!(command.program, "/opt/shardrun/bin/shardrun");
        assert!(command.vars.contains(&(
            "SHARDRUN_CONFIG".to_string(),
            "/etc/shardrun.yaml".to_string()
        )));
        assert_eq!(command.args, vec!["run-shard"]);
        assert!(command.vars.contains(&(
            "SHARDRUN_COORDINATOR_URL".to_string(),
            "http://coordinator:8000".to_string()
        )));

        config.executor.command = Some("   ".to_string());
        assert!(shard_command(&config, None).is_err());
    }

    #[test]
    fn test_default_shard_command_runs_this_binary() {
        let command = shard_command(&AppConfig::default(), None).unwrap();
        assert_eq!(command.args, vec!["run-shard"]);
        assert!(!command.program.is_empty());
    }

    #[tokio::test]
    async fn test_service_creates_workspace_root() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = AppConfig::default();
        config.executor.workspace_root = dir.path().join("ws").to_string_lossy().into_owned();
        ExecutorService::build(&config, None).unwrap();
        assert!(dir.path().join("ws").is_dir());
    }
}
