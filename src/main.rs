//! shardrun - sharded test run orchestration
//!
//! One binary hosts every role of the system:
//!
//! - the coordinator owns runs, gates them on dataset health and folds shard
//!   results into a terminal status
//! - the dispatcher plans runs into shard jobs and hands each to an executor
//! - the executor clones the project repository and runs one shard of tests
//!
//! ## Usage
//!
//! ```bash
//! # Start the services
//! shardrun coordinator --bind 0.0.0.0:8000
//! shardrun dispatcher
//! shardrun executor
//!
//! # Everything in one process for local development
//! shardrun --config ./shardrun.yaml standalone
//!
//! # Print the shard plan of a run
//! shardrun plan --run-id 42 --shards 4
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

mod api;
mod cli;
mod config;
mod coordinator;
mod dispatch;
mod executor;
mod gate;
mod http;
mod lifecycle;
mod models;
mod storage;
mod store;
mod utils;

use cli::Args;
use config::{AppConfig, ConfigFile};
use coordinator::CoordinatorService;
use dispatch::{DispatchState, Dispatcher, JobQueue, LocalEnqueuer, RetryPolicy};
use executor::ExecutorService;
use http::{Enqueuer, ExecutorEndpoint, HttpCoordinator, HttpExecutor, ServiceClient};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = AppConfig::resolve(args.config.as_deref())?;
    utils::init_logger(&config.logging.level, args.verbose);

    match args.command {
        cli::Command::Coordinator(service) => {
            if let Some(bind) = service.bind {
                config.coordinator.bind = bind;
            }
            run_coordinator(&config).await?;
        }
        cli::Command::Dispatcher(service) => {
            if let Some(bind) = service.bind {
                config.dispatcher.bind = bind;
            }
            run_dispatcher(&config).await?;
        }
        cli::Command::Executor(service) => {
            if let Some(bind) = service.bind {
                config.executor.bind = bind;
            }
            run_executor(&config, args.config.as_deref()).await?;
        }
        cli::Command::RunShard => {
            let code = executor::run_shard(&config).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        cli::Command::Standalone => {
            run_standalone(config, args.config.as_deref()).await?;
        }
        cli::Command::Plan(plan_args) => {
            show_plan(plan_args)?;
        }
        cli::Command::Config(config_args) => {
            manage_config(config_args, &config)?;
        }
    }

    Ok(())
}

/// Flips to `true` on Ctrl-C
fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
        }
        let _ = tx.send(true);
    });
    rx
}

async fn bind(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))
}

/// Loopback URL of a listener, for services in the same process
fn local_url(listener: &TcpListener) -> Result<String> {
    let port = listener.local_addr()?.port();
    Ok(format!("http://127.0.0.1:{port}"))
}

/// Dispatch worker over `queue`, calling the executor at `executor_url`
fn build_dispatcher(
    config: &AppConfig,
    queue: Arc<JobQueue>,
    executor_url: Option<&str>,
) -> Result<Dispatcher> {
    let settings = &config.dispatcher;
    let coordinator = Arc::new(HttpCoordinator::from_config(&config.coordinator)?);

    let executor = match executor_url {
        Some(url) => {
            let client = ServiceClient::new(url, settings.executor_timeout_secs)
                .context("Failed to build executor client")?;
            Some(Arc::new(HttpExecutor::new(client)) as Arc<dyn ExecutorEndpoint>)
        }
        None => {
            warn!("No executor configured, shard jobs will be skipped");
            None
        }
    };

    Ok(
        Dispatcher::new(queue, coordinator, executor, settings.max_concurrent)
            .with_retry(RetryPolicy::new(
                settings.max_attempts,
                Duration::from_millis(settings.backoff_ms),
            ))
            .with_poll_interval(Duration::from_secs(settings.poll_interval_secs.max(1))),
    )
}

fn open_queue(config: &AppConfig) -> Result<Arc<JobQueue>> {
    let path = config.dispatcher.queue_path();
    let queue = JobQueue::open(&path)
        .with_context(|| format!("Failed to open queue: {}", path.display()))?;
    info!("Queue at {} holds {} tasks", path.display(), queue.len()?);
    Ok(Arc::new(queue))
}

async fn run_coordinator(config: &AppConfig) -> Result<()> {
    let service = CoordinatorService::build(config, None).await?;
    let listener = bind(&config.coordinator.bind).await?;
    service.serve(listener, shutdown_signal()).await
}

async fn run_dispatcher(config: &AppConfig) -> Result<()> {
    let queue = open_queue(config)?;
    let dispatcher = build_dispatcher(
        config,
        queue.clone(),
        config.dispatcher.executor_url.as_deref(),
    )?;
    let listener = bind(&config.dispatcher.bind).await?;
    let shutdown = shutdown_signal();

    let worker = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { dispatcher.run(shutdown).await })
    };
    api::serve(
        "Dispatcher",
        listener,
        dispatch::router(DispatchState { queue }),
        api::wait_for_shutdown(shutdown),
    )
    .await?;
    worker.await.context("Dispatcher worker panicked")?;
    Ok(())
}

async fn run_executor(config: &AppConfig, config_path: Option<&str>) -> Result<()> {
    let service = ExecutorService::build(config, config_path)?;
    let listener = bind(&config.executor.bind).await?;
    service.serve(listener, shutdown_signal()).await
}

/// Coordinator, dispatcher and executor sharing one queue
async fn run_standalone(mut config: AppConfig, config_path: Option<&str>) -> Result<()> {
    let coordinator_listener = bind(&config.coordinator.bind).await?;
    let executor_listener = bind(&config.executor.bind).await?;
    config.coordinator.url = local_url(&coordinator_listener)?;
    let executor_url = match &config.dispatcher.executor_url {
        Some(url) => url.clone(),
        None => local_url(&executor_listener)?,
    };
    info!(
        "Standalone: coordinator at {}, executor at {}",
        config.coordinator.url, executor_url
    );

    let queue = open_queue(&config)?;
    let enqueuer: Arc<dyn Enqueuer> = Arc::new(LocalEnqueuer::new(queue.clone()));
    let coordinator = CoordinatorService::build(&config, Some(enqueuer)).await?;
    let executor = ExecutorService::build(&config, config_path)?;
    let dispatcher = build_dispatcher(&config, queue, Some(&executor_url))?;

    let shutdown = shutdown_signal();
    let worker = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { dispatcher.run(shutdown).await })
    };
    let (coordinator, executor) = tokio::join!(
        coordinator.serve(coordinator_listener, shutdown.clone()),
        executor.serve(executor_listener, shutdown),
    );
    worker.await.context("Dispatcher worker panicked")?;
    coordinator?;
    executor
}

fn show_plan(args: cli::PlanArgs) -> Result<()> {
    let shard_count = dispatch::resolve_shard_count(args.shards);
    let jobs = dispatch::plan(args.run_id, shard_count);

    match args.format.as_str() {
        "json" => println!("{}", serde_json::to_string_pretty(&jobs)?),
        "table" => {
            println!("Run {} in {} shards\n", args.run_id, jobs.len());
            println!("{:>6}  {:>6}  {}", "SHARD", "TOTAL", "KEY");
            println!("{:-<40}", "");
            for job in &jobs {
                println!("{:>6}  {:>6}  {}", job.shard_index, job.shard_total, job.key());
            }
        }
        other => anyhow::bail!("Unknown format: {other}. Use 'table' or 'json'."),
    }
    Ok(())
}

fn manage_config(args: cli::ConfigArgs, effective: &AppConfig) -> Result<()> {
    match args.action {
        cli::ConfigAction::Show { format } => {
            let output = match format.as_str() {
                "json" => serde_json::to_string_pretty(effective)?,
                "yaml" => serde_yaml::to_string(effective)?,
                other => anyhow::bail!("Unknown format: {other}. Use 'yaml' or 'json'."),
            };
            println!("{output}");
        }

        cli::ConfigAction::Init { output, force } => {
            let path = Path::new(&output);
            if path.exists() && !force {
                anyhow::bail!(
                    "Configuration file already exists: {output}. Use --force to overwrite."
                );
            }
            ConfigFile::example().save(path)?;
            println!("Configuration file created: {output}");
        }

        cli::ConfigAction::Validate { file } => {
            let path = match file {
                Some(file) => file,
                None => ConfigFile::find()
                    .map(|p| p.to_string_lossy().into_owned())
                    .ok_or_else(|| anyhow::anyhow!("No configuration file found"))?,
            };
            match ConfigFile::load(&path) {
                Ok(_) => println!("Configuration file is valid: {path}"),
                Err(e) => {
                    println!("Configuration file is invalid: {path}");
                    println!("  Error: {e:#}");
                    return Err(e);
                }
            }
        }

        cli::ConfigAction::Env => config::print_env_help(),
    }

    Ok(())
}
