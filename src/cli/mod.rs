//! CLI argument parsing
//!
//! One binary launches every service role.

use clap::{Parser, Subcommand};

/// Sharded test run orchestration
#[derive(Parser, Debug)]
#[command(name = "shardrun")]
#[command(version)]
#[command(about = "Coordinate, dispatch and execute sharded test runs")]
#[command(long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Configuration file (YAML or JSON)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the run API and aggregate shard results
    Coordinator(ServiceArgs),

    /// Serve the enqueue endpoint and dispatch queued runs
    Dispatcher(ServiceArgs),

    /// Serve the execute endpoint and run shard jobs
    Executor(ServiceArgs),

    /// Run one shard job described by SHARDRUN_* variables
    #[command(hide = true)]
    RunShard,

    /// Run coordinator, dispatcher and executor in one process
    Standalone,

    /// Print the shard plan for a run
    Plan(PlanArgs),

    /// Inspect or create configuration
    Config(ConfigArgs),
}

/// Arguments shared by the service commands
#[derive(Parser, Debug)]
pub struct ServiceArgs {
    /// Listen address, overriding the configured one
    #[arg(short, long)]
    pub bind: Option<String>,
}

#[derive(Parser, Debug)]
pub struct PlanArgs {
    /// Run identifier
    #[arg(short, long)]
    pub run_id: u64,

    /// Configured shard count; unset plans a single shard
    #[arg(short, long)]
    pub shards: Option<u32>,

    /// Output format (table, json)
    #[arg(short, long, default_value = "table")]
    pub format: String,
}

#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the effective configuration
    Show {
        /// Output format (yaml, json)
        #[arg(short, long, default_value = "yaml")]
        format: String,
    },

    /// Write an example configuration file
    Init {
        /// Output path
        #[arg(default_value = "./shardrun.yaml")]
        output: String,

        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Check a configuration file
    Validate {
        /// File to check; defaults to the first standard location
        file: Option<String>,
    },

    /// List supported environment variables
    Env,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_args() {
        let args = Args::parse_from([
            "shardrun",
            "--config",
            "/etc/shardrun.yaml",
            "executor",
            "--bind",
            "0.0.0.0:9002",
        ]);
        assert_eq!(args.config.as_deref(), Some("/etc/shardrun.yaml"));
        match args.command {
            Command::Executor(service) => {
                assert_eq!(service.bind.as_deref(), Some("0.0.0.0:9002"));
            }
            _ => panic!("Expected Executor command"),
        }
    }

    #[test]
    fn test_plan_args() {
        let args = Args::parse_from(["shardrun", "plan", "--run-id", "42", "--shards", "4", "-v"]);
        assert!(args.verbose);
        match args.command {
            Command::Plan(plan) => {
                assert_eq!(plan.run_id, 42);
                assert_eq!(plan.shards, Some(4));
                assert_eq!(plan.format, "table");
            }
            _ => panic!("Expected Plan command"),
        }
    }

    #[test]
    fn test_config_init_default_path() {
        let args = Args::parse_from(["shardrun", "config", "init"]);
        match args.command {
            Command::Config(ConfigArgs {
                action: ConfigAction::Init { output, force },
            }) => {
                assert_eq!(output, "./shardrun.yaml");
                assert!(!force);
            }
            _ => panic!("Expected Config init"),
        }
    }

    #[test]
    fn test_run_shard_takes_no_arguments() {
        let args = Args::parse_from(["shardrun", "run-shard"]);
        assert!(matches!(args.command, Command::RunShard));
        assert!(Args::try_parse_from(["shardrun", "run-shard", "extra"]).is_err());
    }
}
