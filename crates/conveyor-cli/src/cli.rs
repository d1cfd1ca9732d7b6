//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use conveyor_core::WorkerConfig;
use conveyor_core::app::parse_node_labels;
use conveyor_core::config::{parse_duration, parse_optional_duration};
use conveyor_core::domain::{FailurePolicy, JobId, RunId};

/// Command-line arguments for `conveyor`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "conveyor",
    version,
    about = "Claim and execute DAG tasks across worker nodes sharing one run store.",
    long_about = None
)]
pub struct CliArgs {
    /// Worker config file (TOML). `CONVEYOR_*` variables override it.
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Run store database file.
    #[arg(long, global = true, value_name = "PATH")]
    pub db: Option<PathBuf>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `CONVEYOR_LOG` (an env-filter directive) or `info` is used.
    #[arg(long, global = true, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run a worker node until interrupted (twice to abort running tasks).
    Worker(WorkerArgs),

    /// Start (or resume) a run of a job and print its id.
    Launch(LaunchArgs),

    /// Print a node's claim summary as JSON.
    Status {
        /// Node to report on; defaults to the configured node id.
        #[arg(long, value_name = "ID")]
        node_id: Option<String>,
    },

    /// Print a run snapshot as JSON.
    Run {
        #[arg(value_name = "RUN_ID")]
        run_id: RunId,
    },
}

#[derive(Debug, Clone, Args)]
pub struct WorkerArgs {
    #[arg(long, value_name = "ID")]
    pub node_id: Option<String>,

    /// Node labels as `k=v,k2=v2`.
    #[arg(long, value_name = "LABELS")]
    pub labels: Option<String>,

    #[arg(long, value_name = "N")]
    pub pool_size: Option<usize>,

    #[arg(long, value_name = "DURATION")]
    pub poll_interval: Option<String>,

    #[arg(long, value_name = "DURATION")]
    pub lease_ttl: Option<String>,

    /// Per-task timeout; `0` disables it.
    #[arg(long, value_name = "DURATION")]
    pub task_timeout: Option<String>,

    /// `halt` or `continue`.
    #[arg(long, value_name = "POLICY")]
    pub failure_policy: Option<String>,
}

#[derive(Debug, Clone, Args)]
pub struct LaunchArgs {
    #[arg(value_name = "JOB_ID")]
    pub job_id: JobId,

    /// Block until the run completes (or halts).
    #[arg(long)]
    pub wait: bool,

    /// When resuming, return in-flight tasks to pending first.
    #[arg(long)]
    pub reset_in_flight: bool,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl WorkerArgs {
    /// Flags win over file and environment values.
    pub fn apply(&self, config: &mut WorkerConfig) -> Result<()> {
        if let Some(node_id) = &self.node_id {
            config.node_id = node_id.clone();
        }
        if let Some(labels) = &self.labels {
            config.node_labels = parse_node_labels(labels);
        }
        if let Some(pool_size) = self.pool_size {
            config.pool_size = pool_size;
        }
        if let Some(raw) = &self.poll_interval {
            config.poll_interval = parse_duration(raw)?;
        }
        if let Some(raw) = &self.lease_ttl {
            config.lease_ttl = parse_duration(raw)?;
        }
        if let Some(raw) = &self.task_timeout {
            config.task_timeout = parse_optional_duration(raw)?;
        }
        if let Some(raw) = &self.failure_policy {
            config.failure_policy = FailurePolicy::normalize(raw);
        }
        Ok(())
    }
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
