//! Subcommand implementations.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use conveyor_core::WorkerConfig;
use conveyor_core::app::{Claimer, ExecutorOptions, RunLauncher, RuntimeExecutor, WorkerLoop};
use conveyor_core::domain::{RunId, RunStatus};
use conveyor_core::signal::{Shutdown, ShutdownTrigger};
use conveyor_core::store::RunStore;
use tracing::{info, warn};

use crate::cli::{CliArgs, Command, LaunchArgs, WorkerArgs};
use crate::engine;

pub async fn run(args: CliArgs) -> Result<()> {
    let mut config = WorkerConfig::load(args.config.as_deref()).context("loading worker config")?;
    if let Some(db) = &args.db {
        config.database_path = db.clone();
    }

    match args.command {
        Command::Worker(worker) => run_worker(config, &worker).await,
        Command::Launch(launch) => run_launch(config, &launch).await,
        Command::Status { node_id } => {
            let store = open_store(&config)?;
            let node_id = node_id.unwrap_or_else(|| config.node_id.clone());
            let status = store.worker_status(&node_id)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Command::Run { run_id } => print_run(&config, run_id),
    }
}

fn open_store(config: &WorkerConfig) -> Result<RunStore> {
    RunStore::open_default(&config.database_path)
        .with_context(|| format!("opening run store at {:?}", config.database_path))
}

async fn run_worker(mut config: WorkerConfig, args: &WorkerArgs) -> Result<()> {
    args.apply(&mut config)?;
    let store = open_store(&config)?;

    let claimer = Claimer::new(
        store.clone(),
        &config.node_id,
        config.node_labels.clone(),
        config.lease_ttl,
    );
    let options = ExecutorOptions {
        node_id: claimer.node_id().to_string(),
        lease_ttl: claimer.lease_ttl(),
        ..config.executor_options()
    };
    info!(
        node = %options.node_id,
        labels = ?claimer.node_labels(),
        lease_ttl = ?options.lease_ttl,
        pool_size = config.pool_size,
        failure_policy = %options.failure_policy,
        db = ?config.database_path,
        "starting worker node"
    );

    let executor = RuntimeExecutor::new(store, engine::default_registry(), options);
    let worker = WorkerLoop::new(
        Arc::new(claimer),
        Arc::new(executor),
        config.pool_size,
        config.poll_interval,
    );

    let (shutdown, abort) = interrupt_signals();
    worker.run(shutdown, abort).await;
    Ok(())
}

async fn run_launch(config: WorkerConfig, args: &LaunchArgs) -> Result<()> {
    let store = open_store(&config)?;
    let launcher = RunLauncher::new(store)
        .resume_resets_in_flight(args.reset_in_flight || config.resume_resets_in_flight);
    let run_id = launcher.launch(args.job_id)?;
    println!("{run_id}");

    if !args.wait {
        return Ok(());
    }

    let (shutdown, _abort) = interrupt_signals();
    let run = launcher
        .await_completion(run_id, config.failure_policy, config.poll_interval, &shutdown)
        .await?;
    println!("{}", serde_json::to_string_pretty(&run)?);
    if run.status == RunStatus::Failed {
        bail!(
            "run {run_id} failed: {}",
            run.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

fn print_run(config: &WorkerConfig, run_id: RunId) -> Result<()> {
    let store = open_store(config)?;
    let snapshot = store.get(run_id)?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

/// First Ctrl-C: graceful shutdown. Second: abort in-flight executions.
fn interrupt_signals() -> (Shutdown, Shutdown) {
    let (shutdown_tx, shutdown) = ShutdownTrigger::new();
    let (abort_tx, abort) = ShutdownTrigger::new();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        info!("interrupt received; draining in-flight tasks (interrupt again to abort)");
        shutdown_tx.trigger();

        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("second interrupt; aborting in-flight tasks");
        abort_tx.trigger();
    });

    (shutdown, abort)
}
