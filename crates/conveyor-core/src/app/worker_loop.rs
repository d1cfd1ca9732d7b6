//! WorkerLoop - claim → submit ループ
//!
//! # フロー
//! 1. (claimer が対応していれば) 期限切れ lease を回収
//! 2. `TaskClaimer::claim_next()` で 1 件 claim
//! 3. 空振り / エラーなら poll 間隔だけ待つ（shutdown で即座に起きる）
//! 4. claim できたら `SlotPool` に投入（空きスロットを待つ）
//!
//! shutdown 後は claim を止め、実行中のタスクがすべて終わるまで待つ。
//! 実行中のタスクには shutdown ではなく別の abort シグナルを渡す。

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::app::pool::SlotPool;
use crate::domain::TaskRun;
use crate::ports::{ExecutorError, TaskClaimer, TaskExecutor};
use crate::signal::{Shutdown, ShutdownTrigger};

/// Poll interval used when the configured one is zero.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct WorkerLoop {
    claimer: Arc<dyn TaskClaimer>,
    executor: Arc<dyn TaskExecutor>,
    pool_size: usize,
    poll_interval: Duration,
}

impl WorkerLoop {
    pub fn new(
        claimer: Arc<dyn TaskClaimer>,
        executor: Arc<dyn TaskExecutor>,
        pool_size: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            claimer,
            executor,
            pool_size: pool_size.max(1),
            poll_interval: if poll_interval.is_zero() {
                DEFAULT_POLL_INTERVAL
            } else {
                poll_interval
            },
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Run until `shutdown` fires, then wait for in-flight executions.
    pub async fn run(&self, shutdown: Shutdown, abort: Shutdown) {
        let mut pool = SlotPool::new(self.pool_size);
        info!(slots = self.pool_size, poll = ?self.poll_interval, "worker loop started");

        loop {
            if shutdown.is_triggered() {
                break;
            }

            if let Some(reclaimer) = self.claimer.as_reclaimer()
                && let Err(err) = reclaimer.reclaim_expired().await
            {
                warn!(error = %err, "reclaiming expired leases failed");
            }

            let claimed = tokio::select! {
                biased;
                _ = shutdown.triggered() => break,
                claimed = self.claimer.claim_next() => claimed,
            };

            let task = match claimed {
                Ok(Some(task)) => task,
                Ok(None) => {
                    if !self.idle(&shutdown).await {
                        break;
                    }
                    continue;
                }
                Err(err) => {
                    error!(error = %err, "claiming next task failed");
                    if !self.idle(&shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            let run_id = task.job_run_id;
            let task_id = task.task_id;
            let work = execute_one(Arc::clone(&self.executor), task, abort.clone());
            if !pool.submit(work, &shutdown).await {
                // lease will expire and another node (or a restart) picks it up
                info!(
                    run_id = %run_id,
                    task_id = %task_id,
                    "shutdown while waiting for a slot; releasing claim to lease expiry"
                );
                break;
            }
        }

        info!(in_flight = pool.in_flight(), "worker loop draining");
        pool.drain().await;
        info!("worker loop stopped");
    }

    /// Spawn the loop onto the runtime.
    pub fn spawn(self) -> WorkerHandle {
        let (shutdown_tx, shutdown) = ShutdownTrigger::new();
        let (abort_tx, abort) = ShutdownTrigger::new();
        let join = tokio::spawn(async move { self.run(shutdown, abort).await });
        WorkerHandle {
            shutdown: shutdown_tx,
            abort: abort_tx,
            join,
        }
    }

    /// Sleep one poll interval. False when shutdown interrupted the sleep.
    async fn idle(&self, shutdown: &Shutdown) -> bool {
        tokio::select! {
            biased;
            _ = shutdown.triggered() => false,
            _ = tokio::time::sleep(self.poll_interval) => true,
        }
    }
}

async fn execute_one(executor: Arc<dyn TaskExecutor>, task: TaskRun, abort: Shutdown) {
    let run_id = task.job_run_id;
    let task_id = task.task_id;
    match executor.execute(task, abort).await {
        Ok(()) => debug!(run_id = %run_id, task_id = %task_id, "task execution finished"),
        Err(ExecutorError::Aborted(_)) => {
            info!(run_id = %run_id, task_id = %task_id, "task execution aborted")
        }
        Err(err) => error!(run_id = %run_id, task_id = %task_id, error = %err, "task execution failed"),
    }
}

/// Handle of a spawned [`WorkerLoop`].
/// - `request_shutdown()`: claim を止めて実行中タスクの完了を待つ
/// - `abort()`: 実行中タスクの監視も打ち切る
pub struct WorkerHandle {
    shutdown: ShutdownTrigger,
    abort: ShutdownTrigger,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn request_shutdown(&self) {
        self.shutdown.trigger();
    }

    pub fn abort(&self) {
        self.shutdown.trigger();
        self.abort.trigger();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the loop without signalling it.
    pub async fn join(self) {
        if let Err(err) = self.join.await {
            error!(error = %err, "worker loop panicked");
        }
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        self.join().await;
    }
}
