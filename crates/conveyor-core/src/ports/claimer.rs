//! Claimer / Executor ports - Worker Pool が依存する 2 つの能力
//!
//! The pool never touches the run store directly: it asks a `TaskClaimer`
//! for work and hands each claim to a `TaskExecutor`.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{StoreError, TaskId, TaskRun};
use crate::ports::engine::EngineError;
use crate::signal::Shutdown;

/// Source of claimed tasks for one node identity.
#[async_trait]
pub trait TaskClaimer: Send + Sync {
    /// Claim the oldest ready task, or `None` when nothing is claimable.
    async fn claim_next(&self) -> Result<Option<TaskRun>, StoreError>;

    /// Optional lease-recovery capability, probed once per poll iteration.
    fn as_reclaimer(&self) -> Option<&dyn ExpiredReclaimer> {
        None
    }
}

/// Returns expired claims to the pending pool.
#[async_trait]
pub trait ExpiredReclaimer: Send + Sync {
    /// Number of tasks put back to `pending`.
    async fn reclaim_expired(&self) -> Result<usize, StoreError>;
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("task {task_id} timed out after {after:?}")]
    TimedOut { task_id: TaskId, after: Duration },

    #[error("task {0} execution aborted")]
    Aborted(TaskId),
}

/// Task body run inside one pool slot.
///
/// `abort` is distinct from the pool's graceful shutdown: a draining pool
/// lets executions finish, an abort tells them to stop monitoring now.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: TaskRun, abort: Shutdown) -> Result<(), ExecutorError>;
}
