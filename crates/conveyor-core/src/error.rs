use thiserror::Error;

use crate::config::ConfigError;
use crate::dag::GraphError;
use crate::domain::{RunId, StoreError};
use crate::ports::{EngineError, ExecutorError};

/// Crate-level error: everything a caller of the launcher or the worker
/// wiring can run into.
#[derive(Debug, Error)]
pub enum ConveyorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    /// A failure left the run with nothing runnable; the run stays `running`.
    #[error("run {run_id} halted after {failed} failed task(s)")]
    RunHalted { run_id: RunId, failed: usize },

    /// `continue` policy, but some tasks can never resolve.
    #[error("run {run_id} has {failed} failed task(s) and {unresolved} unresolved pending task(s)")]
    RunStalled {
        run_id: RunId,
        failed: usize,
        unresolved: usize,
    },

    #[error("interrupted while waiting for run {0}")]
    Interrupted(RunId),
}
