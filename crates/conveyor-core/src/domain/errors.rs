//! Errors - Run Store のエラー型
//!
//! Lost claim races are not errors: `claim_next` simply returns `None`.
//! `ClaimMismatch` is the staleness signal the executor reacts to by
//! abandoning its work.

use thiserror::Error;

use super::ids::{AtomId, JobId, RunId, TaskId, TaskRunId};
use super::state::{RunStatus, TaskStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    /// The task is no longer claimed by the caller.
    #[error("task {task_id} claim mismatch: expected owner {expected}, found {}", actual.as_deref().unwrap_or("<none>"))]
    ClaimMismatch {
        task_id: TaskId,
        expected: String,
        actual: Option<String>,
    },

    /// Lease renewal found no row owned by the caller.
    #[error("task run {task_run_id} is no longer claimed by {owner}")]
    LeaseLost { task_run_id: TaskRunId, owner: String },

    #[error("job run {0} not found")]
    RunNotFound(RunId),

    #[error("task {task_id} not found in run {run_id}")]
    TaskNotFound { run_id: RunId, task_id: TaskId },

    #[error("atom {0} not found")]
    AtomNotFound(AtomId),

    #[error("job {0} has no tasks")]
    EmptyJob(JobId),

    /// Terminal states are write-once.
    #[error("task {task_id} is already {status}")]
    TaskAlreadyTerminal { task_id: TaskId, status: TaskStatus },

    #[error("job run {0} is already {1}")]
    RunAlreadyTerminal(RunId, RunStatus),

    /// `complete` was called before every TaskRun reached a terminal state.
    #[error("job run {run_id} still has {remaining} non-terminal task(s)")]
    RunHasActiveTasks { run_id: RunId, remaining: usize },

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("decode {column}: {message}")]
    Decode { column: &'static str, message: String },

    #[error("run store connection lock poisoned")]
    Poisoned,

    /// The blocking-pool task running a store call panicked or was cancelled.
    #[error("run store task failed: {0}")]
    Blocking(String),
}

impl StoreError {
    /// True when the caller lost ownership of the task it was working on.
    pub fn is_claim_mismatch(&self) -> bool {
        matches!(
            self,
            StoreError::ClaimMismatch { .. } | StoreError::LeaseLost { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn claim_mismatch_message_names_both_owners() {
        let err = StoreError::ClaimMismatch {
            task_id: TaskId::from_ulid(Ulid::nil()),
            expected: "node-a".into(),
            actual: Some("node-b".into()),
        };
        let msg = err.to_string();
        assert!(msg.contains("node-a"));
        assert!(msg.contains("node-b"));
        assert!(err.is_claim_mismatch());
    }

    #[test]
    fn unclaimed_task_renders_placeholder() {
        let err = StoreError::ClaimMismatch {
            task_id: TaskId::from_ulid(Ulid::nil()),
            expected: "node-a".into(),
            actual: None,
        };
        assert!(err.to_string().ends_with("<none>"));
    }

    #[test]
    fn persistence_errors_are_not_mismatches() {
        assert!(!StoreError::Poisoned.is_claim_mismatch());
    }
}
