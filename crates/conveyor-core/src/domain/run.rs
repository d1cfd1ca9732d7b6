//! JobRun / TaskRun records.
//!
//! Design:
//! - These are read models: the run store builds them from rows and is the
//!   only component that writes the rows back.
//! - Claim fields live on the TaskRun itself; there is no separate lease table.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::definition::{EngineKind, parse_command};
use super::ids::{AtomId, JobId, RunId, TaskId, TaskRunId};
use super::state::{RunStatus, TaskStatus};

/// One execution attempt of a job's DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRun {
    pub id: RunId,
    pub job_id: JobId,
    pub status: RunStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub started_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// One execution attempt of one DAG node within a JobRun.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRun {
    pub id: TaskRunId,
    pub job_run_id: RunId,
    pub task_id: TaskId,
    pub atom_id: AtomId,
    pub engine: EngineKind,
    pub image: String,

    /// Stored command payload (see [`parse_command`]).
    pub command: String,

    pub status: TaskStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Engine-assigned container id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_id: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    /// Node that currently holds (or last held) the claim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_expires_at: Option<DateTime<Utc>>,

    pub claim_attempt: u32,
    pub outstanding_predecessors: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRun {
    pub fn argv(&self) -> Vec<String> {
        parse_command(&self.command)
    }

    /// Name for the atom of the current attempt; retries get distinct names.
    pub fn atom_name(&self) -> String {
        if self.claim_attempt > 0 {
            format!("{}-attempt{}", self.task_id.to_storage(), self.claim_attempt)
        } else {
            self.task_id.to_storage()
        }
    }
}

/// Full read view of a run: the JobRun plus all of its TaskRuns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run: JobRun,
    pub tasks: Vec<TaskRun>,
}

/// Per-status task counts of a snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl TaskCounts {
    pub fn terminal(&self) -> usize {
        self.succeeded + self.failed + self.skipped
    }

    pub fn total(&self) -> usize {
        self.terminal() + self.pending + self.running
    }
}

impl RunSnapshot {
    pub fn counts(&self) -> TaskCounts {
        let mut counts = TaskCounts::default();
        for task in &self.tasks {
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Running => counts.running += 1,
                TaskStatus::Succeeded => counts.succeeded += 1,
                TaskStatus::Failed => counts.failed += 1,
                TaskStatus::Skipped => counts.skipped += 1,
            }
        }
        counts
    }

    pub fn task(&self, task_id: TaskId) -> Option<&TaskRun> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }
}

/// Expected owner of a claim-aware transition.
///
/// `Any` is the explicit wildcard for callers (admin tooling, tests) that do
/// not hold a claim; `Owner` requires `claimed_by` to match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimGuard {
    Any,
    Owner(String),
}

impl ClaimGuard {
    pub fn owner(node: impl Into<String>) -> Self {
        ClaimGuard::Owner(node.into())
    }
}
