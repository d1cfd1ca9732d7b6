//! RunLauncher - JobRun を開始（または再開）し、完了まで見届ける
//!
//! Launching only registers TaskRuns; execution happens on whichever nodes
//! run a worker against the same store.

use std::collections::HashMap;
use std::time::Duration;

use tracing::{info, warn};

use crate::dag::DependencyGraph;
use crate::domain::{
    AtomDefinition, AtomId, FailurePolicy, JobId, JobRun, RunId, RunSnapshot, StoreError,
    TaskStatus,
};
use crate::error::ConveyorError;
use crate::signal::Shutdown;
use crate::store::RunStore;

#[derive(Clone)]
pub struct RunLauncher {
    store: RunStore,
    resume_resets_in_flight: bool,
}

impl RunLauncher {
    pub fn new(store: RunStore) -> Self {
        Self {
            store,
            resume_resets_in_flight: false,
        }
    }

    pub fn resume_resets_in_flight(mut self, reset: bool) -> Self {
        self.resume_resets_in_flight = reset;
        self
    }

    /// Register every task of `job_id` in a JobRun and return its id.
    ///
    /// A job that already has a running JobRun resumes it; registration is
    /// idempotent so tasks registered earlier keep their state.
    pub fn launch(&self, job_id: JobId) -> Result<RunId, ConveyorError> {
        let tasks = self.store.list_tasks(job_id)?;
        if tasks.is_empty() {
            return Err(StoreError::EmptyJob(job_id).into());
        }
        let edges = self.store.list_edges(job_id)?;
        let graph = DependencyGraph::from_definitions(&tasks, &edges);
        graph.topological_order()?;

        let mut atoms: HashMap<AtomId, AtomDefinition> = HashMap::new();
        for task in &tasks {
            if !atoms.contains_key(&task.atom_id) {
                atoms.insert(task.atom_id, self.store.get_atom(task.atom_id)?);
            }
        }

        let run = match self.store.find_running(job_id)? {
            Some(run) => {
                info!(run_id = %run.id, job_id = %job_id, "resuming running job run");
                if self.resume_resets_in_flight {
                    self.store.reset_in_flight_tasks(run.id)?;
                }
                run
            }
            None => self.store.start(job_id)?,
        };

        for task in &tasks {
            let atom = atoms
                .get(&task.atom_id)
                .ok_or(StoreError::AtomNotFound(task.atom_id))?;
            self.store
                .register_task(run.id, task, atom, graph.indegree(task.id))?;
        }
        info!(
            run_id = %run.id,
            job_id = %job_id,
            tasks = tasks.len(),
            source = ?graph.source(),
            "job run tasks registered"
        );
        Ok(run.id)
    }

    /// Poll the run until it can be completed.
    ///
    /// - every task terminal: complete the run (failed when any task failed)
    /// - a failure left nothing runnable: `RunHalted` / `RunStalled`, the run
    ///   stays `running`
    pub async fn await_completion(
        &self,
        run_id: RunId,
        policy: FailurePolicy,
        poll: Duration,
        shutdown: &Shutdown,
    ) -> Result<JobRun, ConveyorError> {
        let poll = if poll.is_zero() {
            Duration::from_secs(1)
        } else {
            poll
        };

        // a stall must be seen twice: fail and skip writes land separately
        let mut stalled = false;
        loop {
            let snapshot = self.store.blocking(move |store| store.get(run_id)).await?;
            if snapshot.run.status.is_terminal() {
                return Ok(snapshot.run);
            }

            match self.check_progress(&snapshot, policy) {
                Progress::Complete(error) => match self
                    .store
                    .blocking(move |store| store.complete(run_id, error.as_deref()))
                    .await
                {
                    Ok(run) => return Ok(run),
                    // another launcher got there first; re-read
                    Err(StoreError::RunAlreadyTerminal(..)) => continue,
                    Err(err) => return Err(err.into()),
                },
                Progress::Stuck(err) if stalled => {
                    warn!(run_id = %run_id, error = %err, "job run cannot make progress");
                    return Err(err);
                }
                Progress::Stuck(_) => stalled = true,
                Progress::Waiting => stalled = false,
            }

            tokio::select! {
                biased;
                _ = shutdown.triggered() => return Err(ConveyorError::Interrupted(run_id)),
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }

    fn check_progress(&self, snapshot: &RunSnapshot, policy: FailurePolicy) -> Progress {
        let run_id = snapshot.run.id;
        let counts = snapshot.counts();

        if counts.terminal() == counts.total() {
            let error = (counts.failed > 0)
                .then(|| format!("run {run_id} completed with {} failed task(s)", counts.failed));
            return Progress::Complete(error);
        }

        let runnable = snapshot
            .tasks
            .iter()
            .any(|t| t.status == TaskStatus::Pending && t.outstanding_predecessors == 0);
        if counts.failed == 0 || counts.running > 0 || runnable {
            return Progress::Waiting;
        }

        let err = match policy {
            FailurePolicy::Halt => ConveyorError::RunHalted {
                run_id,
                failed: counts.failed,
            },
            FailurePolicy::Continue => ConveyorError::RunStalled {
                run_id,
                failed: counts.failed,
                unresolved: counts.total() - counts.terminal(),
            },
        };
        Progress::Stuck(err)
    }
}

enum Progress {
    Complete(Option<String>),
    Stuck(ConveyorError),
    Waiting,
}
