//! JobRun / TaskRun transitions.
//!
//! Every claim-aware transition takes a [`ClaimGuard`]:
//! - `ClaimGuard::Owner(node)` re-checks `claimed_by` inside the transaction
//!   and fails with `ClaimMismatch` without mutating anything
//! - `ClaimGuard::Any` skips the ownership check
//!
//! Terminal task states are write-once regardless of the guard.

use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use tracing::{debug, info};

use super::RunStore;
use super::catalog::load_graph;
use super::rows::{
    JOB_RUN_COLUMNS, TASK_RUN_COLUMNS, encode_selector, job_run_from_row, task_run_from_row,
};
use crate::domain::{
    AtomDefinition, ClaimGuard, JobId, JobRun, RunId, RunSnapshot, RunStatus, StoreError,
    TaskDefinition, TaskId, TaskRun, TaskStatus,
};

/// Engine results that count as success.
const SUCCESS_RESULTS: [&str; 3] = ["success", "ok", ""];

const NOT_TERMINAL: &str = "status NOT IN ('succeeded', 'failed', 'skipped')";

pub(crate) fn is_success_result(result: &str) -> bool {
    SUCCESS_RESULTS.contains(&result)
}

impl RunStore {
    /// Create a new running JobRun for `job_id`.
    pub fn start(&self, job_id: JobId) -> Result<JobRun, StoreError> {
        let run_id = self.ids.generate_run_id();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO job_runs (id, job_id, status, error, started_at, completed_at)
             VALUES (?1, ?2, ?3, NULL, ?4, NULL)",
            params![run_id, job_id, RunStatus::Running, self.now_ms()],
        )?;
        info!(run_id = %run_id, job_id = %job_id, "job run started");
        load_run(&conn, run_id)
    }

    /// Most recently started JobRun of the job that is still running.
    pub fn find_running(&self, job_id: JobId) -> Result<Option<JobRun>, StoreError> {
        let conn = self.lock()?;
        let run = conn
            .query_row(
                &format!(
                    "SELECT {JOB_RUN_COLUMNS} FROM job_runs
                     WHERE job_id = ?1 AND status = 'running'
                     ORDER BY started_at DESC, rowid DESC LIMIT 1"
                ),
                params![job_id],
                job_run_from_row,
            )
            .optional()?;
        Ok(run)
    }

    /// All runs of a job, newest first.
    pub fn list_runs(&self, job_id: JobId) -> Result<Vec<JobRun>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_RUN_COLUMNS} FROM job_runs WHERE job_id = ?1
             ORDER BY started_at DESC, rowid DESC"
        ))?;
        let rows = stmt.query_map(params![job_id], job_run_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Insert a pending TaskRun with its initial dependency count.
    ///
    /// Idempotent per (run, task): a second registration returns the existing
    /// row untouched.
    pub fn register_task(
        &self,
        run_id: RunId,
        task: &TaskDefinition,
        atom: &AtomDefinition,
        outstanding: u32,
    ) -> Result<TaskRun, StoreError> {
        let selector = encode_selector(&task.node_selector)?;
        let now = self.now_ms();
        let task_run_id = self.ids.generate_task_run_id();

        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        load_run(&tx, run_id)?;
        let inserted = tx.execute(
            "INSERT INTO task_runs (
               id, job_run_id, task_id, atom_id, engine, image, command, status,
               node_selector, claim_attempt, outstanding_predecessors, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8, 0, ?9, ?10, ?10)
             ON CONFLICT(job_run_id, task_id) DO NOTHING",
            params![
                task_run_id,
                run_id,
                task.id,
                task.atom_id,
                atom.engine,
                atom.image,
                atom.command,
                selector,
                outstanding,
                now
            ],
        )?;
        let row = load_task(&tx, run_id, task.id)?;
        tx.commit()?;

        if inserted == 0 {
            debug!(run_id = %run_id, task_id = %task.id, "task already registered");
        }
        Ok(row)
    }

    /// Mark a task running with its engine-assigned runtime id.
    ///
    /// With an owner guard the task must be running under that owner.
    pub fn start_task(
        &self,
        run_id: RunId,
        task_id: TaskId,
        runtime_id: &str,
        guard: &ClaimGuard,
    ) -> Result<(), StoreError> {
        let now = self.now_ms();
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = load_task(&tx, run_id, task_id)?;
        check_guard(&current, guard)?;
        if let ClaimGuard::Owner(owner) = guard
            && current.status != TaskStatus::Running
        {
            return Err(mismatch(&current, owner));
        }
        check_not_terminal(&current)?;

        tx.execute(
            "UPDATE task_runs
             SET status = 'running', runtime_id = ?3, started_at = ?4, updated_at = ?4
             WHERE job_run_id = ?1 AND task_id = ?2",
            params![run_id, task_id, runtime_id, now],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Record an engine result.
    ///
    /// `success`, `ok` and the empty string mark the task succeeded and
    /// release one dependency of every direct successor. Any other result
    /// marks it failed with `task failed with result: <result>`.
    pub fn complete_task(
        &self,
        run_id: RunId,
        task_id: TaskId,
        result: &str,
        guard: &ClaimGuard,
    ) -> Result<TaskStatus, StoreError> {
        let now = self.now_ms();
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = load_task(&tx, run_id, task_id)?;
        check_guard(&current, guard)?;
        check_not_terminal(&current)?;

        if !is_success_result(result) {
            tx.execute(
                "UPDATE task_runs
                 SET status = 'failed', result = ?3, error = ?4, completed_at = ?5, updated_at = ?5
                 WHERE job_run_id = ?1 AND task_id = ?2",
                params![
                    run_id,
                    task_id,
                    result,
                    format!("task failed with result: {result}"),
                    now
                ],
            )?;
            tx.commit()?;
            return Ok(TaskStatus::Failed);
        }

        tx.execute(
            "UPDATE task_runs
             SET status = 'succeeded', result = ?3, completed_at = ?4, updated_at = ?4
             WHERE job_run_id = ?1 AND task_id = ?2",
            params![run_id, task_id, result, now],
        )?;

        let job_id = load_run(&tx, run_id)?.job_id;
        let graph = load_graph(&tx, job_id)?;
        for successor in graph.successors(task_id) {
            tx.execute(
                "UPDATE task_runs
                 SET outstanding_predecessors = CASE WHEN outstanding_predecessors > 0
                       THEN outstanding_predecessors - 1 ELSE 0 END,
                     updated_at = ?3
                 WHERE job_run_id = ?1 AND task_id = ?2",
                params![run_id, successor, now],
            )?;
        }
        tx.commit()?;
        Ok(TaskStatus::Succeeded)
    }

    /// Mark a task failed with `error`. Successors are left untouched.
    pub fn fail_task(
        &self,
        run_id: RunId,
        task_id: TaskId,
        error: &str,
        guard: &ClaimGuard,
    ) -> Result<(), StoreError> {
        let now = self.now_ms();
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = load_task(&tx, run_id, task_id)?;
        check_guard(&current, guard)?;
        check_not_terminal(&current)?;

        tx.execute(
            "UPDATE task_runs
             SET status = 'failed', error = ?3, completed_at = ?4, updated_at = ?4
             WHERE job_run_id = ?1 AND task_id = ?2",
            params![run_id, task_id, error, now],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Skip a pending task, recording `reason` as its error.
    ///
    /// Returns false (and changes nothing) when the task is not pending.
    pub fn skip_task(&self, run_id: RunId, task_id: TaskId, reason: &str) -> Result<bool, StoreError> {
        let now = self.now_ms();
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE task_runs
             SET status = 'skipped', error = ?3, completed_at = ?4, updated_at = ?4
             WHERE job_run_id = ?1 AND task_id = ?2 AND status = 'pending'",
            params![run_id, task_id, reason, now],
        )?;
        Ok(changed > 0)
    }

    /// Return every running task of the run to `pending`, dropping its claim.
    pub fn reset_in_flight_tasks(&self, run_id: RunId) -> Result<usize, StoreError> {
        let now = self.now_ms();
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE task_runs
             SET status = 'pending', runtime_id = NULL, started_at = NULL,
                 claimed_by = NULL, claim_expires_at = NULL, updated_at = ?2
             WHERE job_run_id = ?1 AND status = 'running'",
            params![run_id, now],
        )?;
        if changed > 0 {
            info!(run_id = %run_id, tasks = changed, "reset in-flight tasks");
        }
        Ok(changed)
    }

    /// Finish a JobRun: failed when `error` is given, succeeded otherwise.
    ///
    /// Refuses while any TaskRun is still pending or running.
    pub fn complete(&self, run_id: RunId, error: Option<&str>) -> Result<JobRun, StoreError> {
        let now = self.now_ms();
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let run = load_run(&tx, run_id)?;
        if run.status.is_terminal() {
            return Err(StoreError::RunAlreadyTerminal(run_id, run.status));
        }

        let remaining: i64 = tx.query_row(
            &format!("SELECT COUNT(*) FROM task_runs WHERE job_run_id = ?1 AND {NOT_TERMINAL}"),
            params![run_id],
            |row| row.get(0),
        )?;
        if remaining > 0 {
            return Err(StoreError::RunHasActiveTasks {
                run_id,
                remaining: remaining as usize,
            });
        }

        let status = match error {
            Some(_) => RunStatus::Failed,
            None => RunStatus::Succeeded,
        };
        tx.execute(
            "UPDATE job_runs SET status = ?2, error = ?3, completed_at = ?4 WHERE id = ?1",
            params![run_id, status, error, now],
        )?;
        let run = load_run(&tx, run_id)?;
        tx.commit()?;

        info!(run_id = %run_id, status = %status, "job run completed");
        Ok(run)
    }

    /// The JobRun plus all of its TaskRuns in creation order.
    pub fn get(&self, run_id: RunId) -> Result<RunSnapshot, StoreError> {
        let conn = self.lock()?;
        let run = load_run(&conn, run_id)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_RUN_COLUMNS} FROM task_runs WHERE job_run_id = ?1
             ORDER BY created_at ASC, rowid ASC"
        ))?;
        let rows = stmt.query_map(params![run_id], task_run_from_row)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?);
        }
        Ok(RunSnapshot { run, tasks })
    }

    pub fn get_task(&self, run_id: RunId, task_id: TaskId) -> Result<TaskRun, StoreError> {
        let conn = self.lock()?;
        load_task(&conn, run_id, task_id)
    }

    /// Every task reachable from `task_id` in the run's job, breadth-first.
    pub fn descendants(&self, run_id: RunId, task_id: TaskId) -> Result<Vec<TaskId>, StoreError> {
        let conn = self.lock()?;
        let job_id = load_run(&conn, run_id)?.job_id;
        Ok(load_graph(&conn, job_id)?.descendants(task_id))
    }
}

pub(crate) fn load_run(conn: &Connection, run_id: RunId) -> Result<JobRun, StoreError> {
    conn.query_row(
        &format!("SELECT {JOB_RUN_COLUMNS} FROM job_runs WHERE id = ?1"),
        params![run_id],
        job_run_from_row,
    )
    .optional()?
    .ok_or(StoreError::RunNotFound(run_id))
}

pub(crate) fn load_task(conn: &Connection, run_id: RunId, task_id: TaskId) -> Result<TaskRun, StoreError> {
    conn.query_row(
        &format!("SELECT {TASK_RUN_COLUMNS} FROM task_runs WHERE job_run_id = ?1 AND task_id = ?2"),
        params![run_id, task_id],
        task_run_from_row,
    )
    .optional()?
    .ok_or(StoreError::TaskNotFound { run_id, task_id })
}

fn mismatch(task: &TaskRun, owner: &str) -> StoreError {
    StoreError::ClaimMismatch {
        task_id: task.task_id,
        expected: owner.to_string(),
        actual: task.claimed_by.clone(),
    }
}

fn check_guard(task: &TaskRun, guard: &ClaimGuard) -> Result<(), StoreError> {
    match guard {
        ClaimGuard::Any => Ok(()),
        ClaimGuard::Owner(owner) if task.claimed_by.as_deref() == Some(owner.as_str()) => Ok(()),
        ClaimGuard::Owner(owner) => Err(mismatch(task, owner)),
    }
}

fn check_not_terminal(task: &TaskRun) -> Result<(), StoreError> {
    if task.status.is_terminal() {
        return Err(StoreError::TaskAlreadyTerminal {
            task_id: task.task_id,
            status: task.status,
        });
    }
    Ok(())
}
