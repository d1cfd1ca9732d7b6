//! RuntimeExecutor - claim 済みタスクを atom として実行する
//!
//! # フロー
//! 1. engine kind から Engine を選び、atom を作成（名前は `TaskRun::atom_name`）
//! 2. `start_task`（owner guard 付き）で runtime id を記録
//! 3. `max(TTL/2, 1s)` ごとに lease 更新 + engine をポーリング
//! 4. atom が止まったら force stop（後片付け）して `complete_task`
//!
//! Ownership loss at any step means another node owns the task now: the
//! executor logs it and walks away without persisting anything.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::domain::{ClaimGuard, FailurePolicy, StoreError, TaskRun, TaskStatus};
use crate::ports::{
    Atom, CreateRequest, Engine, EngineError, EngineRegistry, ExecutorError, TaskExecutor,
};
use crate::signal::Shutdown;
use crate::store::RunStore;

const MIN_LEASE_RENEW_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound for the force-stop issued after a timeout.
const TIMEOUT_STOP_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorOptions {
    /// Owner used when a TaskRun carries no `claimed_by`.
    pub node_id: String,
    pub lease_ttl: Duration,
    pub task_timeout: Option<Duration>,
    pub failure_policy: FailurePolicy,
}

pub struct RuntimeExecutor {
    store: RunStore,
    engines: EngineRegistry,
    options: ExecutorOptions,
}

/// Lease renewal / poll cadence for a TTL.
pub fn lease_renew_interval(lease_ttl: Duration) -> Duration {
    (lease_ttl / 2).max(MIN_LEASE_RENEW_INTERVAL)
}

/// What cut an attempt short.
enum Interrupt {
    Aborted,
    Deadline,
}

/// Cancellation scope of one attempt: every engine call is raced against it.
struct Attempt<'a> {
    task: &'a TaskRun,
    owner: &'a str,
    abort: &'a Shutdown,
    deadline: Option<Instant>,
}

impl Attempt<'_> {
    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, EngineError>>,
    ) -> Result<Result<T, EngineError>, Interrupt> {
        tokio::select! {
            biased;
            _ = self.abort.triggered() => Err(Interrupt::Aborted),
            _ = until(self.deadline) => Err(Interrupt::Deadline),
            result = call => Ok(result),
        }
    }
}

impl RuntimeExecutor {
    pub fn new(store: RunStore, engines: EngineRegistry, options: ExecutorOptions) -> Self {
        Self {
            store,
            engines,
            options,
        }
    }

    pub fn options(&self) -> &ExecutorOptions {
        &self.options
    }

    async fn run_attempt(
        &self,
        task: &TaskRun,
        owner: &str,
        abort: &Shutdown,
    ) -> Result<TaskStatus, ExecutorError> {
        let attempt = Attempt {
            task,
            owner,
            abort,
            deadline: self.options.task_timeout.map(|timeout| Instant::now() + timeout),
        };
        let engine = self.engines.get(task.engine)?;

        let created = attempt
            .bounded(engine.create(CreateRequest {
                name: task.atom_name(),
                image: task.image.clone(),
                command: task.argv(),
            }))
            .await;
        let atom = match created {
            Ok(created) => created?,
            Err(interrupt) => {
                return Err(self.interrupted(&attempt, engine.as_ref(), None, interrupt).await);
            }
        };
        debug!(task_id = %task.task_id, atom = atom.id(), "atom created");

        let (run_id, task_id, runtime_id) = (task.job_run_id, task.task_id, atom.id().to_string());
        let guard = ClaimGuard::owner(owner);
        let started = {
            let guard = guard.clone();
            self.store
                .blocking(move |store| store.start_task(run_id, task_id, &runtime_id, &guard))
                .await
        };
        if let Err(err) = started {
            if err.is_claim_mismatch() {
                stop_quietly(engine.as_ref(), atom.id()).await;
            }
            return Err(err.into());
        }

        let atom = self.monitor(&attempt, engine.as_ref(), atom).await?;

        let result = atom.result().unwrap_or_default().to_string();
        let status = self
            .store
            .blocking(move |store| store.complete_task(run_id, task_id, &result, &guard))
            .await?;
        Ok(status)
    }

    async fn monitor(
        &self,
        attempt: &Attempt<'_>,
        engine: &dyn Engine,
        mut atom: Atom,
    ) -> Result<Atom, ExecutorError> {
        let task = attempt.task;
        let mut ticker = tokio::time::interval(lease_renew_interval(self.options.lease_ttl));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // interval fires immediately once; the first poll happens one period in
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = attempt.abort.triggered() => {
                    return Err(self.interrupted(attempt, engine, Some(atom.id()), Interrupt::Aborted).await);
                }
                _ = until(attempt.deadline) => {
                    return Err(self.interrupted(attempt, engine, Some(atom.id()), Interrupt::Deadline).await);
                }
                _ = ticker.tick() => {}
            }

            let (task_run_id, owner, ttl) = (task.id, attempt.owner.to_string(), self.options.lease_ttl);
            match self
                .store
                .blocking(move |store| store.renew_lease(task_run_id, &owner, ttl))
                .await
            {
                Ok(_) => {}
                Err(err) if err.is_claim_mismatch() => {
                    stop_quietly(engine, atom.id()).await;
                    return Err(err.into());
                }
                Err(err) => {
                    error!(run_id = %task.job_run_id, task_id = %task.task_id, error = %err, "failed to renew task lease");
                }
            }

            let polled = match attempt.bounded(engine.get(atom.id())).await {
                Ok(polled) => polled?,
                Err(interrupt) => {
                    return Err(self.interrupted(attempt, engine, Some(atom.id()), interrupt).await);
                }
            };
            atom = polled;

            if atom.is_stopped() {
                match attempt.bounded(engine.stop(atom.id(), true)).await {
                    Ok(stopped) => stopped?,
                    Err(interrupt) => {
                        return Err(self.interrupted(attempt, engine, Some(atom.id()), interrupt).await);
                    }
                }
                return Ok(atom);
            }
        }
    }

    /// Turn an interrupt into the attempt's error.
    ///
    /// A timeout force-stops the atom (when one exists) before reporting
    /// `TimedOut`. An abort leaves the atom alone.
    async fn interrupted(
        &self,
        attempt: &Attempt<'_>,
        engine: &dyn Engine,
        atom_id: Option<&str>,
        interrupt: Interrupt,
    ) -> ExecutorError {
        let task_id = attempt.task.task_id;
        match interrupt {
            Interrupt::Aborted => ExecutorError::Aborted(task_id),
            Interrupt::Deadline => {
                if let Some(atom_id) = atom_id {
                    match tokio::time::timeout(TIMEOUT_STOP_GRACE, engine.stop(atom_id, true)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            warn!(task_id = %task_id, atom = atom_id, error = %err, "failed to stop timed out atom");
                        }
                        Err(_) => {
                            warn!(task_id = %task_id, atom = atom_id, grace = ?TIMEOUT_STOP_GRACE, "stopping timed out atom did not finish");
                        }
                    }
                }
                ExecutorError::TimedOut {
                    task_id,
                    after: self.options.task_timeout.unwrap_or_default(),
                }
            }
        }
    }

    /// `continue` policy: skip every descendant of the failed task.
    async fn apply_failure_policy(&self, task: &TaskRun) {
        if self.options.failure_policy != FailurePolicy::Continue {
            return;
        }

        let (run_id, failed) = (task.job_run_id, task.task_id);
        let reason = format!("skipped due to failed dependency task {failed}");
        let skipped = self
            .store
            .blocking(move |store| {
                let mut outcomes = Vec::new();
                for descendant in store.descendants(run_id, failed)? {
                    outcomes.push((descendant, store.skip_task(run_id, descendant, &reason)));
                }
                Ok(outcomes)
            })
            .await;

        let outcomes = match skipped {
            Ok(outcomes) => outcomes,
            Err(err) => {
                error!(run_id = %run_id, task_id = %failed, error = %err, "failed to collect descendant tasks");
                return;
            }
        };
        for (descendant, outcome) in outcomes {
            match outcome {
                Ok(true) => debug!(run_id = %run_id, task_id = %descendant, "descendant skipped"),
                Ok(false) => {}
                Err(err) => {
                    error!(run_id = %run_id, task_id = %descendant, error = %err, "failed to persist skipped descendant task")
                }
            }
        }
    }

    async fn persist_failure(&self, task: &TaskRun, owner: &str, err: &ExecutorError) -> Result<(), StoreError> {
        let (run_id, task_id) = (task.job_run_id, task.task_id);
        let (message, guard) = (err.to_string(), ClaimGuard::owner(owner));
        self.store
            .blocking(move |store| store.fail_task(run_id, task_id, &message, &guard))
            .await
    }
}

#[async_trait]
impl TaskExecutor for RuntimeExecutor {
    async fn execute(&self, task: TaskRun, abort: Shutdown) -> Result<(), ExecutorError> {
        let owner = task
            .claimed_by
            .clone()
            .unwrap_or_else(|| self.options.node_id.clone());

        let err = match self.run_attempt(&task, &owner, &abort).await {
            Ok(TaskStatus::Failed) => {
                info!(run_id = %task.job_run_id, task_id = %task.task_id, "task reported failure");
                self.apply_failure_policy(&task).await;
                return Ok(());
            }
            Ok(status) => {
                info!(run_id = %task.job_run_id, task_id = %task.task_id, status = %status, "task finished");
                return Ok(());
            }
            Err(ExecutorError::Store(err)) if err.is_claim_mismatch() => {
                info!(run_id = %task.job_run_id, task_id = %task.task_id, error = %err, "task claim changed; abandoning execution");
                return Ok(());
            }
            Err(err @ ExecutorError::Aborted(_)) => return Err(err),
            Err(err) => err,
        };

        match self.persist_failure(&task, &owner, &err).await {
            Ok(()) => {}
            Err(persist) if persist.is_claim_mismatch() => {
                info!(run_id = %task.job_run_id, task_id = %task.task_id, "task claim changed before failure persistence");
                return Ok(());
            }
            Err(persist) => {
                error!(run_id = %task.job_run_id, task_id = %task.task_id, error = %persist, "failed to persist task failure");
            }
        }

        self.apply_failure_policy(&task).await;
        Err(err)
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn stop_quietly(engine: &dyn Engine, atom_id: &str) {
    if let Err(err) = engine.stop(atom_id, true).await {
        warn!(atom = atom_id, error = %err, "failed to stop abandoned atom");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EngineKind, RunId, TaskId};
    use crate::impls::{Script, ScriptedEngine};
    use crate::ports::TaskClaimer;
    use crate::app::Claimer;
    use crate::signal::ShutdownTrigger;
    use crate::store::testing::Fixture;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    const TTL: Duration = Duration::from_secs(10);

    struct Harness {
        fx: Fixture,
        engine: Arc<ScriptedEngine>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                fx: Fixture::new(),
                engine: Arc::new(ScriptedEngine::new()),
            }
        }

        fn executor(&self, policy: FailurePolicy, timeout: Option<Duration>) -> RuntimeExecutor {
            RuntimeExecutor::new(
                self.fx.store.clone(),
                EngineRegistry::new().with(EngineKind::Docker, self.engine.clone()),
                ExecutorOptions {
                    node_id: "node-a".into(),
                    lease_ttl: TTL,
                    task_timeout: timeout,
                    failure_policy: policy,
                },
            )
        }

        async fn claim(&self, node: &str) -> TaskRun {
            Claimer::new(self.fx.store.clone(), node, BTreeMap::new(), TTL)
                .claim_next()
                .await
                .unwrap()
                .unwrap()
        }

        fn status(&self, run_id: RunId, task_id: TaskId) -> TaskStatus {
            self.fx.store.get_task(run_id, task_id).unwrap().status
        }
    }

    #[rstest::rstest]
    #[case(Duration::ZERO, Duration::from_secs(1))]
    #[case(Duration::from_millis(1500), Duration::from_secs(1))]
    #[case(Duration::from_secs(10), Duration::from_secs(5))]
    #[case(Duration::from_secs(300), Duration::from_secs(150))]
    fn renew_interval_is_half_ttl_at_least_one_second(#[case] ttl: Duration, #[case] expected: Duration) {
        assert_eq!(lease_renew_interval(ttl), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_atom_completes_task_and_releases_successor() {
        let mut h = Harness::new();
        let a = h.fx.task(&[]);
        let b = h.fx.task(&[]);
        let run_id = h.fx.launch();
        h.engine.script(a, Script::finish_after(2, "success"));

        let task = h.claim("node-a").await;
        h.executor(FailurePolicy::Halt, None)
            .execute(task, Shutdown::never())
            .await
            .unwrap();

        let done = h.fx.store.get_task(run_id, a).unwrap();
        assert_eq!(done.status, TaskStatus::Succeeded);
        assert_eq!(done.result.as_deref(), Some("success"));
        assert_eq!(done.runtime_id.as_deref(), Some(format!("{}-attempt1", a.to_storage()).as_str()));
        assert_eq!(h.fx.store.get_task(run_id, b).unwrap().outstanding_predecessors, 0);

        let created = h.engine.created();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].command, vec!["echo".to_string(), "hi".to_string()]);
        // cleanup stop after the atom finished on its own
        assert_eq!(h.engine.stops(), vec![(created[0].name.clone(), true)]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_result_under_halt_leaves_descendants_pending() {
        let mut h = Harness::new();
        let a = h.fx.task(&[]);
        let b = h.fx.task(&[]);
        let run_id = h.fx.launch();
        h.engine.script(a, Script::finish_after(1, "exit 1"));

        let task = h.claim("node-a").await;
        h.executor(FailurePolicy::Halt, None)
            .execute(task, Shutdown::never())
            .await
            .unwrap();

        let failed = h.fx.store.get_task(run_id, a).unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("task failed with result: exit 1"));

        let blocked = h.fx.store.get_task(run_id, b).unwrap();
        assert_eq!(blocked.status, TaskStatus::Pending);
        assert_eq!(blocked.outstanding_predecessors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_result_under_continue_skips_descendants_only() {
        let mut h = Harness::new();
        let a = h.fx.task(&[]);
        let b = h.fx.task(&[]);
        let c = h.fx.task(&[]);
        let other = h.fx.task(&[]);
        h.fx.edge(a, b);
        h.fx.edge(b, c);
        let run_id = h.fx.launch();
        h.engine.script(a, Script::finish_after(1, "boom"));

        let task = h.claim("node-a").await;
        assert_eq!(task.task_id, a);
        h.executor(FailurePolicy::Continue, None)
            .execute(task, Shutdown::never())
            .await
            .unwrap();

        let reason = format!("skipped due to failed dependency task {a}");
        for id in [b, c] {
            let skipped = h.fx.store.get_task(run_id, id).unwrap();
            assert_eq!(skipped.status, TaskStatus::Skipped);
            assert_eq!(skipped.error.as_deref(), Some(reason.as_str()));
        }
        assert_eq!(h.status(run_id, other), TaskStatus::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_force_stops_and_fails_task() {
        let mut h = Harness::new();
        let a = h.fx.task(&[]);
        let run_id = h.fx.launch();
        h.engine.script(a, Script::Hang);

        let task = h.claim("node-a").await;
        let err = h
            .executor(FailurePolicy::Halt, Some(Duration::from_secs(12)))
            .execute(task, Shutdown::never())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::TimedOut { task_id, .. } if task_id == a));

        let failed = h.fx.store.get_task(run_id, a).unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(
            failed.error.as_deref(),
            Some(format!("task {a} timed out after 12s").as_str())
        );
        assert_eq!(h.engine.stops().len(), 1);
        assert!(h.engine.stops()[0].1, "timeout stop must be forced");
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fires_while_engine_poll_is_stuck() {
        let mut h = Harness::new();
        let a = h.fx.task(&[]);
        let run_id = h.fx.launch();
        h.engine.script(a, Script::StallGet);

        let task = h.claim("node-a").await;
        let executor = h.executor(FailurePolicy::Halt, Some(Duration::from_secs(7)));
        let outcome = tokio::time::timeout(
            Duration::from_secs(3600),
            executor.execute(task, Shutdown::never()),
        )
        .await
        .expect("execution must end at the task timeout");

        assert!(matches!(outcome, Err(ExecutorError::TimedOut { task_id, .. }) if task_id == a));
        let failed = h.fx.store.get_task(run_id, a).unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(
            failed.error.as_deref(),
            Some(format!("task {a} timed out after 7s").as_str())
        );
        let stops = h.engine.stops();
        assert_eq!(stops.len(), 1);
        assert!(stops[0].1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fires_while_atom_creation_is_stuck() {
        let mut h = Harness::new();
        let a = h.fx.task(&[]);
        let run_id = h.fx.launch();
        h.engine.script(a, Script::StallCreate);

        let task = h.claim("node-a").await;
        let err = h
            .executor(FailurePolicy::Halt, Some(Duration::from_secs(5)))
            .execute(task, Shutdown::never())
            .await
            .unwrap_err();

        assert!(matches!(err, ExecutorError::TimedOut { task_id, .. } if task_id == a));
        assert_eq!(h.status(run_id, a), TaskStatus::Failed);
        // no atom id came back, so there is nothing to stop
        assert!(h.engine.stops().is_empty());
        assert_eq!(h.engine.created_for(a), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_interrupts_a_stuck_engine_poll() {
        let mut h = Harness::new();
        let a = h.fx.task(&[]);
        let run_id = h.fx.launch();
        h.engine.script(a, Script::StallGet);

        let task = h.claim("node-a").await;
        let executor = h.executor(FailurePolicy::Halt, None);
        let (trigger, abort) = ShutdownTrigger::new();

        let (result, ()) = tokio::join!(executor.execute(task, abort), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            trigger.trigger();
        });
        assert!(matches!(result, Err(ExecutorError::Aborted(id)) if id == a));
        assert_eq!(h.status(run_id, a), TaskStatus::Running);
        assert!(h.engine.stops().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn engine_error_fails_task() {
        let mut h = Harness::new();
        let a = h.fx.task(&[]);
        let run_id = h.fx.launch();
        h.engine.script(a, Script::FailCreate("image not found".into()));

        let task = h.claim("node-a").await;
        let err = h
            .executor(FailurePolicy::Halt, None)
            .execute(task, Shutdown::never())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Engine(_)));

        let failed = h.fx.store.get_task(run_id, a).unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert!(failed.error.unwrap().contains("image not found"));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_engine_fails_task() {
        let mut h = Harness::new();
        let a = h.fx.task(&[]);
        let run_id = h.fx.launch();
        let task = h.claim("node-a").await;

        let executor = RuntimeExecutor::new(
            h.fx.store.clone(),
            EngineRegistry::new(),
            h.executor(FailurePolicy::Halt, None).options().clone(),
        );
        let err = executor.execute(task, Shutdown::never()).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Engine(_)));
        assert_eq!(h.status(run_id, a), TaskStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_claim_is_abandoned_without_persisting() {
        let mut h = Harness::new();
        let a = h.fx.task(&[]);
        let run_id = h.fx.launch();

        let stale = h.claim("node-a").await;
        h.fx.advance(chrono::Duration::seconds(11));
        h.fx.store.reclaim_expired().unwrap();
        let fresh = h.claim("node-b").await;
        assert_eq!(fresh.claim_attempt, 2);

        h.executor(FailurePolicy::Halt, None)
            .execute(stale, Shutdown::never())
            .await
            .unwrap();

        let current = h.fx.store.get_task(run_id, a).unwrap();
        assert_eq!(current.status, TaskStatus::Running);
        assert_eq!(current.claimed_by.as_deref(), Some("node-b"));
        assert!(current.runtime_id.is_none());
        // the stale attempt's atom was cleaned up
        assert_eq!(h.engine.stops().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_lease_stops_own_atom_and_abandons() {
        let mut h = Harness::new();
        let a = h.fx.task(&[]);
        let run_id = h.fx.launch();
        h.engine.script(a, Script::Hang);

        let task = h.claim("node-a").await;
        let executor = h.executor(FailurePolicy::Halt, None);

        let store = h.fx.store.clone();
        let clock = h.fx.clock.clone();
        let thief = tokio::spawn(async move {
            // let the executor start its atom, then take the task away
            tokio::time::sleep(Duration::from_secs(1)).await;
            clock.advance(chrono::Duration::seconds(11));
            store.reclaim_expired().unwrap();
            Claimer::new(store, "node-b", BTreeMap::new(), TTL)
                .claim_next()
                .await
                .unwrap()
                .unwrap()
        });

        executor.execute(task, Shutdown::never()).await.unwrap();
        let stolen = thief.await.unwrap();
        assert_eq!(stolen.claimed_by.as_deref(), Some("node-b"));

        let current = h.fx.store.get_task(run_id, a).unwrap();
        assert_eq!(current.status, TaskStatus::Running);
        assert_eq!(current.claimed_by.as_deref(), Some("node-b"));
        assert_eq!(h.engine.stops().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_returns_without_persisting() {
        let mut h = Harness::new();
        let a = h.fx.task(&[]);
        let run_id = h.fx.launch();
        h.engine.script(a, Script::Hang);

        let task = h.claim("node-a").await;
        let executor = h.executor(FailurePolicy::Halt, None);
        let (trigger, abort) = ShutdownTrigger::new();

        let (result, ()) = tokio::join!(executor.execute(task, abort), async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            trigger.trigger();
        });
        assert!(matches!(result, Err(ExecutorError::Aborted(id)) if id == a));

        let current = h.fx.store.get_task(run_id, a).unwrap();
        assert_eq!(current.status, TaskStatus::Running);
        assert_eq!(current.claimed_by.as_deref(), Some("node-a"));
        assert!(h.engine.stops().is_empty());
    }
}
