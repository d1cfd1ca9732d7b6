//! ScriptedEngine - テスト・開発用のインメモリ Engine
//!
//! # 学習ポイント
//! - 実コンテナの代わりに「何回ポーリングされたら止まるか」を台本で決める
//! - atom 名 `<task>-attempt<n>` からタスクを特定し、台本を引く
//! - create / stop の呼び出しはすべて記録し、テストから検証できる

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{EngineKind, TaskId};
use crate::ports::{Atom, Clock, CreateRequest, Engine, EngineError, SystemClock};

/// Result recorded for atoms stopped by force before finishing.
pub const KILLED_RESULT: &str = "killed";

/// How an atom of one task behaves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Script {
    /// Stops on its own at the `polls`-th `get`, reporting `result`.
    Finish { polls: u32, result: String },
    /// Runs until stopped.
    Hang,
    /// `create` fails with this message.
    FailCreate(String),
    /// `get` fails with this message.
    FailGet(String),
    /// `create` is recorded and then never returns.
    StallCreate,
    /// `get` never returns (a wedged runtime daemon).
    StallGet,
}

impl Script {
    pub fn finish_after(polls: u32, result: impl Into<String>) -> Self {
        Script::Finish {
            polls,
            result: result.into(),
        }
    }
}

impl Default for Script {
    fn default() -> Self {
        Script::finish_after(1, "success")
    }
}

#[derive(Debug)]
struct ScriptedAtom {
    script: Script,
    polls: u32,
    stopped: Option<(String, DateTime<Utc>)>,
}

#[derive(Debug, Default)]
struct State {
    /// task storage id -> script
    scripts: HashMap<String, Script>,
    atoms: HashMap<String, ScriptedAtom>,
    created: Vec<CreateRequest>,
    stops: Vec<(String, bool)>,
}

pub struct ScriptedEngine {
    kind: EngineKind,
    clock: Arc<dyn Clock>,
    default_script: Script,
    state: Mutex<State>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::with_clock(EngineKind::Docker, Arc::new(SystemClock))
    }

    pub fn with_clock(kind: EngineKind, clock: Arc<dyn Clock>) -> Self {
        Self {
            kind,
            clock,
            default_script: Script::default(),
            state: Mutex::new(State::default()),
        }
    }

    /// Script used for tasks without their own.
    pub fn with_default_script(mut self, script: Script) -> Self {
        self.default_script = script;
        self
    }

    /// Script every attempt of `task`.
    pub fn script(&self, task: TaskId, script: Script) {
        self.lock().scripts.insert(task.to_storage(), script);
    }

    /// Every create request, in call order.
    pub fn created(&self) -> Vec<CreateRequest> {
        self.lock().created.clone()
    }

    /// Number of atoms created for `task` across attempts.
    pub fn created_for(&self, task: TaskId) -> usize {
        let key = task.to_storage();
        self.lock()
            .created
            .iter()
            .filter(|request| task_key(&request.name) == key)
            .count()
    }

    /// Every stop call as `(atom id, force)`, in call order.
    pub fn stops(&self) -> Vec<(String, bool)> {
        self.lock().stops.clone()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn runtime_error(&self, message: &str) -> EngineError {
        EngineError::Runtime {
            engine: self.kind,
            message: message.to_string(),
        }
    }
}

impl Default for ScriptedEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// `<task>-attempt<n>` -> `<task>`
fn task_key(atom_name: &str) -> &str {
    atom_name
        .split_once("-attempt")
        .map_or(atom_name, |(task, _)| task)
}

fn view(id: &str, atom: &ScriptedAtom) -> Atom {
    match &atom.stopped {
        Some((result, at)) => Atom::stopped(id, result.clone(), *at),
        None => Atom::running(id),
    }
}

#[async_trait]
impl Engine for ScriptedEngine {
    async fn create(&self, request: CreateRequest) -> Result<Atom, EngineError> {
        let created = {
            let mut state = self.lock();
            state.created.push(request.clone());

            let script = state
                .scripts
                .get(task_key(&request.name))
                .cloned()
                .unwrap_or_else(|| self.default_script.clone());
            match script {
                Script::FailCreate(message) => Err(self.runtime_error(&message)),
                Script::StallCreate => Ok(None),
                script => {
                    let atom = ScriptedAtom {
                        script,
                        polls: 0,
                        stopped: None,
                    };
                    let view = view(&request.name, &atom);
                    state.atoms.insert(request.name, atom);
                    Ok(Some(view))
                }
            }
        };

        match created? {
            Some(view) => Ok(view),
            None => std::future::pending().await,
        }
    }

    async fn get(&self, atom_id: &str) -> Result<Atom, EngineError> {
        let now = self.clock.now();
        let polled = {
            let mut state = self.lock();
            let atom = state
                .atoms
                .get_mut(atom_id)
                .ok_or_else(|| EngineError::NotFound(atom_id.to_string()))?;

            if atom.stopped.is_none() {
                atom.polls += 1;
                match &atom.script {
                    Script::Finish { polls, result } if atom.polls >= *polls => {
                        atom.stopped = Some((result.clone(), now));
                    }
                    Script::FailGet(message) => {
                        let message = message.clone();
                        return Err(self.runtime_error(&message));
                    }
                    _ => {}
                }
            }
            match atom.script {
                Script::StallGet if atom.stopped.is_none() => None,
                _ => Some(view(atom_id, atom)),
            }
        };

        match polled {
            Some(atom) => Ok(atom),
            None => std::future::pending().await,
        }
    }

    async fn stop(&self, atom_id: &str, force: bool) -> Result<(), EngineError> {
        let now = self.clock.now();
        let mut state = self.lock();
        state.stops.push((atom_id.to_string(), force));
        let atom = state
            .atoms
            .get_mut(atom_id)
            .ok_or_else(|| EngineError::NotFound(atom_id.to_string()))?;
        if atom.stopped.is_none() {
            atom.stopped = Some((KILLED_RESULT.to_string(), now));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::IdGenerator;
    use crate::ports::UlidGenerator;

    fn request(name: String) -> CreateRequest {
        CreateRequest {
            name,
            image: "alpine:3".into(),
            command: vec!["true".into()],
        }
    }

    #[tokio::test]
    async fn finishes_after_scripted_polls() {
        let engine = ScriptedEngine::new();
        let task = UlidGenerator::new(SystemClock).generate_task_id();
        engine.script(task, Script::finish_after(2, "ok"));

        let name = format!("{}-attempt1", task.to_storage());
        let atom = engine.create(request(name.clone())).await.unwrap();
        assert!(!atom.is_stopped());
        assert!(!engine.get(&name).await.unwrap().is_stopped());

        let done = engine.get(&name).await.unwrap();
        assert!(done.is_stopped());
        assert_eq!(done.result(), Some("ok"));
        assert_eq!(engine.created_for(task), 1);
    }

    #[tokio::test]
    async fn hanging_atom_stops_only_when_told() {
        let engine = ScriptedEngine::new().with_default_script(Script::Hang);
        engine.create(request("t-attempt1".into())).await.unwrap();
        for _ in 0..5 {
            assert!(!engine.get("t-attempt1").await.unwrap().is_stopped());
        }

        engine.stop("t-attempt1", true).await.unwrap();
        let atom = engine.get("t-attempt1").await.unwrap();
        assert_eq!(atom.result(), Some(KILLED_RESULT));
        assert_eq!(engine.stops(), vec![("t-attempt1".to_string(), true)]);
    }

    #[tokio::test]
    async fn scripted_failures_surface_as_runtime_errors() {
        let engine = ScriptedEngine::new().with_default_script(Script::FailGet("daemon gone".into()));
        engine.create(request("t".into())).await.unwrap();
        let err = engine.get("t").await.unwrap_err();
        assert!(matches!(err, EngineError::Runtime { engine: EngineKind::Docker, .. }));

        assert!(matches!(
            engine.get("missing").await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_get_never_returns_until_stopped() {
        let engine = ScriptedEngine::new().with_default_script(Script::StallGet);
        engine.create(request("t-attempt1".into())).await.unwrap();

        let stalled = tokio::time::timeout(std::time::Duration::from_secs(3600), engine.get("t-attempt1")).await;
        assert!(stalled.is_err());

        engine.stop("t-attempt1", true).await.unwrap();
        let atom = engine.get("t-attempt1").await.unwrap();
        assert_eq!(atom.result(), Some(KILLED_RESULT));
    }
}
