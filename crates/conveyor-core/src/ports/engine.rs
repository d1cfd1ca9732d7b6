//! Engine port - コンテナランタイムの抽象化
//!
//! The executor only needs three calls: create an atom, poll it, stop it.
//! Docker / Podman / Kubernetes adapters live outside the core.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::EngineKind;

/// Engine-side view of one running (or finished) container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Atom {
    id: String,
    result: Option<String>,
    stopped_at: Option<DateTime<Utc>>,
}

impl Atom {
    pub fn running(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result: None,
            stopped_at: None,
        }
    }

    pub fn stopped(id: impl Into<String>, result: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            result: Some(result.into()),
            stopped_at: Some(at),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Engine-reported outcome (`success`, `ok`, an exit description, ...).
    pub fn result(&self) -> Option<&str> {
        self.result.as_deref()
    }

    pub fn stopped_at(&self) -> Option<DateTime<Utc>> {
        self.stopped_at
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped_at.is_some()
    }
}

/// Arguments of [`Engine::create`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRequest {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("atom {0} not found")]
    NotFound(String),

    #[error("no engine registered for {0}")]
    Unavailable(EngineKind),

    #[error("engine {engine} failed: {message}")]
    Runtime { engine: EngineKind, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Container runtime capability.
#[async_trait]
pub trait Engine: Send + Sync {
    async fn create(&self, request: CreateRequest) -> Result<Atom, EngineError>;

    async fn get(&self, atom_id: &str) -> Result<Atom, EngineError>;

    async fn stop(&self, atom_id: &str, force: bool) -> Result<(), EngineError>;
}

/// Registry of engines (engine kind -> engine).
///
/// Design:
/// - Built during initialization (mutable).
/// - Used during runtime (immutable, shared via `Arc`).
#[derive(Default, Clone)]
pub struct EngineRegistry {
    engines: HashMap<EngineKind, Arc<dyn Engine>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self {
            engines: HashMap::new(),
        }
    }

    /// Register an engine for a kind. Last registration wins.
    pub fn register(&mut self, kind: EngineKind, engine: Arc<dyn Engine>) -> &mut Self {
        self.engines.insert(kind, engine);
        self
    }

    pub fn with(mut self, kind: EngineKind, engine: Arc<dyn Engine>) -> Self {
        self.register(kind, engine);
        self
    }

    pub fn get(&self, kind: EngineKind) -> Result<Arc<dyn Engine>, EngineError> {
        self.engines
            .get(&kind)
            .cloned()
            .ok_or(EngineError::Unavailable(kind))
    }

    pub fn kinds(&self) -> Vec<EngineKind> {
        self.engines.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullEngine;

    #[async_trait]
    impl Engine for NullEngine {
        async fn create(&self, request: CreateRequest) -> Result<Atom, EngineError> {
            Ok(Atom::running(request.name))
        }

        async fn get(&self, atom_id: &str) -> Result<Atom, EngineError> {
            Err(EngineError::NotFound(atom_id.to_string()))
        }

        async fn stop(&self, _atom_id: &str, _force: bool) -> Result<(), EngineError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn registry_dispatches_by_kind() {
        let registry = EngineRegistry::new().with(EngineKind::Docker, Arc::new(NullEngine));

        let engine = registry.get(EngineKind::Docker).unwrap();
        let atom = engine
            .create(CreateRequest {
                name: "t1".into(),
                image: "alpine".into(),
                command: vec![],
            })
            .await
            .unwrap();
        assert_eq!(atom.id(), "t1");
        assert!(!atom.is_stopped());
    }

    #[test]
    fn registry_reports_missing_engine() {
        let registry = EngineRegistry::new();
        let err = registry.get(EngineKind::Kubernetes).err().unwrap();
        assert!(matches!(err, EngineError::Unavailable(EngineKind::Kubernetes)));
        assert!(registry.is_empty());
    }
}
