//! Job definition rows: atoms, tasks and dependency edges.
//!
//! These are produced upstream by the importer. The coordinator only reads
//! them to build a run, so they carry no state machine.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{AtomId, EdgeId, JobId, TaskId};

/// Container runtime an atom runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    Docker,
    Podman,
    Kubernetes,
}

impl EngineKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EngineKind::Docker => "docker",
            EngineKind::Podman => "podman",
            EngineKind::Kubernetes => "kubernetes",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported engine type: {0}")]
pub struct UnsupportedEngine(pub String);

impl FromStr for EngineKind {
    type Err = UnsupportedEngine;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "docker" => Ok(EngineKind::Docker),
            "podman" => Ok(EngineKind::Podman),
            "kubernetes" => Ok(EngineKind::Kubernetes),
            other => Err(UnsupportedEngine(other.to_string())),
        }
    }
}

/// Image + command + engine: what one task runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtomDefinition {
    pub id: AtomId,
    pub engine: EngineKind,
    pub image: String,

    /// JSON-encoded argv (`["sh","-c","echo hi"]`) or a raw command string.
    pub command: String,
}

impl AtomDefinition {
    pub fn new(id: AtomId, engine: EngineKind, image: impl Into<String>, argv: &[&str]) -> Self {
        // A Vec<&str> always encodes.
        let command = serde_json::to_string(argv).unwrap_or_default();
        Self {
            id,
            engine,
            image: image.into(),
            command,
        }
    }
}

/// A DAG node of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub id: TaskId,
    pub job_id: JobId,
    pub atom_id: AtomId,

    /// Legacy single-successor pointer, used when the job has no edges.
    pub next_id: Option<TaskId>,

    /// Labels a node must carry to claim this task.
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,

    pub created_at: DateTime<Utc>,
}

/// Directed dependency `from_task_id -> to_task_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEdge {
    pub id: EdgeId,
    pub job_id: JobId,
    pub from_task_id: TaskId,
    pub to_task_id: TaskId,
}

/// Decode a stored command: JSON array first, otherwise the raw string as a
/// single argument. Blank commands decode to an empty argv.
pub fn parse_command(raw: &str) -> Vec<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Vec::new();
    }
    match serde_json::from_str::<Vec<String>>(raw) {
        Ok(argv) => argv,
        Err(_) => vec![raw.to_string()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::json_array(r#"["sh","-c","echo hi"]"#, vec!["sh", "-c", "echo hi"])]
    #[case::raw_string("echo hi", vec!["echo hi"])]
    #[case::blank("   ", vec![])]
    #[case::json_but_not_array(r#"{"cmd":"x"}"#, vec![r#"{"cmd":"x"}"#])]
    fn parses_stored_commands(#[case] raw: &str, #[case] expected: Vec<&str>) {
        assert_eq!(parse_command(raw), expected);
    }

    #[test]
    fn engine_kind_parsing_is_case_insensitive() {
        assert_eq!("Docker".parse::<EngineKind>(), Ok(EngineKind::Docker));
        assert_eq!(" podman ".parse::<EngineKind>(), Ok(EngineKind::Podman));
        assert!("lxc".parse::<EngineKind>().is_err());
    }

    #[test]
    fn atom_definition_encodes_argv_as_json() {
        let atom = AtomDefinition::new(
            AtomId::from_ulid(ulid::Ulid::new()),
            EngineKind::Docker,
            "alpine:3",
            &["echo", "hello"],
        );
        assert_eq!(atom.command, r#"["echo","hello"]"#);
        assert_eq!(parse_command(&atom.command), vec!["echo", "hello"]);
    }
}
