//! Docker / Podman engines driven through their CLIs.
//!
//! Each call spawns the runtime binary with `tokio::process::Command`;
//! container state is read back with `inspect --format`.
//! Kubernetes has no adapter here: tasks for it fail with "no engine
//! registered".

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conveyor_core::domain::EngineKind;
use conveyor_core::ports::{Atom, CreateRequest, Engine, EngineError, EngineRegistry};
use tokio::process::Command;
use tracing::debug;

const INSPECT_FORMAT: &str = "{{.State.Status}}|{{.State.ExitCode}}|{{.State.FinishedAt}}";

pub struct CliEngine {
    kind: EngineKind,
    program: String,
}

impl CliEngine {
    pub fn new(kind: EngineKind, program: impl Into<String>) -> Self {
        Self {
            kind,
            program: program.into(),
        }
    }

    pub fn docker() -> Self {
        Self::new(EngineKind::Docker, "docker")
    }

    pub fn podman() -> Self {
        Self::new(EngineKind::Podman, "podman")
    }

    /// Run the runtime binary; stdout (trimmed) on success.
    async fn invoke(&self, args: &[&str], atom_id: Option<&str>) -> Result<String, EngineError> {
        debug!(engine = %self.kind, program = %self.program, ?args, "invoking container runtime");
        let output = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(classify(self.kind, stderr, atom_id));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

fn classify(kind: EngineKind, stderr: String, atom_id: Option<&str>) -> EngineError {
    match atom_id {
        Some(id) if stderr.to_ascii_lowercase().contains("no such container") => {
            EngineError::NotFound(id.to_string())
        }
        _ => EngineError::Runtime {
            engine: kind,
            message: stderr,
        },
    }
}

/// Turn one `inspect --format` line into an [`Atom`].
///
/// Exit code 0 reports `success`; anything else `exit code <n>`.
pub fn parse_inspect(atom_id: &str, line: &str, now: DateTime<Utc>) -> Result<Atom, String> {
    let mut parts = line.trim().splitn(3, '|');
    let status = parts.next().unwrap_or_default().trim().to_ascii_lowercase();
    let exit_code = parts.next().unwrap_or_default().trim();
    let finished_at = parts.next().unwrap_or_default().trim();

    match status.as_str() {
        "created" | "configured" | "initialized" | "running" | "paused" | "restarting"
        | "removing" | "stopping" => Ok(Atom::running(atom_id)),
        "exited" | "dead" | "stopped" => {
            let code: i64 = exit_code
                .parse()
                .map_err(|_| format!("unreadable exit code `{exit_code}`"))?;
            let result = if code == 0 {
                "success".to_string()
            } else {
                format!("exit code {code}")
            };
            let at = DateTime::parse_from_rfc3339(finished_at)
                .map(|at| at.with_timezone(&Utc))
                .unwrap_or(now);
            Ok(Atom::stopped(atom_id, result, at))
        }
        other => Err(format!("unknown container status `{other}`")),
    }
}

#[async_trait]
impl Engine for CliEngine {
    async fn create(&self, request: CreateRequest) -> Result<Atom, EngineError> {
        let mut args = vec!["run", "-d", "--name", request.name.as_str(), request.image.as_str()];
        args.extend(request.command.iter().map(String::as_str));
        let container_id = self.invoke(&args, None).await?;
        if container_id.is_empty() {
            return Err(EngineError::Runtime {
                engine: self.kind,
                message: format!("no container id returned for {}", request.name),
            });
        }
        Ok(Atom::running(container_id))
    }

    async fn get(&self, atom_id: &str) -> Result<Atom, EngineError> {
        let line = self
            .invoke(&["inspect", "--format", INSPECT_FORMAT, atom_id], Some(atom_id))
            .await?;
        parse_inspect(atom_id, &line, Utc::now()).map_err(|message| EngineError::Runtime {
            engine: self.kind,
            message,
        })
    }

    async fn stop(&self, atom_id: &str, force: bool) -> Result<(), EngineError> {
        let args = if force {
            vec!["rm", "-f", atom_id]
        } else {
            vec!["stop", atom_id]
        };
        self.invoke(&args, Some(atom_id)).await.map(|_| ())
    }
}

/// Engines this binary can drive.
pub fn default_registry() -> EngineRegistry {
    EngineRegistry::new()
        .with(EngineKind::Docker, Arc::new(CliEngine::docker()))
        .with(EngineKind::Podman, Arc::new(CliEngine::podman()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn running_container_is_not_stopped() {
        let atom = parse_inspect("c1", "running|0|0001-01-01T00:00:00Z", now()).unwrap();
        assert!(!atom.is_stopped());
        assert_eq!(atom.id(), "c1");
    }

    #[test]
    fn clean_exit_reports_success() {
        let atom = parse_inspect("c1", "exited|0|2024-06-01T10:00:00.5Z\n", now()).unwrap();
        assert_eq!(atom.result(), Some("success"));
        assert_eq!(
            atom.stopped_at(),
            Some(Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap() + chrono::Duration::milliseconds(500))
        );
    }

    #[test]
    fn non_zero_exit_reports_code_and_tolerates_odd_timestamps() {
        let atom = parse_inspect("c1", "exited|137|2024-06-01 10:00:00 +0000 UTC", now()).unwrap();
        assert_eq!(atom.result(), Some("exit code 137"));
        assert_eq!(atom.stopped_at(), Some(now()));
    }

    #[test]
    fn unknown_status_is_an_error() {
        assert!(parse_inspect("c1", "weird|0|", now()).is_err());
        assert!(parse_inspect("c1", "exited|x|", now()).is_err());
    }

    #[test]
    fn missing_container_maps_to_not_found() {
        let err = classify(
            EngineKind::Docker,
            "Error: No such container: c1".into(),
            Some("c1"),
        );
        assert!(matches!(err, EngineError::NotFound(id) if id == "c1"));

        let err = classify(EngineKind::Podman, "permission denied".into(), Some("c1"));
        assert!(matches!(err, EngineError::Runtime { engine: EngineKind::Podman, .. }));
    }

    #[test]
    fn registry_has_no_kubernetes_adapter() {
        let registry = default_registry();
        assert!(registry.get(EngineKind::Docker).is_ok());
        assert!(registry.get(EngineKind::Podman).is_ok());
        assert!(registry.get(EngineKind::Kubernetes).is_err());
    }
}
