//! Worker configuration.
//!
//! 優先順位: デフォルト < TOML ファイル < `CONVEYOR_*` 環境変数 < CLI フラグ
//! （CLI フラグの適用はバイナリ側で行う）
//!
//! Durations are written as `250ms`, `30s`, `5m` or `1h`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use thiserror::Error;

use crate::app::claimer::{DEFAULT_LEASE_TTL, DEFAULT_NODE_ID, parse_node_labels};
use crate::app::executor::ExecutorOptions;
use crate::app::worker_loop::DEFAULT_POLL_INTERVAL;
use crate::domain::FailurePolicy;

pub const ENV_PREFIX: &str = "CONVEYOR_";
pub const DEFAULT_POOL_SIZE: usize = 4;
pub const DEFAULT_DATABASE_PATH: &str = "conveyor.db";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing TOML config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid duration `{0}` (expected e.g. 250ms, 30s, 5m, 1h)")]
    InvalidDuration(String),

    #[error("invalid value `{value}` for {key}")]
    InvalidValue { key: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    pub node_id: String,
    pub node_labels: BTreeMap<String, String>,

    #[serde(deserialize_with = "de_duration")]
    pub lease_ttl: Duration,

    pub pool_size: usize,

    #[serde(deserialize_with = "de_duration")]
    pub poll_interval: Duration,

    #[serde(deserialize_with = "de_opt_duration")]
    pub task_timeout: Option<Duration>,

    pub failure_policy: FailurePolicy,
    pub database_path: PathBuf,

    /// Resuming a running JobRun first returns its in-flight tasks to pending.
    pub resume_resets_in_flight: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            node_id: DEFAULT_NODE_ID.to_string(),
            node_labels: BTreeMap::new(),
            lease_ttl: DEFAULT_LEASE_TTL,
            pool_size: DEFAULT_POOL_SIZE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            task_timeout: None,
            failure_policy: FailurePolicy::Halt,
            database_path: PathBuf::from(DEFAULT_DATABASE_PATH),
            resume_resets_in_flight: false,
        }
    }
}

impl WorkerConfig {
    pub fn from_toml_str(contents: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents, path)
    }

    /// File (when given) plus process environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::load_from_path(path)?,
            None => Self::default(),
        };
        config.with_env_from(|key| std::env::var(key).ok())
    }

    /// Apply `CONVEYOR_*` overrides read through `lookup`.
    pub fn with_env_from<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(value) = get("NODE_ID") {
            self.node_id = value;
        }
        if let Some(value) = get("NODE_LABELS") {
            self.node_labels = parse_node_labels(&value);
        }
        if let Some(value) = get("LEASE_TTL") {
            self.lease_ttl = parse_duration(&value)?;
        }
        if let Some(value) = get("POOL_SIZE") {
            self.pool_size = value.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: format!("{ENV_PREFIX}POOL_SIZE"),
                value: value.clone(),
            })?;
        }
        if let Some(value) = get("POLL_INTERVAL") {
            self.poll_interval = parse_duration(&value)?;
        }
        if let Some(value) = get("TASK_TIMEOUT") {
            self.task_timeout = parse_optional_duration(&value)?;
        }
        if let Some(value) = get("FAILURE_POLICY") {
            self.failure_policy = FailurePolicy::normalize(&value);
        }
        if let Some(value) = get("DATABASE_PATH") {
            self.database_path = PathBuf::from(value);
        }
        if let Some(value) = get("RESUME_RESETS_IN_FLIGHT") {
            self.resume_resets_in_flight = parse_bool(&value).ok_or_else(|| {
                ConfigError::InvalidValue {
                    key: format!("{ENV_PREFIX}RESUME_RESETS_IN_FLIGHT"),
                    value: value.clone(),
                }
            })?;
        }
        Ok(self)
    }

    pub fn executor_options(&self) -> ExecutorOptions {
        ExecutorOptions {
            node_id: self.node_id.clone(),
            lease_ttl: self.lease_ttl,
            task_timeout: self.task_timeout,
            failure_policy: self.failure_policy,
        }
    }
}

/// Parse `250ms`, `30s`, `5m`, `1h`. A bare number means seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, ConfigError> {
    let trimmed = raw.trim();
    let invalid = || ConfigError::InvalidDuration(raw.to_string());

    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    let value: u64 = number.parse().map_err(|_| invalid())?;

    let duration = match unit.trim() {
        "ms" => Duration::from_millis(value),
        "" | "s" => Duration::from_secs(value),
        "m" => Duration::from_secs(value.checked_mul(60).ok_or_else(invalid)?),
        "h" => Duration::from_secs(value.checked_mul(3600).ok_or_else(invalid)?),
        _ => return Err(invalid()),
    };
    Ok(duration)
}

/// Like [`parse_duration`], but blank, `0` or `none` disable the setting.
pub fn parse_optional_duration(raw: &str) -> Result<Option<Duration>, ConfigError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    let duration = parse_duration(trimmed)?;
    Ok((!duration.is_zero()).then_some(duration))
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn de_duration<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let raw = String::deserialize(deserializer)?;
    parse_duration(&raw).map_err(serde::de::Error::custom)
}

fn de_opt_duration<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Duration>, D::Error> {
    let raw = Option::<String>::deserialize(deserializer)?;
    match raw {
        Some(raw) => parse_optional_duration(&raw).map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}
