//! Domain identifiers (strongly-typed IDs).
//!
//! # ULID ベースの ID + ジェネリック実装
//! すべての ID は ULID (Universally Unique Lexicographically Sortable Identifier) です。
//! Phantom type パターンで `Id<T>` の実装を共有しつつ、
//! `JobId` と `TaskId` のような別種の ID を混同できないようにしています。
//!
//! ## ULID の特性
//! - **時刻でソート可能**: 生成順序でソートできる
//! - **分散生成可能**: ワーカー間の調整なしで生成できる
//! - **UUID互換**: 128-bit
//!
//! Rows store the bare ULID text; `Display` adds a kind prefix for logs.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// IdMarker は各 ID 型のマーカー trait
///
/// Display で使うプレフィックス（"job-", "task-" など）を提供します。
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// ジェネリック ID 型
///
/// `T` は PhantomData で、実行時にはメモリを消費しません。
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }

    /// Bare ULID text, as persisted in the store.
    pub fn to_storage(&self) -> String {
        self.ulid.to_string()
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Error returned when an id string is not a valid ULID.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind}id `{value}`")]
pub struct ParseIdError {
    kind: &'static str,
    value: String,
}

/// Accepts both the bare ULID and the prefixed `Display` form.
impl<T: IdMarker> FromStr for Id<T> {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let raw = trimmed.strip_prefix(T::prefix()).unwrap_or(trimmed);
        Ulid::from_string(raw)
            .map(Self::from_ulid)
            .map_err(|_| ParseIdError {
                kind: T::prefix(),
                value: s.to_string(),
            })
    }
}

// ========================================
// マーカー型の定義
// ========================================

macro_rules! id_marker {
    ($(#[$meta:meta])* $marker:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum $marker {}

        impl IdMarker for $marker {
            fn prefix() -> &'static str {
                $prefix
            }
        }
    };
}

id_marker!(
    /// Job のマーカー型
    Job,
    "job-"
);
id_marker!(
    /// JobRun のマーカー型
    Run,
    "run-"
);
id_marker!(
    /// 論理タスク（DAG ノード）のマーカー型
    Task,
    "task-"
);
id_marker!(
    /// TaskRun（1 回の実行試行）のマーカー型
    TaskRunMarker,
    "taskrun-"
);
id_marker!(
    /// Atom 定義のマーカー型
    Atom,
    "atom-"
);
id_marker!(
    /// TaskEdge のマーカー型
    Edge,
    "edge-"
);

/// Identifier of a job definition.
pub type JobId = Id<Job>;

/// Identifier of one execution attempt of a job's DAG.
pub type RunId = Id<Run>;

/// Identifier of a logical task (DAG node) within a job.
pub type TaskId = Id<Task>;

/// Identifier of one TaskRun row.
pub type TaskRunId = Id<TaskRunMarker>;

/// Identifier of an atom definition (image + command + engine).
pub type AtomId = Id<Atom>;

/// Identifier of a dependency edge.
pub type EdgeId = Id<Edge>;
