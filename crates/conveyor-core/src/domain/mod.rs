//! Domain model (IDs, definitions, run records, state machines, errors).
//!
//! - ids: ULID ベースの型付き ID
//! - definition: importer が書く定義行（atom / task / edge）
//! - run: JobRun / TaskRun の読み取りモデル
//! - state: RunStatus / TaskStatus の状態機械
//! - policy: 失敗時ポリシー（halt / continue）
//! - errors: Run Store のエラー型

pub mod definition;
pub mod errors;
pub mod ids;
pub mod policy;
pub mod run;
pub mod state;

pub use definition::{AtomDefinition, EngineKind, TaskDefinition, TaskEdge, UnsupportedEngine, parse_command};
pub use errors::StoreError;
pub use ids::{AtomId, EdgeId, Id, IdMarker, JobId, ParseIdError, RunId, TaskId, TaskRunId};
pub use policy::FailurePolicy;
pub use run::{ClaimGuard, JobRun, RunSnapshot, TaskCounts, TaskRun};
pub use state::{RunStatus, TaskStatus, UnknownStatus};
