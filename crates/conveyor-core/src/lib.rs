//! conveyor-core
//!
//! Distributed task claim-and-execution coordinator.
//!
//! Nodes share one SQLite run store. Each node claims ready tasks under a
//! time-bounded lease, runs them as container atoms and records the outcome;
//! completing a task releases its successors in the job's DAG.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, definition, run, state, policy, errors）
//! - **ports**: 抽象化レイヤー（Clock, IdGenerator, Engine, TaskClaimer, TaskExecutor）
//! - **store**: SQLite の run store（状態遷移と claim）
//! - **dag**: 依存グラフ（in-degree, successors, descendants）
//! - **app**: claimer, worker loop, runtime executor, launcher
//! - **impls**: 開発・テスト用の実装（ScriptedEngine）
//! - **config**: ワーカー設定（TOML + 環境変数）

pub mod app;
pub mod config;
pub mod dag;
pub mod domain;
pub mod error;
pub mod impls;
pub mod ports;
pub mod signal;
pub mod store;

pub use self::config::{ConfigError, WorkerConfig};
pub use self::error::ConveyorError;
