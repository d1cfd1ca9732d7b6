//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! 各 trait は外部システム（コンテナランタイム、時計など）への
//! インターフェースを提供し、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - SQLite の run store が source of truth（正本）
//! - Engine は atom の作成・監視・停止だけを提供
//! - Worker Pool は TaskClaimer / TaskExecutor にだけ依存

pub mod claimer;
pub mod clock;
pub mod engine;
pub mod id_generator;

// 主要な trait を再エクスポート
pub use self::claimer::{ExecutorError, ExpiredReclaimer, TaskClaimer, TaskExecutor};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::engine::{Atom, CreateRequest, Engine, EngineError, EngineRegistry};
pub use self::id_generator::{IdGenerator, UlidGenerator};
