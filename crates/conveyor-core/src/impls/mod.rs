//! Impls - 実装（開発用・テスト用）
//!
//! このモジュールには ports の実装を含めます。
//!
//! # 含まれる実装
//! - **ScriptedEngine**: 台本どおりに動くインメモリ Engine
//!
//! # 本番用実装
//! Docker / Podman の CLI アダプタはバイナリ（`conveyor-cli`）側に置きます。

pub mod scripted_engine;

pub use self::scripted_engine::{Script, ScriptedEngine};
