//! App - アプリケーション層
//!
//! このモジュールは、store と ports を組み合わせてノードの振る舞いを実装します。
//!
//! # 主要コンポーネント
//! - **Claimer**: ノード identity + lease 設定で `RunStore` から claim する
//! - **WorkerLoop**: reclaim → claim → スロットプールへ投入
//! - **RuntimeExecutor**: claim 済みタスクを Engine 上の atom として実行
//! - **RunLauncher**: JobRun の開始 / 再開と完了判定

pub mod claimer;
pub mod executor;
pub mod launch;
pub mod pool;
pub mod worker_loop;

// 主要な型を再エクスポート
pub use self::claimer::{Claimer, parse_node_labels};
pub use self::executor::{ExecutorOptions, RuntimeExecutor};
pub use self::launch::RunLauncher;
pub use self::pool::SlotPool;
pub use self::worker_loop::{WorkerHandle, WorkerLoop};
