//! IdGenerator port - ID 生成の抽象化
//!
//! IdGenerator は分散システムで使える ID を生成するためのインターフェースです。
//! 複数の worker プロセスが同じ DB に書くので、調整なしで衝突しない ULID を使います。
//!
//! # 実装
//! - **UlidGenerator**: ULID ベース（本番用）

use ulid::Ulid;

use crate::domain::ids::{AtomId, EdgeId, Id, IdMarker, JobId, RunId, TaskId, TaskRunId};
use crate::ports::Clock;

/// IdGenerator は分散システムで使える ID を生成
///
/// # Thread Safety
/// - `Send + Sync` を要求（複数スレッドから使える）
pub trait IdGenerator: Send + Sync {
    /// 時刻ベースの ULID を 1 つ生成
    fn next_ulid(&self) -> Ulid;

    fn generate_job_id(&self) -> JobId {
        typed(self.next_ulid())
    }

    fn generate_run_id(&self) -> RunId {
        typed(self.next_ulid())
    }

    fn generate_task_id(&self) -> TaskId {
        typed(self.next_ulid())
    }

    fn generate_task_run_id(&self) -> TaskRunId {
        typed(self.next_ulid())
    }

    fn generate_atom_id(&self) -> AtomId {
        typed(self.next_ulid())
    }

    fn generate_edge_id(&self) -> EdgeId {
        typed(self.next_ulid())
    }
}

fn typed<T: IdMarker>(ulid: Ulid) -> Id<T> {
    Id::from_ulid(ulid)
}

/// UlidGenerator は ULID ベースの ID 生成器
///
/// Clock を使って現在時刻ベースの ULID を生成します。
/// これにより、テスト時に FixedClock を使って timestamp 部分を固定できます。
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn next_ulid(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{FixedClock, SystemClock};
    use chrono::{TimeZone, Utc};

    #[test]
    fn ulid_generator_generates_unique_ids() {
        let id_gen = UlidGenerator::new(SystemClock);

        let id1 = id_gen.generate_run_id();
        let id2 = id_gen.generate_run_id();
        let id3 = id_gen.generate_run_id();

        assert_ne!(id1, id2);
        assert_ne!(id2, id3);
        assert_ne!(id1, id3);
    }

    #[test]
    fn ulid_generator_with_fixed_clock_shares_timestamp() {
        let fixed_time = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let id_gen = UlidGenerator::new(FixedClock::new(fixed_time));

        let id1 = id_gen.generate_task_run_id();
        let id2 = id_gen.generate_task_run_id();

        // ランダム部分があるので ID 自体は異なる
        assert_ne!(id1, id2);
        assert_eq!(id1.as_ulid().timestamp_ms(), id2.as_ulid().timestamp_ms());
        assert_eq!(
            id1.as_ulid().timestamp_ms(),
            fixed_time.timestamp_millis() as u64
        );
    }

    #[test]
    fn different_id_types_are_generated() {
        let id_gen = UlidGenerator::new(SystemClock);

        assert!(id_gen.generate_job_id().to_string().starts_with("job-"));
        assert!(id_gen.generate_run_id().to_string().starts_with("run-"));
        assert!(id_gen.generate_task_run_id().to_string().starts_with("taskrun-"));
        assert!(id_gen.generate_edge_id().to_string().starts_with("edge-"));
    }
}
