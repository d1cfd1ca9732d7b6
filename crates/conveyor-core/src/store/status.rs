//! Worker status view: what one node currently holds, read straight from
//! TaskRun rows.

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use super::RunStore;
use super::rows::{dt_to_ms, ms_to_dt};
use crate::domain::{RunId, StoreError, TaskCounts, TaskId, TaskStatus};

/// Upper bound on `WorkerStatus::active_claims`.
pub const MAX_ACTIVE_CLAIMS: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveClaim {
    pub run_id: RunId,
    pub task_id: TaskId,
    pub claim_attempt: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_expires_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_id: Option<String>,

    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub node_id: String,

    /// Every TaskRun ever claimed by this node, any status.
    pub total_claimed: usize,
    pub by_status: TaskCounts,

    /// Claims currently running under a live lease.
    pub running_claims: usize,

    /// Claims still marked running whose lease has passed.
    pub expired_leases: usize,

    /// Sum of `claim_attempt` over this node's claims.
    pub claim_attempts: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,

    /// Most recently updated running claims, newest first.
    pub active_claims: Vec<ActiveClaim>,
}

impl RunStore {
    pub fn worker_status(&self, node_id: &str) -> Result<WorkerStatus, StoreError> {
        let now_ms = dt_to_ms(self.clock.now());
        let conn = self.lock()?;

        let mut status = WorkerStatus {
            node_id: node_id.to_string(),
            ..WorkerStatus::default()
        };

        {
            let mut stmt = conn.prepare(
                "SELECT status, COUNT(*) FROM task_runs WHERE claimed_by = ?1 GROUP BY status",
            )?;
            let rows = stmt.query_map(params![node_id], |row| {
                Ok((row.get::<_, TaskStatus>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (task_status, count) = row?;
                let count = count as usize;
                status.total_claimed += count;
                match task_status {
                    TaskStatus::Pending => status.by_status.pending += count,
                    TaskStatus::Running => status.by_status.running += count,
                    TaskStatus::Succeeded => status.by_status.succeeded += count,
                    TaskStatus::Failed => status.by_status.failed += count,
                    TaskStatus::Skipped => status.by_status.skipped += count,
                }
            }
        }

        let (running, expired, attempts, last_ms) = conn.query_row(
            "SELECT
               COALESCE(SUM(CASE WHEN status = 'running'
                 AND (claim_expires_at IS NULL OR claim_expires_at >= ?2) THEN 1 ELSE 0 END), 0),
               COALESCE(SUM(CASE WHEN status = 'running'
                 AND claim_expires_at IS NOT NULL AND claim_expires_at < ?2 THEN 1 ELSE 0 END), 0),
               COALESCE(SUM(claim_attempt), 0),
               MAX(updated_at)
             FROM task_runs WHERE claimed_by = ?1",
            params![node_id, now_ms],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                ))
            },
        )?;
        status.running_claims = running as usize;
        status.expired_leases = expired as usize;
        status.claim_attempts = attempts.max(0) as u64;
        status.last_activity = last_ms.map(ms_to_dt);

        let mut stmt = conn.prepare(
            "SELECT job_run_id, task_id, claim_attempt, claim_expires_at, runtime_id, updated_at
             FROM task_runs WHERE claimed_by = ?1 AND status = 'running'
             ORDER BY updated_at DESC, rowid DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![node_id, MAX_ACTIVE_CLAIMS as i64], |row| {
            Ok(ActiveClaim {
                run_id: row.get(0)?,
                task_id: row.get(1)?,
                claim_attempt: row.get(2)?,
                claim_expires_at: row.get::<_, Option<i64>>(3)?.map(ms_to_dt),
                runtime_id: row.get::<_, Option<String>>(4)?.filter(|s| !s.is_empty()),
                updated_at: ms_to_dt(row.get(5)?),
            })
        })?;
        for row in rows {
            status.active_claims.push(row?);
        }

        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ClaimGuard;
    use crate::store::ClaimRequest;
    use crate::store::testing::Fixture;
    use std::collections::BTreeMap;
    use std::time::Duration;

    #[test]
    fn unknown_node_has_empty_status() {
        let fx = Fixture::new();
        let status = fx.store.worker_status("ghost").unwrap();
        assert_eq!(status.node_id, "ghost");
        assert_eq!(status.total_claimed, 0);
        assert!(status.last_activity.is_none());
        assert!(status.active_claims.is_empty());
    }

    #[test]
    fn aggregates_claims_of_one_node() {
        let mut fx = Fixture::new();
        let a = fx.task(&[]);
        let b = fx.task(&[]);
        let c = fx.task(&[]);
        let sink = fx.task(&[]);
        fx.edge(a, sink);
        fx.edge(b, sink);
        fx.edge(c, sink);
        let run_id = fx.launch();

        let node_a = ClaimRequest::new("node-a", BTreeMap::new(), Duration::from_secs(60));
        let node_b = ClaimRequest::new("node-b", BTreeMap::new(), Duration::from_secs(60));
        fx.store.claim_next(&node_a).unwrap().unwrap();
        fx.store.claim_next(&node_a).unwrap().unwrap();
        fx.store.claim_next(&node_b).unwrap().unwrap();

        fx.store
            .start_task(run_id, a, "c-a", &ClaimGuard::owner("node-a"))
            .unwrap();
        fx.store
            .complete_task(run_id, a, "success", &ClaimGuard::owner("node-a"))
            .unwrap();

        let status = fx.store.worker_status("node-a").unwrap();
        assert_eq!(status.total_claimed, 2);
        assert_eq!(status.by_status.succeeded, 1);
        assert_eq!(status.by_status.running, 1);
        assert_eq!(status.running_claims, 1);
        assert_eq!(status.expired_leases, 0);
        assert_eq!(status.claim_attempts, 2);
        assert_eq!(status.active_claims.len(), 1);
        assert_eq!(status.active_claims[0].task_id, b);

        fx.advance(chrono::Duration::seconds(120));
        let later = fx.store.worker_status("node-a").unwrap();
        assert_eq!(later.running_claims, 0);
        assert_eq!(later.expired_leases, 1);

        let other = fx.store.worker_status("node-b").unwrap();
        assert_eq!(other.total_claimed, 1);
        assert_eq!(other.active_claims[0].task_id, c);
    }
}
