//! Lease-based claiming.
//!
//! Optimistic protocol, one `BEGIN IMMEDIATE` transaction per claim:
//! 1. select up to [`MAX_CLAIM_CANDIDATES`] claimable rows, oldest first
//! 2. drop candidates whose node selector this node does not satisfy
//! 3. conditional UPDATE that re-asserts the claimable predicate plus the
//!    row id; zero affected rows means another node won, try the next one

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{TransactionBehavior, params};
use tracing::{debug, warn};

use super::RunStore;
use super::rows::{TASK_RUN_COLUMNS, decode_selector, dt_to_ms, task_run_from_row};
use crate::domain::{StoreError, TaskRun, TaskRunId};

/// Candidates inspected per claim transaction.
pub const MAX_CLAIM_CANDIDATES: usize = 64;

/// Claimable predicate; `?1` is "now" in milliseconds.
const CLAIMABLE: &str = "status = 'pending' AND outstanding_predecessors = 0 \
     AND (claimed_by IS NULL OR claimed_by = '' OR claim_expires_at IS NULL OR claim_expires_at < ?1)";

/// Identity and lease settings of the claiming node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimRequest {
    pub node_id: String,
    pub node_labels: BTreeMap<String, String>,
    pub lease_ttl: Duration,
}

impl ClaimRequest {
    pub fn new(
        node_id: impl Into<String>,
        node_labels: BTreeMap<String, String>,
        lease_ttl: Duration,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            node_labels,
            lease_ttl,
        }
    }
}

/// True when `labels` satisfy every non-blank entry of `selector`.
pub fn selector_matches(
    selector: &BTreeMap<String, String>,
    labels: &BTreeMap<String, String>,
) -> bool {
    selector.iter().all(|(key, expected)| {
        let expected = expected.trim();
        expected.is_empty() || labels.get(key).map(String::as_str) == Some(expected)
    })
}

pub(crate) fn lease_deadline(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl RunStore {
    /// Claim the oldest claimable TaskRun this node may run.
    ///
    /// On success the row is `running`, owned by `request.node_id` until
    /// now + TTL, with `claim_attempt` bumped by one.
    pub fn claim_next(&self, request: &ClaimRequest) -> Result<Option<TaskRun>, StoreError> {
        let now = self.clock.now();
        let now_ms = dt_to_ms(now);
        let expires_ms = dt_to_ms(lease_deadline(now, request.lease_ttl));

        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let candidates = {
            let mut stmt = tx.prepare(&format!(
                "SELECT id, node_selector FROM task_runs WHERE {CLAIMABLE}
                 ORDER BY created_at ASC, rowid ASC LIMIT ?2"
            ))?;
            let rows = stmt.query_map(params![now_ms, MAX_CLAIM_CANDIDATES as i64], |row| {
                Ok((row.get::<_, TaskRunId>(0)?, row.get::<_, String>(1)?))
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            out
        };

        for (id, raw_selector) in candidates {
            let selector = match decode_selector(&raw_selector) {
                Ok(selector) => selector,
                Err(err) => {
                    warn!(task_run_id = %id, error = %err, "unreadable node selector, skipping");
                    continue;
                }
            };
            if !selector_matches(&selector, &request.node_labels) {
                continue;
            }

            let updated = tx.execute(
                &format!(
                    "UPDATE task_runs
                     SET status = 'running', claimed_by = ?2, claim_expires_at = ?3,
                         claim_attempt = claim_attempt + 1, updated_at = ?1
                     WHERE id = ?4 AND {CLAIMABLE}"
                ),
                params![now_ms, request.node_id, expires_ms, id],
            )?;
            if updated == 0 {
                debug!(node = %request.node_id, task_run_id = %id, "lost claim race");
                continue;
            }

            let claimed = tx.query_row(
                &format!("SELECT {TASK_RUN_COLUMNS} FROM task_runs WHERE id = ?1"),
                params![id],
                task_run_from_row,
            )?;
            tx.commit()?;
            debug!(
                node = %request.node_id,
                run_id = %claimed.job_run_id,
                task_id = %claimed.task_id,
                attempt = claimed.claim_attempt,
                "claimed task"
            );
            return Ok(Some(claimed));
        }

        tx.commit()?;
        Ok(None)
    }

    /// Put every running task whose lease has passed back to `pending`.
    pub fn reclaim_expired(&self) -> Result<usize, StoreError> {
        let now_ms = self.now_ms();
        let conn = self.lock()?;
        let reclaimed = conn.execute(
            "UPDATE task_runs
             SET status = 'pending', claimed_by = NULL, claim_expires_at = NULL,
                 runtime_id = NULL, started_at = NULL, updated_at = ?1
             WHERE status = 'running' AND claim_expires_at IS NOT NULL AND claim_expires_at < ?1",
            params![now_ms],
        )?;
        if reclaimed > 0 {
            warn!(tasks = reclaimed, "reclaimed expired task leases");
        }
        Ok(reclaimed)
    }

    /// Extend the lease of a running task still owned by `owner`.
    ///
    /// Fails with `LeaseLost` when the row is no longer running under `owner`.
    pub fn renew_lease(
        &self,
        task_run_id: TaskRunId,
        owner: &str,
        ttl: Duration,
    ) -> Result<DateTime<Utc>, StoreError> {
        let now = self.clock.now();
        let deadline = lease_deadline(now, ttl);
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE task_runs SET claim_expires_at = ?3, updated_at = ?4
             WHERE id = ?1 AND claimed_by = ?2 AND status = 'running'",
            params![task_run_id, owner, dt_to_ms(deadline), dt_to_ms(now)],
        )?;
        if updated == 0 {
            return Err(StoreError::LeaseLost {
                task_run_id,
                owner: owner.to_string(),
            });
        }
        Ok(deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ClaimGuard, TaskStatus};
    use crate::ports::Clock;
    use crate::store::testing::Fixture;
    use chrono::Duration as ChronoDuration;
    use rstest::rstest;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn request(node: &str) -> ClaimRequest {
        ClaimRequest::new(node, BTreeMap::new(), Duration::from_secs(60))
    }

    #[rstest]
    #[case::empty_selector(&[], &[], true)]
    #[case::matching(&[("zone", "eu")], &[("zone", "eu"), ("gpu", "1")], true)]
    #[case::missing_label(&[("zone", "eu")], &[], false)]
    #[case::different_value(&[("zone", "eu")], &[("zone", "us")], false)]
    #[case::blank_expectation(&[("zone", " ")], &[], true)]
    fn selector_matching(
        #[case] selector: &[(&str, &str)],
        #[case] node: &[(&str, &str)],
        #[case] expected: bool,
    ) {
        assert_eq!(selector_matches(&labels(selector), &labels(node)), expected);
    }

    #[test]
    fn claims_oldest_ready_task_first() {
        let mut fx = Fixture::new();
        let a = fx.task(&[]);
        let b = fx.task(&[]);
        fx.edge(a, b);
        let c = fx.task(&[]);
        let run_id = fx.launch();

        let first = fx.store.claim_next(&request("node-a")).unwrap().unwrap();
        assert_eq!(first.task_id, a);
        assert_eq!(first.status, TaskStatus::Running);
        assert_eq!(first.claimed_by.as_deref(), Some("node-a"));
        assert_eq!(first.claim_attempt, 1);
        assert_eq!(
            first.claim_expires_at,
            Some(fx.clock.now() + ChronoDuration::seconds(60))
        );

        // b still waits for a
        let second = fx.store.claim_next(&request("node-b")).unwrap().unwrap();
        assert_eq!(second.task_id, c);
        assert!(fx.store.claim_next(&request("node-b")).unwrap().is_none());

        fx.store
            .complete_task(run_id, a, "success", &ClaimGuard::owner("node-a"))
            .unwrap();
        let third = fx.store.claim_next(&request("node-b")).unwrap().unwrap();
        assert_eq!(third.task_id, b);
    }

    #[test]
    fn node_selector_filters_candidates() {
        let mut fx = Fixture::new();
        fx.task(&[("gpu", "true")]);
        let plain_id = fx.task(&[]);
        let sink = fx.task(&[]);
        fx.edge(plain_id, sink);
        fx.launch();

        let plain = fx.store.claim_next(&request("cpu-node")).unwrap().unwrap();
        assert!(plain.node_selector.is_empty());
        assert!(fx.store.claim_next(&request("cpu-node")).unwrap().is_none());

        let gpu = ClaimRequest::new("gpu-node", labels(&[("gpu", "true")]), Duration::from_secs(60));
        let claimed = fx.store.claim_next(&gpu).unwrap().unwrap();
        assert_eq!(claimed.node_selector.get("gpu").map(String::as_str), Some("true"));
    }

    #[test]
    fn active_lease_blocks_other_nodes_until_expiry() {
        let mut fx = Fixture::new();
        let a = fx.task(&[]);
        let run_id = fx.launch();

        fx.store.claim_next(&request("node-a")).unwrap().unwrap();
        assert!(fx.store.claim_next(&request("node-b")).unwrap().is_none());

        // Not yet expired: nothing to reclaim.
        assert_eq!(fx.store.reclaim_expired().unwrap(), 0);

        fx.advance(ChronoDuration::seconds(61));
        assert_eq!(fx.store.reclaim_expired().unwrap(), 1);

        let reclaimed = fx.store.get_task(run_id, a).unwrap();
        assert_eq!(reclaimed.status, TaskStatus::Pending);
        assert_eq!(reclaimed.claimed_by, None);

        let retry = fx.store.claim_next(&request("node-b")).unwrap().unwrap();
        assert_eq!(retry.claimed_by.as_deref(), Some("node-b"));
        assert_eq!(retry.claim_attempt, 2);
        assert_eq!(retry.atom_name(), format!("{}-attempt2", a.to_storage()));
    }

    #[rstest]
    #[case::blank_owner(Some(""), Some(30), true)]
    #[case::owner_without_expiry(Some("node-a"), None, true)]
    #[case::expired_lease(Some("node-a"), Some(-1), true)]
    #[case::live_lease(Some("node-a"), Some(30), false)]
    fn pending_rows_with_leftover_claims(
        #[case] owner: Option<&str>,
        #[case] expires_in_secs: Option<i64>,
        #[case] claimable: bool,
    ) {
        let mut fx = Fixture::new();
        let a = fx.task(&[]);
        let run_id = fx.launch();

        let expires_ms =
            expires_in_secs.map(|secs| dt_to_ms(fx.clock.now() + ChronoDuration::seconds(secs)));
        fx.store
            .lock()
            .unwrap()
            .execute(
                "UPDATE task_runs SET claimed_by = ?2, claim_expires_at = ?3 WHERE job_run_id = ?1",
                params![run_id, owner, expires_ms],
            )
            .unwrap();

        let claimed = fx.store.claim_next(&request("node-b")).unwrap();
        assert_eq!(claimed.is_some(), claimable);
        if let Some(task) = claimed {
            assert_eq!(task.task_id, a);
            assert_eq!(task.claimed_by.as_deref(), Some("node-b"));
        }
    }

    #[test]
    fn renew_lease_extends_only_for_the_owner() {
        let mut fx = Fixture::new();
        fx.task(&[]);
        fx.launch();
        let claimed = fx.store.claim_next(&request("node-a")).unwrap().unwrap();

        fx.advance(ChronoDuration::seconds(45));
        let deadline = fx
            .store
            .renew_lease(claimed.id, "node-a", Duration::from_secs(60))
            .unwrap();
        assert_eq!(deadline, fx.clock.now() + ChronoDuration::seconds(60));

        // original lease would have expired by now
        fx.advance(ChronoDuration::seconds(30));
        assert_eq!(fx.store.reclaim_expired().unwrap(), 0);

        let err = fx
            .store
            .renew_lease(claimed.id, "node-b", Duration::from_secs(60))
            .unwrap_err();
        assert!(err.is_claim_mismatch());
    }

    #[test]
    fn renew_after_reclaim_reports_lost_lease() {
        let mut fx = Fixture::new();
        fx.task(&[]);
        fx.launch();
        let claimed = fx.store.claim_next(&request("node-a")).unwrap().unwrap();

        fx.advance(ChronoDuration::seconds(120));
        fx.store.reclaim_expired().unwrap();

        let err = fx
            .store
            .renew_lease(claimed.id, "node-a", Duration::from_secs(60))
            .unwrap_err();
        assert!(matches!(err, StoreError::LeaseLost { .. }));
    }

    #[test]
    fn lease_deadline_saturates() {
        let now = Utc::now();
        assert_eq!(lease_deadline(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
    }
}
