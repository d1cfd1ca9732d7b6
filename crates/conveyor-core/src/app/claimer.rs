//! Claimer - node identity + lease settings bound to a run store
//!
//! `RunStore::claim_next` はリクエストを毎回受け取るが、Worker Pool から見ると
//! 「このノードとして次の仕事をくれ」だけで十分。その束縛をここで行う。

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::domain::{StoreError, TaskRun};
use crate::ports::{ExpiredReclaimer, TaskClaimer};
use crate::store::{ClaimRequest, RunStore};

/// Node identity used when none is configured.
pub const DEFAULT_NODE_ID: &str = "unknown-node";

/// Lease TTL used when the configured one is zero.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(5 * 60);

/// Claims tasks from a [`RunStore`] on behalf of one node.
#[derive(Clone)]
pub struct Claimer {
    store: RunStore,
    request: ClaimRequest,
}

impl Claimer {
    pub fn new(
        store: RunStore,
        node_id: &str,
        node_labels: BTreeMap<String, String>,
        lease_ttl: Duration,
    ) -> Self {
        let node_id = match node_id.trim() {
            "" => DEFAULT_NODE_ID,
            trimmed => trimmed,
        };
        let lease_ttl = if lease_ttl.is_zero() {
            DEFAULT_LEASE_TTL
        } else {
            lease_ttl
        };
        Self {
            store,
            request: ClaimRequest::new(node_id, node_labels, lease_ttl),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.request.node_id
    }

    pub fn lease_ttl(&self) -> Duration {
        self.request.lease_ttl
    }

    pub fn node_labels(&self) -> &BTreeMap<String, String> {
        &self.request.node_labels
    }
}

#[async_trait]
impl TaskClaimer for Claimer {
    async fn claim_next(&self) -> Result<Option<TaskRun>, StoreError> {
        let request = self.request.clone();
        self.store
            .blocking(move |store| store.claim_next(&request))
            .await
    }

    fn as_reclaimer(&self) -> Option<&dyn ExpiredReclaimer> {
        Some(self)
    }
}

#[async_trait]
impl ExpiredReclaimer for Claimer {
    async fn reclaim_expired(&self) -> Result<usize, StoreError> {
        let reclaimed = self.store.blocking(RunStore::reclaim_expired).await?;
        if reclaimed > 0 {
            debug!(node = %self.request.node_id, tasks = reclaimed, "reclaim pass");
        }
        Ok(reclaimed)
    }
}

/// Parse `k=v,k2=v2` into a label map.
///
/// Keys and values are trimmed. Entries without `=`, or with a blank key or
/// value, are dropped. A later duplicate key wins.
pub fn parse_node_labels(raw: &str) -> BTreeMap<String, String> {
    raw.split(',')
        .filter_map(|entry| {
            let (key, value) = entry.split_once('=')?;
            let (key, value) = (key.trim(), value.trim());
            if key.is_empty() || value.is_empty() {
                return None;
            }
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}
