//! Run Store - SQLite-backed persistence and state machine for job/task runs.
//!
//! # 設計
//! - 1 つの store handle = 1 つの SQLite connection（`Arc<Mutex<Connection>>`）
//! - 複数の worker プロセスが同じ DB ファイルを共有できる
//! - 状態遷移はすべて 1 トランザクション内で完結し、await を跨がない
//! - claim 系は `BEGIN IMMEDIATE` + busy timeout で直列化する
//!
//! The store is the only writer of run rows. Claimer and executor mutate
//! state exclusively through the claim-aware methods defined here.

mod catalog;
mod claims;
mod rows;
mod runs;
mod schema;
mod status;

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::Connection;
use tracing::debug;

use crate::domain::StoreError;
use crate::ports::{Clock, IdGenerator, SystemClock, UlidGenerator};

pub use self::claims::{ClaimRequest, MAX_CLAIM_CANDIDATES, selector_matches};
pub use self::status::{ActiveClaim, WorkerStatus, MAX_ACTIVE_CLAIMS};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct RunStore {
    conn: Arc<Mutex<Connection>>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl RunStore {
    /// Open (or create) the database file at `path`.
    pub fn open(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        debug!(path = %path.display(), "opening run store");
        let conn = Connection::open(path)?;
        // busy timeout first: even the journal-mode switch can hit a lock
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            "#,
        )?;
        Self::from_connection(conn, clock)
    }

    /// Private in-memory database. Not shareable between handles.
    pub fn open_in_memory(clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?, clock)
    }

    pub fn open_default(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open(path, Arc::new(SystemClock))
    }

    fn from_connection(mut conn: Connection, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        schema::ensure_schema(&mut conn, rows::dt_to_ms(clock.now()))?;
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            clock,
            ids,
        })
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn ids(&self) -> &Arc<dyn IdGenerator> {
        &self.ids
    }

    /// Run `op` against a clone of this handle on tokio's blocking pool.
    ///
    /// SQLite calls can sit in the busy timeout while another process holds
    /// the write lock; async callers go through here so that wait never
    /// parks a runtime worker thread.
    pub async fn blocking<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&RunStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(|err| StoreError::Blocking(err.to_string()))?
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn now_ms(&self) -> i64 {
        rows::dt_to_ms(self.clock.now())
    }
}
