//! Schema migrations for the run store.

use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};

use crate::domain::StoreError;

const SCHEMA_VERSION: i64 = 1;

/// Bring the schema up to [`SCHEMA_VERSION`].
///
/// 複数プロセスが同時に新しい DB を開いても 1 回だけ適用されるよう、
/// version の確認から記録までを 1 つの IMMEDIATE トランザクションで行う。
pub(crate) fn ensure_schema(conn: &mut Connection, now_ms: i64) -> Result<(), StoreError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    tx.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS conveyor_schema_migrations (
          version INTEGER PRIMARY KEY,
          name TEXT NOT NULL,
          applied_at INTEGER NOT NULL
        );
        "#,
    )?;

    let current: i64 = tx
        .query_row(
            "SELECT MAX(version) FROM conveyor_schema_migrations",
            [],
            |row| row.get::<_, Option<i64>>(0),
        )
        .optional()?
        .flatten()
        .unwrap_or(0);

    if current > SCHEMA_VERSION {
        return Err(StoreError::Decode {
            column: "conveyor_schema_migrations.version",
            message: format!(
                "schema version {current} is newer than supported {SCHEMA_VERSION}"
            ),
        });
    }
    if current < 1 {
        apply_v1(&tx)?;
        tx.execute(
            "INSERT OR IGNORE INTO conveyor_schema_migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
            params![1, "baseline_run_tables", now_ms],
        )?;
    }
    tx.commit()?;
    Ok(())
}

fn apply_v1(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS atoms (
          id TEXT PRIMARY KEY,
          engine TEXT NOT NULL,
          image TEXT NOT NULL,
          command TEXT NOT NULL DEFAULT ''
        );

        CREATE TABLE IF NOT EXISTS tasks (
          id TEXT PRIMARY KEY,
          job_id TEXT NOT NULL,
          atom_id TEXT NOT NULL,
          next_id TEXT NULL,
          node_selector TEXT NOT NULL DEFAULT '{}',
          created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_tasks_job_created
          ON tasks(job_id, created_at);

        CREATE TABLE IF NOT EXISTS task_edges (
          id TEXT PRIMARY KEY,
          job_id TEXT NOT NULL,
          from_task_id TEXT NOT NULL,
          to_task_id TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_task_edges_job
          ON task_edges(job_id);

        CREATE TABLE IF NOT EXISTS job_runs (
          id TEXT PRIMARY KEY,
          job_id TEXT NOT NULL,
          status TEXT NOT NULL,
          error TEXT NULL,
          started_at INTEGER NOT NULL,
          completed_at INTEGER NULL
        );
        CREATE INDEX IF NOT EXISTS idx_job_runs_job_status
          ON job_runs(job_id, status, started_at);

        CREATE TABLE IF NOT EXISTS task_runs (
          id TEXT PRIMARY KEY,
          job_run_id TEXT NOT NULL REFERENCES job_runs(id),
          task_id TEXT NOT NULL,
          atom_id TEXT NOT NULL,
          engine TEXT NOT NULL,
          image TEXT NOT NULL,
          command TEXT NOT NULL,
          status TEXT NOT NULL,
          result TEXT NULL,
          error TEXT NULL,
          runtime_id TEXT NULL,
          node_selector TEXT NOT NULL DEFAULT '{}',
          claimed_by TEXT NULL,
          claim_expires_at INTEGER NULL,
          claim_attempt INTEGER NOT NULL DEFAULT 0,
          outstanding_predecessors INTEGER NOT NULL DEFAULT 0,
          started_at INTEGER NULL,
          completed_at INTEGER NULL,
          created_at INTEGER NOT NULL,
          updated_at INTEGER NOT NULL,
          UNIQUE(job_run_id, task_id)
        );
        CREATE INDEX IF NOT EXISTS idx_task_runs_claimable
          ON task_runs(status, outstanding_predecessors, created_at);
        CREATE INDEX IF NOT EXISTS idx_task_runs_claimed_by
          ON task_runs(claimed_by, status);
        "#,
    )?;
    Ok(())
}
