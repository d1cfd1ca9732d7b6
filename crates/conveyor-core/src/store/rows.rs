//! Row <-> domain conversions.
//!
//! - ids are stored as bare ULID text
//! - timestamps are stored as unix milliseconds
//! - statuses and engine kinds are stored as their lowercase names

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::Row;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Type, ValueRef};

use crate::domain::{
    AtomDefinition, EngineKind, Id, IdMarker, JobRun, RunStatus, StoreError, TaskDefinition,
    TaskEdge, TaskRun, TaskStatus,
};

impl<T: IdMarker> ToSql for Id<T> {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.to_storage()))
    }
}

impl<T: IdMarker> FromSql for Id<T> {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

macro_rules! text_enum_sql {
    ($ty:ty) => {
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

text_enum_sql!(TaskStatus);
text_enum_sql!(RunStatus);
text_enum_sql!(EngineKind);

pub(crate) fn dt_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub(crate) fn ms_to_dt(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub(crate) fn encode_selector(selector: &BTreeMap<String, String>) -> Result<String, StoreError> {
    serde_json::to_string(selector).map_err(|e| StoreError::Decode {
        column: "node_selector",
        message: e.to_string(),
    })
}

pub(crate) fn decode_selector(raw: &str) -> Result<BTreeMap<String, String>, serde_json::Error> {
    if raw.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    serde_json::from_str(raw)
}

fn selector_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<BTreeMap<String, String>> {
    let raw: String = row.get(idx)?;
    decode_selector(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn opt_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    Ok(row.get::<_, Option<i64>>(idx)?.map(ms_to_dt))
}

/// Empty strings written by older tooling count as "no owner".
fn opt_text(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<String>> {
    Ok(row
        .get::<_, Option<String>>(idx)?
        .filter(|s| !s.is_empty()))
}

pub(crate) const TASK_RUN_COLUMNS: &str = "id, job_run_id, task_id, atom_id, engine, image, command, \
     status, result, error, runtime_id, node_selector, claimed_by, claim_expires_at, \
     claim_attempt, outstanding_predecessors, started_at, completed_at, created_at, updated_at";

pub(crate) fn task_run_from_row(row: &Row<'_>) -> rusqlite::Result<TaskRun> {
    Ok(TaskRun {
        id: row.get(0)?,
        job_run_id: row.get(1)?,
        task_id: row.get(2)?,
        atom_id: row.get(3)?,
        engine: row.get(4)?,
        image: row.get(5)?,
        command: row.get(6)?,
        status: row.get(7)?,
        result: row.get(8)?,
        error: row.get(9)?,
        runtime_id: opt_text(row, 10)?,
        node_selector: selector_column(row, 11)?,
        claimed_by: opt_text(row, 12)?,
        claim_expires_at: opt_time(row, 13)?,
        claim_attempt: row.get(14)?,
        outstanding_predecessors: row.get(15)?,
        started_at: opt_time(row, 16)?,
        completed_at: opt_time(row, 17)?,
        created_at: ms_to_dt(row.get(18)?),
        updated_at: ms_to_dt(row.get(19)?),
    })
}

pub(crate) const JOB_RUN_COLUMNS: &str = "id, job_id, status, error, started_at, completed_at";

pub(crate) fn job_run_from_row(row: &Row<'_>) -> rusqlite::Result<JobRun> {
    Ok(JobRun {
        id: row.get(0)?,
        job_id: row.get(1)?,
        status: row.get(2)?,
        error: row.get(3)?,
        started_at: ms_to_dt(row.get(4)?),
        completed_at: opt_time(row, 5)?,
    })
}

pub(crate) const TASK_COLUMNS: &str = "id, job_id, atom_id, next_id, node_selector, created_at";

pub(crate) fn task_from_row(row: &Row<'_>) -> rusqlite::Result<TaskDefinition> {
    Ok(TaskDefinition {
        id: row.get(0)?,
        job_id: row.get(1)?,
        atom_id: row.get(2)?,
        next_id: row.get(3)?,
        node_selector: selector_column(row, 4)?,
        created_at: ms_to_dt(row.get(5)?),
    })
}

pub(crate) fn atom_from_row(row: &Row<'_>) -> rusqlite::Result<AtomDefinition> {
    Ok(AtomDefinition {
        id: row.get(0)?,
        engine: row.get(1)?,
        image: row.get(2)?,
        command: row.get(3)?,
    })
}

pub(crate) fn edge_from_row(row: &Row<'_>) -> rusqlite::Result<TaskEdge> {
    Ok(TaskEdge {
        id: row.get(0)?,
        job_id: row.get(1)?,
        from_task_id: row.get(2)?,
        to_task_id: row.get(3)?,
    })
}
