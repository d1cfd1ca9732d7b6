//! Definition catalog: atoms, tasks and task edges.
//!
//! The importer owns these rows; the coordinator reads them to launch runs
//! and to resolve successors. The insert helpers exist for tooling and tests.

use rusqlite::{Connection, OptionalExtension, params};

use super::RunStore;
use super::rows::{
    TASK_COLUMNS, atom_from_row, dt_to_ms, edge_from_row, encode_selector, task_from_row,
};
use crate::dag::DependencyGraph;
use crate::domain::{AtomDefinition, AtomId, JobId, StoreError, TaskDefinition, TaskEdge};

impl RunStore {
    pub fn insert_atom(&self, atom: &AtomDefinition) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO atoms (id, engine, image, command) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET engine = excluded.engine, image = excluded.image,
               command = excluded.command",
            params![atom.id, atom.engine, atom.image, atom.command],
        )?;
        Ok(())
    }

    pub fn insert_task(&self, task: &TaskDefinition) -> Result<(), StoreError> {
        let selector = encode_selector(&task.node_selector)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO tasks (id, job_id, atom_id, next_id, node_selector, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                task.id,
                task.job_id,
                task.atom_id,
                task.next_id,
                selector,
                dt_to_ms(task.created_at)
            ],
        )?;
        Ok(())
    }

    pub fn insert_edge(&self, edge: &TaskEdge) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO task_edges (id, job_id, from_task_id, to_task_id) VALUES (?1, ?2, ?3, ?4)",
            params![edge.id, edge.job_id, edge.from_task_id, edge.to_task_id],
        )?;
        Ok(())
    }

    pub fn get_atom(&self, atom_id: AtomId) -> Result<AtomDefinition, StoreError> {
        let conn = self.lock()?;
        load_atom(&conn, atom_id)
    }

    /// Tasks of a job in creation order.
    pub fn list_tasks(&self, job_id: JobId) -> Result<Vec<TaskDefinition>, StoreError> {
        let conn = self.lock()?;
        load_tasks(&conn, job_id)
    }

    pub fn list_edges(&self, job_id: JobId) -> Result<Vec<TaskEdge>, StoreError> {
        let conn = self.lock()?;
        load_edges(&conn, job_id)
    }

    /// Dependency graph of a job, built from the current catalog rows.
    pub fn job_graph(&self, job_id: JobId) -> Result<DependencyGraph, StoreError> {
        let conn = self.lock()?;
        load_graph(&conn, job_id)
    }
}

pub(crate) fn load_atom(conn: &Connection, atom_id: AtomId) -> Result<AtomDefinition, StoreError> {
    conn.query_row(
        "SELECT id, engine, image, command FROM atoms WHERE id = ?1",
        params![atom_id],
        atom_from_row,
    )
    .optional()?
    .ok_or(StoreError::AtomNotFound(atom_id))
}

pub(crate) fn load_tasks(conn: &Connection, job_id: JobId) -> Result<Vec<TaskDefinition>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {TASK_COLUMNS} FROM tasks WHERE job_id = ?1 ORDER BY created_at ASC, rowid ASC"
    ))?;
    let rows = stmt.query_map(params![job_id], task_from_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

pub(crate) fn load_edges(conn: &Connection, job_id: JobId) -> Result<Vec<TaskEdge>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, job_id, from_task_id, to_task_id FROM task_edges
         WHERE job_id = ?1 ORDER BY rowid ASC",
    )?;
    let rows = stmt.query_map(params![job_id], edge_from_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

pub(crate) fn load_graph(conn: &Connection, job_id: JobId) -> Result<DependencyGraph, StoreError> {
    let tasks = load_tasks(conn, job_id)?;
    let edges = load_edges(conn, job_id)?;
    Ok(DependencyGraph::from_definitions(&tasks, &edges))
}
