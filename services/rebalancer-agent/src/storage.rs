// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2020 Joyent, Inc.
// Copyright 2026 Edgecast Cloud LLC.

//! SQLite-based assignment storage
//!
//! Every task's status is committed here before it is reported, so a
//! restarted agent can pick up exactly where it stopped.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use rusqlite::{Connection, OptionalExtension, params};
use strum::{Display, EnumString};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::error;

use rebalancer_types::{
    AgentAssignmentState, AgentAssignmentStats, Assignment, ObjectSkippedReason, StorageNode, Task,
    TaskStatus,
};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Assignment not found: {0}")]
    NotFound(String),
    #[error("Assignment not complete: {0}")]
    NotComplete(String),
    #[error("Assignment already exists: {0}")]
    AlreadyExists(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Unreadable {column} value {raw:?} stored for {key}")]
    InvalidRecord {
        column: &'static str,
        key: String,
        raw: String,
    },
}

/// Persisted state of an assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum AssignmentState {
    Scheduled,
    Running,
    Complete,
}

/// Persisted state of a single task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum TaskState {
    Pending,
    Downloading,
    Verifying,
    Complete,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Complete | TaskState::Failed)
    }
}

fn parse_column<T: FromStr>(column: &'static str, key: &str, raw: String) -> Result<T, StorageError> {
    T::from_str(&raw).map_err(|_| {
        error!(column, key, raw = %raw, "unreadable value in assignment database");
        StorageError::InvalidRecord {
            column,
            key: key.to_string(),
            raw,
        }
    })
}

/// SQLite-based storage for assignments
pub struct AssignmentStorage {
    conn: Arc<Mutex<Connection>>,
}

impl AssignmentStorage {
    /// Open (or create) the database at `db_path` and make sure the schema
    /// exists.
    pub fn new(db_path: &Path) -> Result<Self, StorageError> {
        let conn = Connection::open(db_path)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS assignments (
                uuid TEXT PRIMARY KEY,
                state TEXT NOT NULL DEFAULT 'scheduled',
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS tasks (
                assignment_uuid TEXT NOT NULL,
                object_id TEXT NOT NULL,
                owner TEXT NOT NULL,
                md5sum TEXT NOT NULL,
                source_datacenter TEXT NOT NULL,
                source_storage_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                failure_reason TEXT,
                PRIMARY KEY (assignment_uuid, object_id),
                FOREIGN KEY (assignment_uuid) REFERENCES assignments(uuid)
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
            CREATE INDEX IF NOT EXISTS idx_assignments_state ON assignments(state);
            "#,
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn has_assignment(&self, uuid: &str) -> Result<bool, StorageError> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM assignments WHERE uuid = ?",
            params![uuid],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Persist an assignment and all of its tasks in one transaction.
    pub async fn create(&self, uuid: &str, tasks: &[Task]) -> Result<(), StorageError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO assignments (uuid) VALUES (?)",
            params![uuid],
        )?;
        if inserted == 0 {
            return Err(StorageError::AlreadyExists(uuid.to_string()));
        }

        {
            // A repeated object id inside one payload keeps its first row.
            let mut stmt = tx.prepare(
                r#"INSERT OR IGNORE INTO tasks
                   (assignment_uuid, object_id, owner, md5sum, source_datacenter, source_storage_id)
                   VALUES (?, ?, ?, ?, ?, ?)"#,
            )?;

            for task in tasks {
                stmt.execute(params![
                    uuid,
                    task.object_id,
                    task.owner,
                    task.md5sum,
                    task.source.datacenter,
                    task.source.manta_storage_id,
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Assignment status as reported to the manager.
    pub async fn get(&self, uuid: &str) -> Result<Assignment, StorageError> {
        let conn = self.conn.lock().await;

        let raw_state: String = conn
            .query_row(
                "SELECT state FROM assignments WHERE uuid = ?",
                params![uuid],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StorageError::NotFound(uuid.to_string()))?;
        let state: AssignmentState = parse_column("assignments.state", uuid, raw_state)?;

        let mut stats = AgentAssignmentStats::new(0);
        {
            let mut stmt =
                conn.prepare("SELECT status, COUNT(*) FROM tasks WHERE assignment_uuid = ? GROUP BY status")?;
            let rows = stmt
                .query_map(params![uuid], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            for (raw, count) in rows {
                let task_state: TaskState = parse_column("tasks.status", uuid, raw)?;
                let count = count as usize;
                stats.total += count;
                // A finished assignment has no task left to run; one without
                // a terminal record never got a verified copy.
                let failed = task_state == TaskState::Failed
                    || (state == AssignmentState::Complete && !task_state.is_terminal());
                if task_state.is_terminal() || failed {
                    stats.complete += count;
                }
                if failed {
                    stats.failed += count;
                }
            }
        }

        stats.state = match state {
            AssignmentState::Scheduled => AgentAssignmentState::Scheduled,
            AssignmentState::Running => AgentAssignmentState::Running,
            AssignmentState::Complete => {
                let failed_tasks = Self::failed_tasks(&conn, uuid)?;
                if failed_tasks.is_empty() {
                    AgentAssignmentState::Complete(None)
                } else {
                    AgentAssignmentState::Complete(Some(failed_tasks))
                }
            }
        };

        Ok(Assignment {
            uuid: uuid.to_string(),
            stats,
        })
    }

    /// Every task of a finished assignment that did not complete. Tasks
    /// left without a terminal record are reported as filesystem errors.
    fn failed_tasks(conn: &Connection, uuid: &str) -> Result<Vec<Task>, StorageError> {
        let mut stmt = conn.prepare(
            r#"SELECT object_id, owner, md5sum, source_datacenter, source_storage_id, failure_reason,
                      status
               FROM tasks WHERE assignment_uuid = ? AND status != 'complete'
               ORDER BY object_id"#,
        )?;

        let rows = stmt
            .query_map(params![uuid], |row| {
                Ok((
                    Task {
                        object_id: row.get(0)?,
                        owner: row.get(1)?,
                        md5sum: row.get(2)?,
                        source: StorageNode {
                            datacenter: row.get(3)?,
                            manta_storage_id: row.get(4)?,
                        },
                        status: TaskStatus::Pending,
                    },
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(mut task, raw, status)| {
                let key = format!("{}/{}", uuid, task.object_id);
                if status != TaskState::Failed.to_string() {
                    error!(task = %key, status = %status, "task never reached a terminal status");
                    task.set_status(TaskStatus::Failed(ObjectSkippedReason::AgentFSError));
                    return Ok(task);
                }
                let raw = raw.unwrap_or_default();
                let reason: ObjectSkippedReason = serde_json::from_str(&raw).map_err(|e| {
                    error!(
                        task = %key,
                        raw_reason = %raw,
                        error = %e,
                        "unreadable failure reason in assignment database"
                    );
                    StorageError::InvalidRecord {
                        column: "tasks.failure_reason",
                        key: key.clone(),
                        raw: raw.clone(),
                    }
                })?;
                task.set_status(TaskStatus::Failed(reason));
                Ok(task)
            })
            .collect()
    }

    /// Tasks of an assignment that have no terminal status yet, including
    /// ones interrupted mid-download.
    pub async fn unfinished_tasks(&self, uuid: &str) -> Result<Vec<Task>, StorageError> {
        let conn = self.conn.lock().await;

        let mut stmt = conn.prepare(
            r#"SELECT object_id, owner, md5sum, source_datacenter, source_storage_id
               FROM tasks
               WHERE assignment_uuid = ? AND status NOT IN ('complete', 'failed')
               ORDER BY object_id"#,
        )?;

        let tasks = stmt
            .query_map(params![uuid], |row| {
                Ok(Task {
                    object_id: row.get(0)?,
                    owner: row.get(1)?,
                    md5sum: row.get(2)?,
                    source: StorageNode {
                        datacenter: row.get(3)?,
                        manta_storage_id: row.get(4)?,
                    },
                    status: TaskStatus::Pending,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(tasks)
    }

    pub async fn set_state(&self, uuid: &str, state: AssignmentState) -> Result<(), StorageError> {
        let conn = self.conn.lock().await;
        let rows_affected = conn.execute(
            "UPDATE assignments SET state = ? WHERE uuid = ?",
            params![state.to_string(), uuid],
        )?;
        if rows_affected == 0 {
            return Err(StorageError::NotFound(uuid.to_string()));
        }
        Ok(())
    }

    /// Record progress of a task that is still being worked on.
    pub async fn set_task_state(
        &self,
        uuid: &str,
        object_id: &str,
        state: TaskState,
    ) -> Result<(), StorageError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE tasks SET status = ? WHERE assignment_uuid = ? AND object_id = ?",
            params![state.to_string(), uuid, object_id],
        )?;
        Ok(())
    }

    pub async fn mark_task_complete(&self, uuid: &str, object_id: &str) -> Result<(), StorageError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE tasks SET status = 'complete', failure_reason = NULL WHERE assignment_uuid = ? AND object_id = ?",
            params![uuid, object_id],
        )?;
        Ok(())
    }

    pub async fn mark_task_failed(
        &self,
        uuid: &str,
        object_id: &str,
        reason: &ObjectSkippedReason,
    ) -> Result<(), StorageError> {
        let reason_json = serde_json::to_string(reason)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE tasks SET status = 'failed', failure_reason = ? WHERE assignment_uuid = ? AND object_id = ?",
            params![reason_json, uuid, object_id],
        )?;
        Ok(())
    }

    /// Assignments left scheduled or running, oldest first.
    pub async fn incomplete_assignments(&self) -> Result<Vec<String>, StorageError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT uuid FROM assignments WHERE state IN ('scheduled', 'running') ORDER BY created_at, uuid",
        )?;

        let uuids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;

        Ok(uuids)
    }

    /// Remove a completed assignment and its tasks.
    pub async fn delete(&self, uuid: &str) -> Result<(), StorageError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let raw_state: String = tx
            .query_row(
                "SELECT state FROM assignments WHERE uuid = ?",
                params![uuid],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StorageError::NotFound(uuid.to_string()))?;

        let state: AssignmentState = parse_column("assignments.state", uuid, raw_state)?;
        if state != AssignmentState::Complete {
            return Err(StorageError::NotComplete(uuid.to_string()));
        }

        tx.execute("DELETE FROM tasks WHERE assignment_uuid = ?", params![uuid])?;
        tx.execute("DELETE FROM assignments WHERE uuid = ?", params![uuid])?;
        tx.commit()?;

        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn corrupt(&self, sql: &str) {
        let conn = self.conn.lock().await;
        conn.execute(sql, []).unwrap();
    }
}
