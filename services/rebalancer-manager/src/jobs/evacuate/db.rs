// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2020 Joyent, Inc.
// Copyright 2026 Edgecast Cloud LLC.

//! Per-object state of evacuate jobs
//!
//! Every object a job discovers is recorded here, keyed by job and object id,
//! before it moves down the pipeline. A retry job is seeded from the rows of
//! the job it retries.

use std::collections::HashMap;

use async_trait::async_trait;
use deadpool_postgres::Pool;
use tokio::sync::Mutex;
use tokio_postgres::types::Json;
use tracing::debug;
use uuid::Uuid;

use rebalancer_types::{DuplicateObject, ObjectSkippedReason, StorageNode};

use super::types::{EvacuateObject, EvacuateObjectStatus};
use crate::db::{StoreError, fit_column, parse_column};

/// Whether an insert recorded a new object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The id was already recorded for this job
    Duplicate,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn insert_object(
        &self,
        job_id: &Uuid,
        obj: &EvacuateObject,
    ) -> Result<InsertOutcome, StoreError>;

    /// Overwrite the mutable columns of a recorded object.
    async fn update_object(&self, job_id: &Uuid, obj: &EvacuateObject) -> Result<(), StoreError>;

    async fn record_duplicate(&self, job_id: &Uuid, id: &str, shard: u32)
    -> Result<(), StoreError>;

    async fn duplicates(&self, job_id: &Uuid) -> Result<Vec<DuplicateObject>, StoreError>;

    /// All objects of a job, in discovery order.
    async fn objects(&self, job_id: &Uuid) -> Result<Vec<EvacuateObject>, StoreError>;

    /// Objects of a job that did not reach `complete`, in discovery order.
    async fn unresolved_objects(&self, job_id: &Uuid) -> Result<Vec<EvacuateObject>, StoreError>;
}

/// PostgreSQL-backed object store, sharing the manager's pool
pub struct EvacuateDb {
    pool: Pool,
}

const OBJECT_COLUMNS: &str = "id, owner, content_length, content_md5, sharks, shard, \
                              assignment_id, dest_shark, status, skipped_reason, error";

impl EvacuateDb {
    /// Wrap the pool and create the tables if they don't exist.
    pub async fn new(pool: Pool) -> Result<Self, StoreError> {
        let db = Self { pool };
        db.init_schema().await?;
        Ok(db)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        let client = self.pool.get().await?;

        client
            .batch_execute(
                r#"
                CREATE TABLE IF NOT EXISTS evacuateobjects (
                    job_id UUID NOT NULL,
                    id TEXT NOT NULL,
                    seq BIGSERIAL,
                    owner TEXT NOT NULL,
                    content_length BIGINT NOT NULL,
                    content_md5 TEXT NOT NULL,
                    sharks JSONB NOT NULL,
                    shard INTEGER NOT NULL,
                    assignment_id TEXT,
                    dest_shark JSONB,
                    status TEXT NOT NULL DEFAULT 'unprocessed'
                        CHECK(status IN ('unprocessed', 'assigned', 'skipped', 'error', 'post_processing', 'complete')),
                    skipped_reason TEXT,
                    error TEXT,
                    PRIMARY KEY (job_id, id)
                );

                CREATE INDEX IF NOT EXISTS idx_evacuateobjects_status
                    ON evacuateobjects(job_id, status);

                CREATE TABLE IF NOT EXISTS duplicates (
                    job_id UUID NOT NULL,
                    id TEXT NOT NULL,
                    shard INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_duplicates_job ON duplicates(job_id);
                "#,
            )
            .await?;

        debug!("Evacuate object schema initialized");
        Ok(())
    }

    async fn select_objects(
        &self,
        job_id: &Uuid,
        unresolved_only: bool,
    ) -> Result<Vec<EvacuateObject>, StoreError> {
        let client = self.pool.get().await?;
        let filter = if unresolved_only {
            "AND status <> 'complete'"
        } else {
            ""
        };
        let query = format!(
            "SELECT {} FROM evacuateobjects WHERE job_id = $1 {} ORDER BY seq",
            OBJECT_COLUMNS, filter
        );

        let rows = client.query(query.as_str(), &[job_id]).await?;
        rows.iter().map(row_to_evacuate_object).collect()
    }
}

fn row_to_evacuate_object(row: &tokio_postgres::Row) -> Result<EvacuateObject, StoreError> {
    let id: String = row.get(0);
    let content_length: i64 = row.get(2);
    let Json(sharks): Json<Vec<StorageNode>> = row.get(4);
    let shard: i32 = row.get(5);
    let dest_shark: Option<Json<StorageNode>> = row.get(7);
    let status: String = row.get(8);
    let skipped_reason: Option<String> = row.get(9);
    let error: Option<String> = row.get(10);

    let skipped_reason = skipped_reason
        .map(|raw| {
            ObjectSkippedReason::parse_label(&raw).map_err(|e| {
                tracing::error!(key = %id, raw = %raw, error = %e, "Unparseable skipped_reason");
                StoreError::InvalidRecord {
                    column: "skipped_reason",
                    key: id.clone(),
                    raw,
                }
            })
        })
        .transpose()?;

    Ok(EvacuateObject {
        owner: row.get(1),
        content_length: fit_column("content_length", &id, content_length)?,
        content_md5: row.get(3),
        sharks,
        shard: fit_column("shard", &id, shard)?,
        assignment_id: row.get(6),
        dest_shark: dest_shark.map(|Json(node)| node),
        status: parse_column("status", &id, &status)?,
        skipped_reason,
        error: error
            .map(|raw| parse_column("error", &id, &raw))
            .transpose()?,
        id,
    })
}

#[async_trait]
impl ObjectStore for EvacuateDb {
    async fn insert_object(
        &self,
        job_id: &Uuid,
        obj: &EvacuateObject,
    ) -> Result<InsertOutcome, StoreError> {
        let content_length: i64 = fit_column("content_length", &obj.id, obj.content_length)?;
        let shard: i32 = fit_column("shard", &obj.id, obj.shard)?;
        let client = self.pool.get().await?;

        let inserted = client
            .execute(
                r#"
                INSERT INTO evacuateobjects
                    (job_id, id, owner, content_length, content_md5, sharks, shard,
                     assignment_id, dest_shark, status, skipped_reason, error)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                ON CONFLICT (job_id, id) DO NOTHING
                "#,
                &[
                    job_id,
                    &obj.id,
                    &obj.owner,
                    &content_length,
                    &obj.content_md5,
                    &Json(&obj.sharks),
                    &shard,
                    &obj.assignment_id,
                    &obj.dest_shark.as_ref().map(Json),
                    &obj.status.to_string(),
                    &obj.skipped_reason.as_ref().map(|r| r.label()),
                    &obj.error.as_ref().map(|e| e.to_string()),
                ],
            )
            .await?;

        Ok(if inserted == 0 {
            InsertOutcome::Duplicate
        } else {
            InsertOutcome::Inserted
        })
    }

    async fn update_object(&self, job_id: &Uuid, obj: &EvacuateObject) -> Result<(), StoreError> {
        let client = self.pool.get().await?;

        let updated = client
            .execute(
                r#"
                UPDATE evacuateobjects
                SET assignment_id = $3, dest_shark = $4, status = $5,
                    skipped_reason = $6, error = $7
                WHERE job_id = $1 AND id = $2
                "#,
                &[
                    job_id,
                    &obj.id,
                    &obj.assignment_id,
                    &obj.dest_shark.as_ref().map(Json),
                    &obj.status.to_string(),
                    &obj.skipped_reason.as_ref().map(|r| r.label()),
                    &obj.error.as_ref().map(|e| e.to_string()),
                ],
            )
            .await?;

        if updated == 0 {
            return Err(StoreError::Query(format!(
                "object {} is not recorded for job {}",
                obj.id, job_id
            )));
        }
        Ok(())
    }

    async fn record_duplicate(
        &self,
        job_id: &Uuid,
        id: &str,
        shard: u32,
    ) -> Result<(), StoreError> {
        let shard: i32 = fit_column("shard", id, shard)?;
        let client = self.pool.get().await?;
        client
            .execute(
                "INSERT INTO duplicates (job_id, id, shard) VALUES ($1, $2, $3)",
                &[job_id, &id, &shard],
            )
            .await?;
        Ok(())
    }

    async fn duplicates(&self, job_id: &Uuid) -> Result<Vec<DuplicateObject>, StoreError> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT id, shard FROM duplicates WHERE job_id = $1 ORDER BY id",
                &[job_id],
            )
            .await?;

        rows.iter()
            .map(|row| {
                let id: String = row.get(0);
                let shard: i32 = row.get(1);
                Ok(DuplicateObject {
                    shard: fit_column("shard", &id, shard)?,
                    id,
                })
            })
            .collect()
    }

    async fn objects(&self, job_id: &Uuid) -> Result<Vec<EvacuateObject>, StoreError> {
        self.select_objects(job_id, false).await
    }

    async fn unresolved_objects(&self, job_id: &Uuid) -> Result<Vec<EvacuateObject>, StoreError> {
        self.select_objects(job_id, true).await
    }
}

// ============================================================================
// In-memory object store
// ============================================================================

#[derive(Default)]
struct JobObjects {
    // Discovery order
    order: Vec<String>,
    objects: HashMap<String, EvacuateObject>,
    duplicates: Vec<DuplicateObject>,
}

/// In-process object store with the same semantics as [`EvacuateDb`].
#[derive(Default)]
pub struct MemoryObjectStore {
    jobs: Mutex<HashMap<Uuid, JobObjects>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, job_id: &Uuid, id: &str) -> Option<EvacuateObject> {
        self.jobs
            .lock()
            .await
            .get(job_id)
            .and_then(|j| j.objects.get(id).cloned())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn insert_object(
        &self,
        job_id: &Uuid,
        obj: &EvacuateObject,
    ) -> Result<InsertOutcome, StoreError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.entry(*job_id).or_default();
        if job.objects.contains_key(&obj.id) {
            return Ok(InsertOutcome::Duplicate);
        }
        job.order.push(obj.id.clone());
        job.objects.insert(obj.id.clone(), obj.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn update_object(&self, job_id: &Uuid, obj: &EvacuateObject) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().await;
        let stored = jobs
            .get_mut(job_id)
            .and_then(|j| j.objects.get_mut(&obj.id))
            .ok_or_else(|| {
                StoreError::Query(format!(
                    "object {} is not recorded for job {}",
                    obj.id, job_id
                ))
            })?;
        *stored = obj.clone();
        Ok(())
    }

    async fn record_duplicate(
        &self,
        job_id: &Uuid,
        id: &str,
        shard: u32,
    ) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().await;
        jobs.entry(*job_id).or_default().duplicates.push(DuplicateObject {
            id: id.to_string(),
            shard,
        });
        Ok(())
    }

    async fn duplicates(&self, job_id: &Uuid) -> Result<Vec<DuplicateObject>, StoreError> {
        let jobs = self.jobs.lock().await;
        let mut duplicates = jobs
            .get(job_id)
            .map(|j| j.duplicates.clone())
            .unwrap_or_default();
        duplicates.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(duplicates)
    }

    async fn objects(&self, job_id: &Uuid) -> Result<Vec<EvacuateObject>, StoreError> {
        let jobs = self.jobs.lock().await;
        Ok(jobs
            .get(job_id)
            .map(|j| {
                j.order
                    .iter()
                    .filter_map(|id| j.objects.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn unresolved_objects(&self, job_id: &Uuid) -> Result<Vec<EvacuateObject>, StoreError> {
        Ok(self
            .objects(job_id)
            .await?
            .into_iter()
            .filter(|o| o.status != EvacuateObjectStatus::Complete)
            .collect())
    }
}
