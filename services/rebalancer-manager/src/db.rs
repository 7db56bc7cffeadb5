// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2020 Joyent, Inc.
// Copyright 2026 Edgecast Cloud LLC.

//! Job persistence
//!
//! Jobs and their result counters live in PostgreSQL, reached through a
//! deadpool connection pool over the pure-Rust tokio-postgres driver.
//! [`MemoryJobStore`] implements the same [`JobStore`] trait in process.

use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config, Pool, Runtime};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_postgres::NoTls;
use uuid::Uuid;

use rebalancer_types::{
    JobAction, JobConfigEvacuate, JobDbEntry, JobState, JobStatus, JobStatusConfig,
    JobStatusResults, StorageNode,
};

/// Labels present in every job status, even before anything is counted.
pub const BASE_RESULT_LABELS: [&str; 3] = ["total", "duplicate", "complete"];

/// Job store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Job not found: {0}")]
    NotFound(Uuid),

    #[error("Job {0} already finished")]
    Finished(Uuid),

    #[error("Invalid {column} value '{raw}' in stored record {key}")]
    InvalidRecord {
        column: &'static str,
        key: String,
        raw: String,
    },
}

impl From<tokio_postgres::Error> for StoreError {
    fn from(e: tokio_postgres::Error) -> Self {
        StoreError::Query(e.to_string())
    }
}

impl From<deadpool_postgres::PoolError> for StoreError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        StoreError::Connection(e.to_string())
    }
}

/// Parse a stored enum column. Unknown values are an error, never a default.
pub(crate) fn parse_column<T: FromStr>(
    column: &'static str,
    key: &str,
    raw: &str,
) -> Result<T, StoreError> {
    raw.parse().map_err(|_| {
        tracing::error!(column, key = %key, raw = %raw, "Unparseable value in stored record");
        StoreError::InvalidRecord {
            column,
            key: key.to_string(),
            raw: raw.to_string(),
        }
    })
}

/// Move an integer between its Rust and column widths. A value that does
/// not fit is an error, never silently wrapped.
pub(crate) fn fit_column<T, U>(column: &'static str, key: &str, value: T) -> Result<U, StoreError>
where
    T: Copy + std::fmt::Display,
    U: TryFrom<T>,
{
    U::try_from(value).map_err(|_| {
        tracing::error!(column, key = %key, value = %value, "Integer out of range for column");
        StoreError::InvalidRecord {
            column,
            key: key.to_string(),
            raw: value.to_string(),
        }
    })
}

/// A job as stored
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub id: Uuid,
    pub action: JobAction,
    pub state: JobState,
    pub from_shark: StorageNode,
    pub max_objects: Option<u32>,
    pub failure_reason: Option<String>,
    /// Job whose unresolved objects seed this one
    pub retry_of: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Convert to API JobDbEntry type (for listing)
    pub fn into_db_entry(self) -> JobDbEntry {
        JobDbEntry {
            id: self.id.to_string(),
            action: self.action,
            state: self.state,
            from_shark: self.from_shark.manta_storage_id,
            created_at: self.created_at,
        }
    }

    /// Build the status document, filling in the base counters.
    pub fn into_status(self, mut results: HashMap<String, i64>) -> JobStatus {
        for label in BASE_RESULT_LABELS {
            results.entry(label.to_string()).or_insert(0);
        }

        let config = match self.action {
            JobAction::Evacuate => JobStatusConfig::Evacuate(JobConfigEvacuate {
                from_shark: self.from_shark,
                max_objects: self.max_objects,
                retry_of: self.retry_of.map(|id| id.to_string()),
            }),
        };

        JobStatus {
            id: self.id.to_string(),
            config,
            results: JobStatusResults::Evacuate(results),
            state: self.state,
            failure_reason: self.failure_reason,
        }
    }
}

/// Parameters of a job about to be created
#[derive(Debug, Clone)]
pub struct NewJob {
    pub from_shark: StorageNode,
    pub max_objects: Option<u32>,
    pub retry_of: Option<Uuid>,
}

/// Durable job state and result counters.
///
/// State changes never leave a terminal state; attempts return
/// [`StoreError::Finished`].
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job in `init` and return its id.
    async fn create_job(&self, job: &NewJob) -> Result<Uuid, StoreError>;

    async fn get_job(&self, id: &Uuid) -> Result<JobRecord, StoreError>;

    /// Jobs newest first, optionally only those in `state`.
    async fn list_jobs(&self, state: Option<JobState>) -> Result<Vec<JobRecord>, StoreError>;

    /// Move a job to a non-terminal state.
    async fn set_state(&self, id: &Uuid, state: JobState) -> Result<(), StoreError>;

    /// Move a job to a terminal state, recording why it failed.
    async fn finish_job(
        &self,
        id: &Uuid,
        state: JobState,
        failure_reason: Option<&str>,
    ) -> Result<(), StoreError>;

    async fn increment_result(&self, id: &Uuid, label: &str) -> Result<(), StoreError>;

    async fn get_results(&self, id: &Uuid) -> Result<HashMap<String, i64>, StoreError>;

    /// Fail every job left unfinished by a previous process.
    async fn fail_interrupted_jobs(&self, reason: &str) -> Result<Vec<Uuid>, StoreError>;
}

// ============================================================================
// PostgreSQL
// ============================================================================

/// PostgreSQL-backed job store
pub struct Database {
    pool: Pool,
}

const JOB_COLUMNS: &str = "id, action, state, from_shark, from_shark_datacenter, max_objects, \
                           failure_reason, retry_of, created_at, updated_at";

impl Database {
    /// Create a new database connection pool from a connection URL
    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        let pool = create_pool(database_url)?;

        // Test the connection
        let client = pool.get().await?;
        client
            .execute("SELECT 1", &[])
            .await
            .map_err(|e| StoreError::Connection(format!("Failed to connect to database: {}", e)))?;
        drop(client);

        let db = Self { pool };
        db.init_schema().await?;
        Ok(db)
    }

    /// The connection pool, shared with the per-job object store.
    pub fn pool(&self) -> Pool {
        self.pool.clone()
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        client
            .batch_execute(
                r#"
                CREATE TABLE IF NOT EXISTS jobs (
                    id UUID PRIMARY KEY,
                    action TEXT NOT NULL,
                    state TEXT NOT NULL,
                    from_shark TEXT NOT NULL,
                    from_shark_datacenter TEXT NOT NULL,
                    max_objects INTEGER,
                    failure_reason TEXT,
                    retry_of UUID,
                    created_at TIMESTAMPTZ NOT NULL,
                    updated_at TIMESTAMPTZ NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state);
                CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs(created_at);

                CREATE TABLE IF NOT EXISTS job_results (
                    job_id UUID NOT NULL REFERENCES jobs(id),
                    status TEXT NOT NULL,
                    count BIGINT NOT NULL DEFAULT 0,
                    PRIMARY KEY (job_id, status)
                );
                "#,
            )
            .await?;
        tracing::debug!("Job schema initialized");
        Ok(())
    }
}

/// Build a deadpool config from a PostgreSQL URL.
pub fn create_pool(database_url: &str) -> Result<Pool, StoreError> {
    let pg_config: tokio_postgres::Config = database_url
        .parse()
        .map_err(|e| StoreError::Connection(format!("Invalid database URL: {}", e)))?;

    let mut cfg = Config::new();
    if let Some(hosts) = pg_config.get_hosts().first() {
        match hosts {
            tokio_postgres::config::Host::Tcp(host) => {
                cfg.host = Some(host.clone());
            }
            tokio_postgres::config::Host::Unix(path) => {
                cfg.host = Some(path.to_string_lossy().to_string());
            }
        }
    }
    if let Some(ports) = pg_config.get_ports().first() {
        cfg.port = Some(*ports);
    }
    if let Some(user) = pg_config.get_user() {
        cfg.user = Some(user.to_string());
    }
    if let Some(password) = pg_config.get_password() {
        cfg.password = Some(String::from_utf8_lossy(password).to_string());
    }
    if let Some(dbname) = pg_config.get_dbname() {
        cfg.dbname = Some(dbname.to_string());
    }

    cfg.create_pool(Some(Runtime::Tokio1), NoTls)
        .map_err(|e| StoreError::Connection(format!("Failed to create pool: {}", e)))
}

fn row_to_job(row: &tokio_postgres::Row) -> Result<JobRecord, StoreError> {
    let id: Uuid = row.get(0);
    let key = id.to_string();
    let action: String = row.get(1);
    let state: String = row.get(2);
    let max_objects: Option<i32> = row.get(5);

    Ok(JobRecord {
        id,
        action: parse_column("action", &key, &action)?,
        state: parse_column("state", &key, &state)?,
        from_shark: StorageNode {
            manta_storage_id: row.get(3),
            datacenter: row.get(4),
        },
        max_objects: max_objects
            .map(|n| fit_column("max_objects", &key, n))
            .transpose()?,
        failure_reason: row.get(6),
        retry_of: row.get(7),
        created_at: row.get(8),
        updated_at: row.get(9),
    })
}

#[async_trait]
impl JobStore for Database {
    async fn create_job(&self, job: &NewJob) -> Result<Uuid, StoreError> {
        let client = self.pool.get().await?;
        let id = Uuid::new_v4();
        let now = Utc::now();
        let max_objects: Option<i32> = job
            .max_objects
            .map(|n| fit_column("max_objects", &id.to_string(), n))
            .transpose()?;

        client
            .execute(
                "INSERT INTO jobs (id, action, state, from_shark, from_shark_datacenter, \
                 max_objects, retry_of, created_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
                &[
                    &id,
                    &JobAction::Evacuate.to_string(),
                    &JobState::Init.to_string(),
                    &job.from_shark.manta_storage_id,
                    &job.from_shark.datacenter,
                    &max_objects,
                    &job.retry_of,
                    &now,
                    &now,
                ],
            )
            .await?;

        Ok(id)
    }

    async fn get_job(&self, id: &Uuid) -> Result<JobRecord, StoreError> {
        let client = self.pool.get().await?;

        let row = client
            .query_opt(
                &format!("SELECT {} FROM jobs WHERE id = $1", JOB_COLUMNS),
                &[id],
            )
            .await?
            .ok_or(StoreError::NotFound(*id))?;

        row_to_job(&row)
    }

    async fn list_jobs(&self, state: Option<JobState>) -> Result<Vec<JobRecord>, StoreError> {
        let client = self.pool.get().await?;

        let rows = match state {
            Some(state) => {
                client
                    .query(
                        &format!(
                            "SELECT {} FROM jobs WHERE state = $1 ORDER BY created_at DESC",
                            JOB_COLUMNS
                        ),
                        &[&state.to_string()],
                    )
                    .await?
            }
            None => {
                client
                    .query(
                        &format!("SELECT {} FROM jobs ORDER BY created_at DESC", JOB_COLUMNS),
                        &[],
                    )
                    .await?
            }
        };

        rows.iter().map(row_to_job).collect()
    }

    async fn set_state(&self, id: &Uuid, state: JobState) -> Result<(), StoreError> {
        let client = self.pool.get().await?;

        let updated = client
            .execute(
                "UPDATE jobs SET state = $1, updated_at = $2
                 WHERE id = $3 AND state NOT IN ('complete', 'failed')",
                &[&state.to_string(), &Utc::now(), id],
            )
            .await?;

        if updated == 0 {
            // Distinguish a missing job from a finished one.
            let job = self.get_job(id).await?;
            tracing::warn!(job_id = %id, state = %job.state, requested = %state, "Job already finished");
            return Err(StoreError::Finished(*id));
        }

        Ok(())
    }

    async fn finish_job(
        &self,
        id: &Uuid,
        state: JobState,
        failure_reason: Option<&str>,
    ) -> Result<(), StoreError> {
        let client = self.pool.get().await?;

        let updated = client
            .execute(
                "UPDATE jobs SET state = $1, failure_reason = $2, updated_at = $3
                 WHERE id = $4 AND state NOT IN ('complete', 'failed')",
                &[&state.to_string(), &failure_reason, &Utc::now(), id],
            )
            .await?;

        if updated == 0 {
            self.get_job(id).await?;
            return Err(StoreError::Finished(*id));
        }

        Ok(())
    }

    async fn increment_result(&self, id: &Uuid, label: &str) -> Result<(), StoreError> {
        let client = self.pool.get().await?;

        client
            .execute(
                "INSERT INTO job_results (job_id, status, count) VALUES ($1, $2, 1)
                 ON CONFLICT (job_id, status) DO UPDATE SET count = job_results.count + 1",
                &[id, &label],
            )
            .await?;

        Ok(())
    }

    async fn get_results(&self, id: &Uuid) -> Result<HashMap<String, i64>, StoreError> {
        let client = self.pool.get().await?;

        let rows = client
            .query(
                "SELECT status, count FROM job_results WHERE job_id = $1",
                &[id],
            )
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let status: String = row.get(0);
                let count: i64 = row.get(1);
                (status, count)
            })
            .collect())
    }

    async fn fail_interrupted_jobs(&self, reason: &str) -> Result<Vec<Uuid>, StoreError> {
        let client = self.pool.get().await?;

        let rows = client
            .query(
                "UPDATE jobs SET state = 'failed', failure_reason = $1, updated_at = $2
                 WHERE state IN ('init', 'setup', 'running')
                 RETURNING id",
                &[&reason, &Utc::now()],
            )
            .await?;

        Ok(rows.into_iter().map(|row| row.get(0)).collect())
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// In-process job store with the same semantics as [`Database`].
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<Uuid, JobRecord>>,
    results: Mutex<HashMap<Uuid, HashMap<String, i64>>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a job record as-is.
    pub async fn insert_job(&self, job: JobRecord) {
        self.jobs.lock().await.insert(job.id, job);
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_job(&self, job: &NewJob) -> Result<Uuid, StoreError> {
        let now = Utc::now();
        let record = JobRecord {
            id: Uuid::new_v4(),
            action: JobAction::Evacuate,
            state: JobState::Init,
            from_shark: job.from_shark.clone(),
            max_objects: job.max_objects,
            failure_reason: None,
            retry_of: job.retry_of,
            created_at: now,
            updated_at: now,
        };
        let id = record.id;
        self.insert_job(record).await;
        Ok(id)
    }

    async fn get_job(&self, id: &Uuid) -> Result<JobRecord, StoreError> {
        self.jobs
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or(StoreError::NotFound(*id))
    }

    async fn list_jobs(&self, state: Option<JobState>) -> Result<Vec<JobRecord>, StoreError> {
        let jobs = self.jobs.lock().await;
        let mut entries: Vec<_> = jobs
            .values()
            .filter(|j| state.is_none_or(|s| j.state == s))
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(entries)
    }

    async fn set_state(&self, id: &Uuid, state: JobState) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(id).ok_or(StoreError::NotFound(*id))?;
        if job.state.is_terminal() {
            return Err(StoreError::Finished(*id));
        }
        job.state = state;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn finish_job(
        &self,
        id: &Uuid,
        state: JobState,
        failure_reason: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(id).ok_or(StoreError::NotFound(*id))?;
        if job.state.is_terminal() {
            return Err(StoreError::Finished(*id));
        }
        job.state = state;
        job.failure_reason = failure_reason.map(str::to_string);
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn increment_result(&self, id: &Uuid, label: &str) -> Result<(), StoreError> {
        let mut results = self.results.lock().await;
        *results
            .entry(*id)
            .or_default()
            .entry(label.to_string())
            .or_insert(0) += 1;
        Ok(())
    }

    async fn get_results(&self, id: &Uuid) -> Result<HashMap<String, i64>, StoreError> {
        Ok(self
            .results
            .lock()
            .await
            .get(id)
            .cloned()
            .unwrap_or_default())
    }

    async fn fail_interrupted_jobs(&self, reason: &str) -> Result<Vec<Uuid>, StoreError> {
        let mut jobs = self.jobs.lock().await;
        let mut failed = Vec::new();
        for job in jobs.values_mut().filter(|j| !j.state.is_terminal()) {
            job.state = JobState::Failed;
            job.failure_reason = Some(reason.to_string());
            job.updated_at = Utc::now();
            failed.push(job.id);
        }
        Ok(failed)
    }
}
