// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2020 Joyent, Inc.
// Copyright 2026 Edgecast Cloud LLC.

//! API context for the rebalancer manager

use std::collections::HashMap;
use std::sync::Arc;

use dropshot::{ClientErrorStatusCode, HttpError};
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use uuid::Uuid;

use rebalancer_types::{
    DuplicateObject, EvacuateJobUpdateMessage, JobDbEntry, JobListFilter, JobPayload, JobState,
    JobStatus, StorageNode,
};

use crate::config::ManagerConfig;
use crate::db::{JobStore, NewJob, StoreError};
use crate::jobs::Services;
use crate::jobs::evacuate::{EvacuateConfig, EvacuateJob, JobHandle, ObjectSource};
use crate::storinfo::StorinfoError;

/// Failure reason of jobs a previous manager process left unfinished
pub const INTERRUPTED_REASON: &str = "interrupted by manager restart";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Rebalancing is not safe right now: {0}")]
    Unsafe(String),

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("Storinfo error: {0}")]
    Storinfo(StorinfoError),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => ApiError::NotFound(format!("Job {}", id)),
            StoreError::Finished(id) => ApiError::Conflict(format!("Job {} already finished", id)),
            other => ApiError::Store(other),
        }
    }
}

impl From<StorinfoError> for ApiError {
    fn from(e: StorinfoError) -> Self {
        match e {
            StorinfoError::NotFound(id) => ApiError::NotFound(format!("Storage node {}", id)),
            other => ApiError::Storinfo(other),
        }
    }
}

impl From<ApiError> for HttpError {
    fn from(e: ApiError) -> Self {
        let msg = e.to_string();
        match e {
            ApiError::BadRequest(_) => HttpError::for_bad_request(None, msg),
            ApiError::NotFound(_) => HttpError::for_not_found(None, msg),
            ApiError::Conflict(_) | ApiError::Unsafe(_) => {
                HttpError::for_client_error(None, ClientErrorStatusCode::CONFLICT, msg)
            }
            ApiError::Store(_) | ApiError::Storinfo(_) => HttpError::for_internal_error(msg),
        }
    }
}

/// Mark jobs a previous process left unfinished as failed.
///
/// Nothing is running yet when this is called, so every non-terminal job
/// belongs to a process that is gone.
pub async fn recover_interrupted_jobs(jobs: &dyn JobStore) -> Result<Vec<Uuid>, StoreError> {
    let failed = jobs.fail_interrupted_jobs(INTERRUPTED_REASON).await?;
    for id in &failed {
        tracing::warn!(job_id = %id, "Job interrupted by manager restart, marked failed");
    }
    Ok(failed)
}

/// API context shared across all request handlers
pub struct ApiContext {
    services: Services,
    config: watch::Receiver<ManagerConfig>,
    running: Arc<Mutex<HashMap<Uuid, JobHandle>>>,
}

impl ApiContext {
    pub fn new(services: Services, config: watch::Receiver<ManagerConfig>) -> Self {
        Self {
            services,
            config,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Create a new job and start it in the background
    pub async fn create_job(&self, payload: JobPayload) -> Result<Uuid, ApiError> {
        let JobPayload::Evacuate(params) = payload;

        let unsafe_to_run = self.config.borrow().snaplink_cleanup_required;
        if unsafe_to_run {
            return Err(ApiError::Unsafe(
                "snaplink cleanup is required before evacuating".to_string(),
            ));
        }
        if params.from_shark.trim().is_empty() {
            return Err(ApiError::BadRequest("from_shark is required".to_string()));
        }
        if params.max_objects == Some(0) {
            return Err(ApiError::BadRequest(
                "max_objects must be greater than zero".to_string(),
            ));
        }

        let from_shark = self.services.storinfo.get_node(&params.from_shark).await?;

        let job_id = self
            .services
            .jobs
            .create_job(&NewJob {
                from_shark: from_shark.clone(),
                max_objects: params.max_objects,
                retry_of: None,
            })
            .await?;

        tracing::info!(
            job_id = %job_id,
            from_shark = %from_shark.manta_storage_id,
            max_objects = ?params.max_objects,
            "Created evacuate job"
        );

        self.start_job(job_id, from_shark, ObjectSource::Locator, params.max_objects)
            .await;
        Ok(job_id)
    }

    pub async fn list_jobs(&self, filter: JobListFilter) -> Result<Vec<JobDbEntry>, ApiError> {
        let jobs = self.services.jobs.list_jobs(filter.state).await?;
        Ok(jobs.into_iter().map(|j| j.into_db_entry()).collect())
    }

    pub async fn get_job(&self, id: &Uuid) -> Result<JobStatus, ApiError> {
        let record = self.services.jobs.get_job(id).await?;
        let results = self.services.jobs.get_results(id).await?;
        Ok(record.into_status(results))
    }

    /// Pass a tunable change to a running job
    pub async fn update_job(&self, id: &Uuid, msg: EvacuateJobUpdateMessage) -> Result<(), ApiError> {
        let record = self.services.jobs.get_job(id).await?;
        msg.validate().map_err(ApiError::BadRequest)?;

        if record.state != JobState::Running {
            return Err(ApiError::Conflict(format!(
                "Job {} is {}, not running",
                id, record.state
            )));
        }

        let running = self.running.lock().await;
        let accepted = running.get(id).is_some_and(|handle| handle.update(msg.clone()));
        if !accepted {
            return Err(ApiError::Conflict(format!(
                "Job {} is no longer taking updates",
                id
            )));
        }

        tracing::info!(job_id = %id, update = ?msg, "Job update applied");
        Ok(())
    }

    /// Start a new job over the objects a finished job did not complete
    pub async fn retry_job(&self, id: &Uuid) -> Result<Uuid, ApiError> {
        let record = self.services.jobs.get_job(id).await?;
        if !record.state.is_terminal() {
            return Err(ApiError::Conflict(format!(
                "Job {} is {}, only finished jobs can be retried",
                id, record.state
            )));
        }

        let new_id = self
            .services
            .jobs
            .create_job(&NewJob {
                from_shark: record.from_shark.clone(),
                max_objects: record.max_objects,
                retry_of: Some(*id),
            })
            .await?;

        tracing::info!(original_job_id = %id, new_job_id = %new_id, "Created retry job");

        self.start_job(
            new_id,
            record.from_shark,
            ObjectSource::PriorJob(*id),
            record.max_objects,
        )
        .await;
        Ok(new_id)
    }

    pub async fn stop_job(&self, id: &Uuid) -> Result<(), ApiError> {
        let record = self.services.jobs.get_job(id).await?;

        let running = self.running.lock().await;
        match running.get(id) {
            Some(handle) if !record.state.is_terminal() => {
                handle.stop();
                tracing::info!(job_id = %id, "Job stop requested");
                Ok(())
            }
            _ => Err(ApiError::Conflict(format!("Job {} is not running", id))),
        }
    }

    pub async fn list_duplicates(&self, id: &Uuid) -> Result<Vec<DuplicateObject>, ApiError> {
        // 404 for unknown jobs rather than an empty list
        self.services.jobs.get_job(id).await?;
        Ok(self.services.objects.duplicates(id).await?)
    }

    async fn start_job(
        &self,
        job_id: Uuid,
        from_shark: StorageNode,
        source: ObjectSource,
        max_objects: Option<u32>,
    ) {
        // Jobs take the configuration current at their start.
        let config = EvacuateConfig::from_manager(&self.config.borrow(), max_objects);
        let (job, handle) =
            EvacuateJob::new(job_id, from_shark, source, config, self.services.clone());

        self.running.lock().await.insert(job_id, handle);

        let running = Arc::clone(&self.running);
        tokio::spawn(async move {
            let state = job.run().await;
            running.lock().await.remove(&job_id);
            tracing::info!(job_id = %job_id, state = %state, "Job finished");
        });
    }
}
