// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2020 Joyent, Inc.
// Copyright 2026 Edgecast Cloud LLC.

//! Rebalancer Manager Library
//!
//! The manager runs evacuate jobs: it discovers every object on a storage
//! node being drained, batches them into assignments for the agents on
//! destination nodes, and points each copied object's catalog record at its
//! new home.
//!
//! # Modules
//!
//! - [`catalog`] - Object metadata reads and conditional writes
//! - [`config`] - Manager configuration and SIGUSR1 reloading
//! - [`context`] - API context, job lifecycle, startup recovery
//! - [`db`] - Job records and result counters
//! - [`jobs`] - The evacuate pipeline
//! - [`locator`] - Streams the objects stored on a node
//! - [`metrics`] - Prometheus counters
//! - [`storinfo`] - Storage node inventory and capacity

pub mod catalog;
pub mod config;
pub mod context;
pub mod db;
pub mod jobs;
pub mod locator;
pub mod metrics;
pub mod storinfo;

use dropshot::{
    Body, HttpError, HttpResponseOk, HttpResponseUpdatedNoContent, Path, Query, RequestContext,
};
use http::Response;
use rebalancer_manager_api::{JobPath, RebalancerManagerApi};
use rebalancer_types::{
    DuplicateObject, EvacuateJobUpdateMessage, JobDbEntry, JobListFilter, JobPayload, JobStatus,
};
use uuid::Uuid;

use crate::context::ApiContext;

fn parse_uuid(uuid: &str) -> Result<Uuid, HttpError> {
    Uuid::parse_str(uuid)
        .map_err(|_| HttpError::for_bad_request(None, format!("Invalid UUID format: {}", uuid)))
}

/// Rebalancer Manager API implementation
pub enum RebalancerManagerImpl {}

impl RebalancerManagerApi for RebalancerManagerImpl {
    type Context = ApiContext;

    async fn create_job(
        rqctx: RequestContext<Self::Context>,
        body: dropshot::TypedBody<JobPayload>,
    ) -> Result<HttpResponseOk<String>, HttpError> {
        let ctx = rqctx.context();
        let payload = body.into_inner();

        tracing::info!(payload = ?payload, "Received job creation request");

        let job_id = ctx.create_job(payload).await?;
        Ok(HttpResponseOk(job_id.to_string()))
    }

    async fn list_jobs(
        rqctx: RequestContext<Self::Context>,
        query: Query<JobListFilter>,
    ) -> Result<HttpResponseOk<Vec<JobDbEntry>>, HttpError> {
        let ctx = rqctx.context();
        let jobs = ctx.list_jobs(query.into_inner()).await?;
        Ok(HttpResponseOk(jobs))
    }

    async fn get_job(
        rqctx: RequestContext<Self::Context>,
        path: Path<JobPath>,
    ) -> Result<HttpResponseOk<JobStatus>, HttpError> {
        let ctx = rqctx.context();
        let id = parse_uuid(&path.into_inner().uuid)?;
        let status = ctx.get_job(&id).await?;
        Ok(HttpResponseOk(status))
    }

    async fn update_job(
        rqctx: RequestContext<Self::Context>,
        path: Path<JobPath>,
        body: dropshot::TypedBody<EvacuateJobUpdateMessage>,
    ) -> Result<HttpResponseUpdatedNoContent, HttpError> {
        let ctx = rqctx.context();
        let id = parse_uuid(&path.into_inner().uuid)?;
        ctx.update_job(&id, body.into_inner()).await?;
        Ok(HttpResponseUpdatedNoContent())
    }

    async fn retry_job(
        rqctx: RequestContext<Self::Context>,
        path: Path<JobPath>,
    ) -> Result<HttpResponseOk<String>, HttpError> {
        let ctx = rqctx.context();
        let id = parse_uuid(&path.into_inner().uuid)?;
        let new_job_id = ctx.retry_job(&id).await?;

        tracing::info!(
            original_job_id = %id,
            new_job_id = %new_job_id,
            "Job retry initiated"
        );

        Ok(HttpResponseOk(new_job_id.to_string()))
    }

    async fn stop_job(
        rqctx: RequestContext<Self::Context>,
        path: Path<JobPath>,
    ) -> Result<HttpResponseUpdatedNoContent, HttpError> {
        let ctx = rqctx.context();
        let id = parse_uuid(&path.into_inner().uuid)?;
        ctx.stop_job(&id).await?;
        Ok(HttpResponseUpdatedNoContent())
    }

    async fn list_duplicates(
        rqctx: RequestContext<Self::Context>,
        path: Path<JobPath>,
    ) -> Result<HttpResponseOk<Vec<DuplicateObject>>, HttpError> {
        let ctx = rqctx.context();
        let id = parse_uuid(&path.into_inner().uuid)?;
        let duplicates = ctx.list_duplicates(&id).await?;
        Ok(HttpResponseOk(duplicates))
    }

    async fn get_metrics(
        _rqctx: RequestContext<Self::Context>,
    ) -> Result<Response<Body>, HttpError> {
        Response::builder()
            .status(200)
            .header("Content-Type", "text/plain; version=0.0.4")
            .body(metrics::gather_metrics().into())
            .map_err(|e| HttpError::for_internal_error(format!("Failed to build response: {}", e)))
    }
}
