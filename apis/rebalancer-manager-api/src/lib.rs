// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2020 Joyent, Inc.
// Copyright 2026 Edgecast Cloud LLC.

//! Dropshot API trait for the rebalancer manager service.
//!
//! ## Endpoints
//!
//! - `POST /jobs` - Create a new job
//! - `GET /jobs` - List jobs, optionally filtered by state
//! - `GET /jobs/{uuid}` - Get job status
//! - `PUT /jobs/{uuid}` - Update a running job's tunables
//! - `POST /jobs/{uuid}/retry` - Retry a finished job's unresolved objects
//! - `POST /jobs/{uuid}/stop` - Stop a running job
//! - `GET /jobs/{uuid}/duplicates` - Objects discovered more than once
//! - `GET /metrics` - Prometheus metrics

use dropshot::{
    Body, HttpError, HttpResponseOk, HttpResponseUpdatedNoContent, Path, Query, RequestContext,
};
use http::Response;
use rebalancer_types::{
    DuplicateObject, EvacuateJobUpdateMessage, JobDbEntry, JobListFilter, JobPayload, JobStatus,
};
use schemars::JsonSchema;
use serde::Deserialize;

/// Path parameters for job-specific endpoints.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct JobPath {
    /// The job UUID
    pub uuid: String,
}

/// Rebalancer Manager API
#[dropshot::api_description]
pub trait RebalancerManagerApi {
    /// Context type for request handlers
    type Context: Send + Sync + 'static;

    /// Create a new job
    ///
    /// The job runs asynchronously; poll the returned UUID for progress.
    /// Returns 409 while the cluster is flagged unsafe for rebalancing and
    /// 404 if the source storage node is unknown.
    #[endpoint {
        method = POST,
        path = "/jobs",
        tags = ["jobs"],
    }]
    async fn create_job(
        rqctx: RequestContext<Self::Context>,
        body: dropshot::TypedBody<JobPayload>,
    ) -> Result<HttpResponseOk<String>, HttpError>;

    /// List jobs, newest first
    #[endpoint {
        method = GET,
        path = "/jobs",
        tags = ["jobs"],
    }]
    async fn list_jobs(
        rqctx: RequestContext<Self::Context>,
        query: Query<JobListFilter>,
    ) -> Result<HttpResponseOk<Vec<JobDbEntry>>, HttpError>;

    /// Get job status
    ///
    /// Returns the job's configuration, state, failure reason (if any) and
    /// result counts by label.
    #[endpoint {
        method = GET,
        path = "/jobs/{uuid}",
        tags = ["jobs"],
    }]
    async fn get_job(
        rqctx: RequestContext<Self::Context>,
        path: Path<JobPath>,
    ) -> Result<HttpResponseOk<JobStatus>, HttpError>;

    /// Update a running job
    ///
    /// Returns 400 for an out of range value and 409 if the job is not
    /// running.
    #[endpoint {
        method = PUT,
        path = "/jobs/{uuid}",
        tags = ["jobs"],
    }]
    async fn update_job(
        rqctx: RequestContext<Self::Context>,
        path: Path<JobPath>,
        body: dropshot::TypedBody<EvacuateJobUpdateMessage>,
    ) -> Result<HttpResponseUpdatedNoContent, HttpError>;

    /// Retry a finished job
    ///
    /// Creates a new job seeded from every object the original job did not
    /// complete. The locator is not consulted. Returns the new job's UUID,
    /// or 409 if the original job has not finished.
    #[endpoint {
        method = POST,
        path = "/jobs/{uuid}/retry",
        tags = ["jobs"],
    }]
    async fn retry_job(
        rqctx: RequestContext<Self::Context>,
        path: Path<JobPath>,
    ) -> Result<HttpResponseOk<String>, HttpError>;

    /// Stop a running job
    ///
    /// The job drains its in-flight work and ends in the failed state.
    #[endpoint {
        method = POST,
        path = "/jobs/{uuid}/stop",
        tags = ["jobs"],
    }]
    async fn stop_job(
        rqctx: RequestContext<Self::Context>,
        path: Path<JobPath>,
    ) -> Result<HttpResponseUpdatedNoContent, HttpError>;

    /// Objects the job discovered more than once
    #[endpoint {
        method = GET,
        path = "/jobs/{uuid}/duplicates",
        tags = ["jobs"],
    }]
    async fn list_duplicates(
        rqctx: RequestContext<Self::Context>,
        path: Path<JobPath>,
    ) -> Result<HttpResponseOk<Vec<DuplicateObject>>, HttpError>;

    /// Prometheus metrics in text exposition format
    #[endpoint {
        method = GET,
        path = "/metrics",
        tags = ["metrics"],
    }]
    async fn get_metrics(
        rqctx: RequestContext<Self::Context>,
    ) -> Result<Response<Body>, HttpError>;
}
