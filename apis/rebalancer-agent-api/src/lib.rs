// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2020 Joyent, Inc.
// Copyright 2026 Edgecast Cloud LLC.

//! Dropshot API trait for the rebalancer agent service.
//!
//! The agent runs on every storage node. The manager hands it assignments,
//! batches of objects to copy onto the node, and polls them until every task
//! has a terminal status.
//!
//! ## Endpoints
//!
//! - `POST /assignments` - Submit a new assignment
//! - `GET /assignments/{uuid}` - Get assignment status
//! - `DELETE /assignments/{uuid}` - Retire a completed assignment
//! - `GET /metrics` - Prometheus metrics

use dropshot::{Body, HttpError, HttpResponseDeleted, HttpResponseOk, Path, RequestContext};
use http::Response;
use rebalancer_types::{Assignment, AssignmentPayload};
use schemars::JsonSchema;
use serde::Deserialize;

/// Path parameters for assignment-specific endpoints.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct AssignmentPath {
    /// The assignment UUID
    pub uuid: String,
}

/// Rebalancer Agent API
#[dropshot::api_description]
pub trait RebalancerAgentApi {
    /// Context type for request handlers
    type Context: Send + Sync + 'static;

    /// Create a new assignment
    ///
    /// The assignment is persisted before this returns and is processed in
    /// the background. Returns 409 Conflict if an assignment with the same
    /// UUID already exists.
    #[endpoint {
        method = POST,
        path = "/assignments",
        tags = ["assignments"],
    }]
    async fn create_assignment(
        rqctx: RequestContext<Self::Context>,
        body: dropshot::TypedBody<AssignmentPayload>,
    ) -> Result<HttpResponseOk<String>, HttpError>;

    /// Get assignment status
    ///
    /// Once the state is `Complete` the failed tasks, with their reasons, are
    /// included. Returns 404 if the assignment is unknown and 400 if the UUID
    /// is malformed.
    #[endpoint {
        method = GET,
        path = "/assignments/{uuid}",
        tags = ["assignments"],
    }]
    async fn get_assignment(
        rqctx: RequestContext<Self::Context>,
        path: Path<AssignmentPath>,
    ) -> Result<HttpResponseOk<Assignment>, HttpError>;

    /// Retire a completed assignment
    ///
    /// Returns 403 if the assignment still has unfinished tasks.
    #[endpoint {
        method = DELETE,
        path = "/assignments/{uuid}",
        tags = ["assignments"],
    }]
    async fn delete_assignment(
        rqctx: RequestContext<Self::Context>,
        path: Path<AssignmentPath>,
    ) -> Result<HttpResponseDeleted, HttpError>;

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
