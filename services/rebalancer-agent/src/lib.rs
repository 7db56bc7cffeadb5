// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2020 Joyent, Inc.
// Copyright 2026 Edgecast Cloud LLC.

//! Rebalancer Agent Library
//!
//! The agent runs on each storage node and copies objects onto it on behalf
//! of the rebalancer manager.
//!
//! # Modules
//!
//! - [`config`] - Agent configuration (directories, concurrency, retries)
//! - [`context`] - API context, startup recovery
//! - [`metrics`] - Prometheus counters
//! - [`processor`] - Download, verify and place objects
//! - [`storage`] - SQLite-based assignment persistence
//! - [`transfer`] - Source of object bytes

pub mod config;
pub mod context;
pub mod metrics;
pub mod processor;
pub mod storage;
pub mod transfer;

use dropshot::{
    Body, ClientErrorStatusCode, HttpError, HttpResponseDeleted, HttpResponseOk, Path,
    RequestContext,
};
use http::Response;
use rebalancer_agent_api::{AssignmentPath, RebalancerAgentApi};
use rebalancer_types::{Assignment, AssignmentPayload};

use crate::config::is_path_component;
use crate::context::ApiContext;
use crate::storage::StorageError;

fn parse_uuid(uuid: &str) -> Result<(), HttpError> {
    uuid::Uuid::parse_str(uuid)
        .map(|_| ())
        .map_err(|_| HttpError::for_bad_request(None, format!("Invalid UUID format: {}", uuid)))
}

fn storage_error(uuid: &str, e: StorageError) -> HttpError {
    match e {
        StorageError::NotFound(_) => {
            HttpError::for_not_found(None, format!("Assignment {} not found", uuid))
        }
        StorageError::AlreadyExists(_) => HttpError::for_client_error(
            None,
            ClientErrorStatusCode::CONFLICT,
            format!("Assignment {} already exists", uuid),
        ),
        StorageError::NotComplete(_) => HttpError::for_client_error(
            None,
            ClientErrorStatusCode::FORBIDDEN,
            format!("Assignment {} is not complete and cannot be deleted", uuid),
        ),
        other => HttpError::for_internal_error(format!("Assignment {}: {}", uuid, other)),
    }
}

/// Rebalancer Agent API implementation
pub enum RebalancerAgentImpl {}

impl RebalancerAgentApi for RebalancerAgentImpl {
    type Context = ApiContext;

    async fn create_assignment(
        rqctx: RequestContext<Self::Context>,
        body: dropshot::TypedBody<AssignmentPayload>,
    ) -> Result<HttpResponseOk<String>, HttpError> {
        let ctx = rqctx.context();
        let payload = body.into_inner();
        let uuid = payload.id.clone();
        parse_uuid(&uuid)?;

        // Owner and object id become directories below the manta root.
        if let Some(task) = payload
            .tasks
            .iter()
            .find(|t| !is_path_component(&t.owner) || !is_path_component(&t.object_id))
        {
            tracing::warn!(
                assignment_id = %uuid,
                owner = %task.owner,
                object_id = %task.object_id,
                "Rejecting assignment with unsafe object path"
            );
            return Err(HttpError::for_bad_request(
                None,
                format!(
                    "Invalid owner or object id in task: {}/{}",
                    task.owner, task.object_id
                ),
            ));
        }

        tracing::info!(
            assignment_id = %uuid,
            task_count = payload.tasks.len(),
            "Received new assignment"
        );

        ctx.create_assignment(payload).await.map_err(|e| {
            if matches!(e, StorageError::AlreadyExists(_)) {
                tracing::warn!(assignment_id = %uuid, "Assignment already exists");
            }
            storage_error(&uuid, e)
        })?;

        Ok(HttpResponseOk(uuid))
    }

    async fn get_assignment(
        rqctx: RequestContext<Self::Context>,
        path: Path<AssignmentPath>,
    ) -> Result<HttpResponseOk<Assignment>, HttpError> {
        let ctx = rqctx.context();
        let uuid = path.into_inner().uuid;
        parse_uuid(&uuid)?;

        let assignment = ctx
            .get_assignment(&uuid)
            .await
            .map_err(|e| storage_error(&uuid, e))?;

        Ok(HttpResponseOk(assignment))
    }

    async fn delete_assignment(
        rqctx: RequestContext<Self::Context>,
        path: Path<AssignmentPath>,
    ) -> Result<HttpResponseDeleted, HttpError> {
        let ctx = rqctx.context();
        let uuid = path.into_inner().uuid;
        parse_uuid(&uuid)?;

        ctx.delete_assignment(&uuid)
            .await
            .map_err(|e| storage_error(&uuid, e))?;

        tracing::info!(assignment_id = %uuid, "Deleted assignment");
        Ok(HttpResponseDeleted())
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
