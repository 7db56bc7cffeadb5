// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2020 Joyent, Inc.
// Copyright 2026 Edgecast Cloud LLC.

//! Agent communication for evacuate jobs
//!
//! Each destination runs a rebalancer agent; assignments are posted to it,
//! polled until complete, and then deleted.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use thiserror::Error;

use rebalancer_types::{Assignment, AssignmentPayload, StorageNode};

#[derive(Debug, Error)]
pub enum AgentClientError {
    /// The agent does not know the assignment
    #[error("Assignment not found on agent")]
    NotFound,

    /// The agent answered with a non-success status
    #[error("Agent returned HTTP {0}")]
    Rejected(u16),

    /// The request never got an answer
    #[error("Agent unreachable: {0}")]
    Unreachable(String),
}

impl From<reqwest::Error> for AgentClientError {
    fn from(e: reqwest::Error) -> Self {
        AgentClientError::Unreachable(e.to_string())
    }
}

#[async_trait]
pub trait AgentClient: Send + Sync {
    async fn post_assignment(
        &self,
        node: &StorageNode,
        payload: &AssignmentPayload,
    ) -> Result<(), AgentClientError>;

    async fn get_assignment(
        &self,
        node: &StorageNode,
        id: &str,
    ) -> Result<Assignment, AgentClientError>;

    async fn delete_assignment(&self, node: &StorageNode, id: &str)
    -> Result<(), AgentClientError>;
}

pub struct HttpAgentClient {
    client: Client,
    port: u16,
}

impl HttpAgentClient {
    pub fn new(port: u16, timeout_secs: u64) -> Result<Self, AgentClientError> {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self { client, port })
    }

    fn assignments_url(&self, node: &StorageNode) -> String {
        format!("http://{}:{}/assignments", node.manta_storage_id, self.port)
    }

    fn check_status(status: StatusCode) -> Result<(), AgentClientError> {
        if status == StatusCode::NOT_FOUND {
            Err(AgentClientError::NotFound)
        } else if !status.is_success() {
            Err(AgentClientError::Rejected(status.as_u16()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    async fn post_assignment(
        &self,
        node: &StorageNode,
        payload: &AssignmentPayload,
    ) -> Result<(), AgentClientError> {
        let response = self
            .client
            .post(self.assignments_url(node))
            .json(payload)
            .send()
            .await?;

        // A 404 on POST is still a rejection of the assignment.
        let status = response.status();
        if !status.is_success() {
            return Err(AgentClientError::Rejected(status.as_u16()));
        }
        Ok(())
    }

    async fn get_assignment(
        &self,
        node: &StorageNode,
        id: &str,
    ) -> Result<Assignment, AgentClientError> {
        let url = format!("{}/{}", self.assignments_url(node), id);
        let response = self.client.get(&url).send().await?;
        Self::check_status(response.status())?;
        Ok(response.json().await?)
    }

    async fn delete_assignment(
        &self,
        node: &StorageNode,
        id: &str,
    ) -> Result<(), AgentClientError> {
        let url = format!("{}/{}", self.assignments_url(node), id);
        let response = self.client.delete(&url).send().await?;
        Self::check_status(response.status())
    }
}
