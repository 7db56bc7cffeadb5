// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2020 Joyent, Inc.
// Copyright 2026 Edgecast Cloud LLC.

//! Storinfo client for discovering storage nodes
//!
//! Storinfo reports every storage node with its datacenter and how much
//! space it has left.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use rebalancer_types::StorageNode;

/// Storinfo client errors
#[derive(Debug, Error)]
pub enum StorinfoError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Storage node not found: {0}")]
    NotFound(String),

    #[error("Storinfo returned HTTP {0}")]
    Unavailable(u16),
}

/// Raw shark information from Storinfo API
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SharkInfo {
    pub manta_storage_id: String,
    pub datacenter: String,
    #[serde(rename = "availableMB")]
    pub available_mb: u64,
    #[serde(rename = "percentUsed")]
    pub percent_used: f64,
    pub timestamp: String,
}

/// A storage node and its reported capacity
#[derive(Debug, Clone, PartialEq)]
pub struct StorageNodeInfo {
    pub node: StorageNode,
    /// Available capacity in MB
    pub available_mb: u64,
    /// Percentage of storage used
    pub percent_used: f64,
}

impl StorageNodeInfo {
    pub fn new(id: &str, datacenter: &str, available_mb: u64, percent_used: f64) -> Self {
        Self {
            node: StorageNode::new(id, datacenter),
            available_mb,
            percent_used,
        }
    }
}

impl From<SharkInfo> for StorageNodeInfo {
    fn from(shark: SharkInfo) -> Self {
        StorageNodeInfo {
            node: StorageNode {
                manta_storage_id: shark.manta_storage_id,
                datacenter: shark.datacenter,
            },
            available_mb: shark.available_mb,
            percent_used: shark.percent_used,
        }
    }
}

/// Inventory of storage nodes
#[async_trait]
pub trait Storinfo: Send + Sync {
    /// Current capacity report for every node.
    async fn poll(&self) -> Result<Vec<StorageNodeInfo>, StorinfoError>;

    /// Look up one node.
    async fn get_node(&self, storage_id: &str) -> Result<StorageNode, StorinfoError> {
        self.poll()
            .await?
            .into_iter()
            .find(|info| info.node.manta_storage_id == storage_id)
            .map(|info| info.node)
            .ok_or_else(|| StorinfoError::NotFound(storage_id.to_string()))
    }
}

/// Storinfo client with caching
pub struct StorinfoClient {
    client: Client,
    base_url: String,
    cache: RwLock<HashMap<String, StorageNode>>,
}

impl StorinfoClient {
    /// Create a new Storinfo client
    pub fn new(base_url: String, timeout_secs: u64) -> Result<Self, StorinfoError> {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            cache: RwLock::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl Storinfo for StorinfoClient {
    async fn poll(&self) -> Result<Vec<StorageNodeInfo>, StorinfoError> {
        let url = format!("{}/poll", self.base_url);

        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            tracing::warn!(
                status = %response.status(),
                "Storinfo poll returned non-success status"
            );
            return Err(StorinfoError::Unavailable(response.status().as_u16()));
        }

        let sharks: Vec<SharkInfo> = response.json().await?;
        let nodes: Vec<StorageNodeInfo> = sharks.into_iter().map(StorageNodeInfo::from).collect();

        let mut cache = self.cache.write().await;
        cache.clear();
        for info in &nodes {
            cache.insert(info.node.manta_storage_id.clone(), info.node.clone());
        }

        tracing::debug!(count = nodes.len(), "Polled storinfo");
        Ok(nodes)
    }

    async fn get_node(&self, storage_id: &str) -> Result<StorageNode, StorinfoError> {
        if let Some(node) = self.cache.read().await.get(storage_id) {
            return Ok(node.clone());
        }

        self.poll().await?;

        self.cache
            .read()
            .await
            .get(storage_id)
            .cloned()
            .ok_or_else(|| StorinfoError::NotFound(storage_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn poll_body() -> serde_json::Value {
        serde_json::json!([
            {
                "manta_storage_id": "1.stor.domain.com",
                "datacenter": "dc1",
                "availableMB": 1000,
                "percentUsed": 12.5,
                "timestamp": "2026-01-01T00:00:00Z"
            },
            {
                "manta_storage_id": "2.stor.domain.com",
                "datacenter": "dc2",
                "availableMB": 50,
                "percentUsed": 95.0,
                "timestamp": "2026-01-01T00:00:00Z"
            }
        ])
    }

    #[tokio::test]
    async fn poll_parses_nodes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/poll"))
            .respond_with(ResponseTemplate::new(200).set_body_json(poll_body()))
            .mount(&server)
            .await;

        let client = StorinfoClient::new(server.uri(), 5).unwrap();
        let nodes = client.poll().await.unwrap();

        assert_eq!(nodes.len(), 2);
        assert_eq!(
            nodes[0],
            StorageNodeInfo::new("1.stor.domain.com", "dc1", 1000, 12.5)
        );
    }

    #[tokio::test]
    async fn get_node_uses_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/poll"))
            .respond_with(ResponseTemplate::new(200).set_body_json(poll_body()))
            .expect(1)
            .mount(&server)
            .await;

        let client = StorinfoClient::new(format!("{}/", server.uri()), 5).unwrap();
        let node = client.get_node("2.stor.domain.com").await.unwrap();
        assert_eq!(node.datacenter, "dc2");
        let node = client.get_node("1.stor.domain.com").await.unwrap();
        assert_eq!(node.datacenter, "dc1");
    }

    #[tokio::test]
    async fn unknown_node_and_failed_poll() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/poll"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = StorinfoClient::new(server.uri(), 5).unwrap();
        assert!(matches!(
            client.poll().await,
            Err(StorinfoError::Unavailable(503))
        ));
        assert!(client.get_node("1.stor.domain.com").await.is_err());
    }
}
