// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Fetching object bytes from a source storage node.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use reqwest::Client;
use thiserror::Error;

use rebalancer_types::{ObjectSkippedReason, Task};

pub type ByteStream = BoxStream<'static, Result<Bytes, TransferError>>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("source returned HTTP {0}")]
    Status(u16),
    #[error("network error: {0}")]
    Network(String),
    #[error("source error: {0}")]
    Source(String),
}

impl TransferError {
    pub fn reason(&self) -> ObjectSkippedReason {
        match self {
            TransferError::Status(code) => ObjectSkippedReason::HTTPStatusCode(*code),
            TransferError::Network(_) => ObjectSkippedReason::NetworkError,
            TransferError::Source(_) => ObjectSkippedReason::SourceOtherError,
        }
    }
}

/// Where task bytes come from.
#[async_trait]
pub trait ObjectTransfer: Send + Sync {
    /// Open a stream of the object's bytes on its source node.
    async fn fetch(&self, task: &Task) -> Result<ByteStream, TransferError>;
}

/// Downloads from the storage node's web server at
/// `http://{storage_id}/{owner}/{object_id}`.
pub struct HttpTransfer {
    client: Client,
}

impl HttpTransfer {
    pub fn new(timeout: std::time::Duration) -> Result<Self, reqwest::Error> {
        // The workspace builds reqwest without a bundled rustls provider.
        let _ = rustls::crypto::ring::default_provider().install_default();
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ObjectTransfer for HttpTransfer {
    async fn fetch(&self, task: &Task) -> Result<ByteStream, TransferError> {
        let url = format!(
            "http://{}/{}/{}",
            task.source.manta_storage_id, task.owner, task.object_id
        );

        let response = self.client.get(&url).send().await.map_err(|e| {
            tracing::debug!(url = %url, error = %e, "HTTP request failed");
            TransferError::Network(e.to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            tracing::debug!(url = %url, status = %status, "HTTP error response");
            return Err(TransferError::Status(status.as_u16()));
        }

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| TransferError::Network(e.to_string())))
            .boxed())
    }
}
