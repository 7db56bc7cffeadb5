// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Locator client
//!
//! The locator enumerates the objects stored on a node. Its answer is a
//! stream of newline-delimited JSON records that can be long, so records are
//! handed on one at a time as they arrive.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use rebalancer_types::StorageNode;

#[derive(Debug, Error)]
pub enum LocatorError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Locator returned HTTP {0}")]
    Status(u16),
}

/// One object as reported by the locator
///
/// Every field defaults so that an incomplete record still reaches
/// discovery, where it is counted as a bad record instead of ending the
/// listing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocatedObject {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub content_length: u64,
    #[serde(default)]
    pub content_md5: String,
    #[serde(default)]
    pub sharks: Vec<StorageNode>,
    #[serde(default)]
    pub shard: u32,
}

#[async_trait]
pub trait Locator: Send + Sync {
    /// Send every object stored on `storage_id` to `tx`.
    ///
    /// Returns early, without error, once the receiver is dropped.
    async fn stream_objects(
        &self,
        storage_id: &str,
        tx: mpsc::Sender<LocatedObject>,
    ) -> Result<(), LocatorError>;
}

pub struct LocatorClient {
    client: Client,
    base_url: String,
}

impl LocatorClient {
    pub fn new(base_url: String, timeout_secs: u64) -> Result<Self, LocatorError> {
        let _ = rustls::crypto::ring::default_provider().install_default();
        // The listing of a full node can take a long time; only connecting
        // is bounded.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

/// Split complete lines off the front of `buf`, parsing each one.
fn drain_lines(buf: &mut Vec<u8>, line_no: &mut usize) -> Vec<LocatedObject> {
    let mut objects = Vec::new();
    while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
        let line: Vec<u8> = buf.drain(..=pos).collect();
        *line_no += 1;
        objects.extend(parse_line(&line, *line_no));
    }
    objects
}

/// A line that is not an object record comes back as an empty record.
fn parse_line(line: &[u8], line_no: usize) -> Option<LocatedObject> {
    if line.iter().all(|b| b.is_ascii_whitespace()) {
        return None;
    }
    match serde_json::from_slice(line) {
        Ok(obj) => Some(obj),
        Err(e) => {
            tracing::warn!(
                line = line_no,
                raw = %String::from_utf8_lossy(line).trim_end(),
                error = %e,
                "Malformed locator record"
            );
            Some(LocatedObject::default())
        }
    }
}

#[async_trait]
impl Locator for LocatorClient {
    async fn stream_objects(
        &self,
        storage_id: &str,
        tx: mpsc::Sender<LocatedObject>,
    ) -> Result<(), LocatorError> {
        let url = format!("{}/sharks/{}/objects", self.base_url, storage_id);
        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            tracing::warn!(url = %url, status = %response.status(), "Locator request failed");
            return Err(LocatorError::Status(response.status().as_u16()));
        }

        let mut body = response.bytes_stream();
        let mut buf: Vec<u8> = Vec::new();
        let mut line_no = 0;
        let mut sent = 0u64;

        while let Some(chunk) = body.next().await {
            buf.extend_from_slice(&chunk?);
            for obj in drain_lines(&mut buf, &mut line_no) {
                if tx.send(obj).await.is_err() {
                    tracing::debug!(storage_id, sent, "Locator consumer went away");
                    return Ok(());
                }
                sent += 1;
            }
        }

        // Final record without a trailing newline
        line_no += 1;
        if let Some(obj) = parse_line(&buf, line_no) {
            if tx.send(obj).await.is_err() {
                return Ok(());
            }
            sent += 1;
        }

        tracing::info!(storage_id, sent, "Locator listing finished");
        Ok(())
    }
}
