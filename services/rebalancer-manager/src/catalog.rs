// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2020 Joyent, Inc.
// Copyright 2026 Edgecast Cloud LLC.

//! Metadata catalog client
//!
//! Object records are read together with an etag and written back with
//! `If-Match`, so a concurrent writer shows up as an etag conflict rather
//! than a lost update.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use rebalancer_types::StorageNode;

use crate::metrics;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Object {id} not found on shard {shard}")]
    NotFound { shard: u32, id: String },

    #[error("Object {0} was modified concurrently")]
    EtagConflict(String),

    #[error("Catalog returned HTTP {0}")]
    Status(u16),

    #[error("Malformed object record: {0}")]
    Malformed(String),
}

/// An object record and the etag it was read at
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub value: Value,
    pub etag: String,
}

impl CatalogEntry {
    /// The record's current locations.
    pub fn sharks(&self) -> Result<Vec<StorageNode>, CatalogError> {
        let sharks = self
            .value
            .get("sharks")
            .ok_or_else(|| CatalogError::Malformed("missing sharks".to_string()))?;
        serde_json::from_value(sharks.clone()).map_err(|e| CatalogError::Malformed(e.to_string()))
    }
}

#[async_trait]
pub trait Catalog: Send + Sync {
    async fn get_object(&self, shard: u32, id: &str) -> Result<CatalogEntry, CatalogError>;

    /// Write `value` only if the record is still at `etag`.
    async fn put_object(
        &self,
        shard: u32,
        id: &str,
        value: &Value,
        etag: &str,
    ) -> Result<(), CatalogError>;
}

pub struct CatalogClient {
    client: Client,
    base_url: String,
}

impl CatalogClient {
    pub fn new(base_url: String, timeout_secs: u64) -> Result<Self, CatalogError> {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn object_url(&self, shard: u32, id: &str) -> String {
        format!("{}/shards/{}/objects/{}", self.base_url, shard, id)
    }
}

#[async_trait]
impl Catalog for CatalogClient {
    async fn get_object(&self, shard: u32, id: &str) -> Result<CatalogEntry, CatalogError> {
        let response = self.client.get(self.object_url(shard, id)).send().await?;

        match response.status() {
            StatusCode::NOT_FOUND => {
                return Err(CatalogError::NotFound {
                    shard,
                    id: id.to_string(),
                });
            }
            status if !status.is_success() => return Err(CatalogError::Status(status.as_u16())),
            _ => {}
        }

        let etag = response
            .headers()
            .get(http::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| CatalogError::Malformed("response has no ETag".to_string()))?;

        let value: Value = response.json().await?;
        Ok(CatalogEntry { value, etag })
    }

    async fn put_object(
        &self,
        shard: u32,
        id: &str,
        value: &Value,
        etag: &str,
    ) -> Result<(), CatalogError> {
        let response = self
            .client
            .put(self.object_url(shard, id))
            .header(http::header::IF_MATCH, etag)
            .json(value)
            .send()
            .await?;

        match response.status() {
            StatusCode::PRECONDITION_FAILED => Err(CatalogError::EtagConflict(id.to_string())),
            StatusCode::NOT_FOUND => Err(CatalogError::NotFound {
                shard,
                id: id.to_string(),
            }),
            status if !status.is_success() => Err(CatalogError::Status(status.as_u16())),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The record was rewritten after this many etag conflicts.
    Updated { conflicts: u32 },
    /// The record already pointed at the destination.
    AlreadyApplied,
}

/// Rewrite `sharks` for the move. Returns false if there was nothing left
/// to change.
fn rewrite_sharks(
    sharks: &mut Vec<Value>,
    from_shark: &StorageNode,
    dest_shark: &StorageNode,
    remove_source: bool,
) -> Result<bool, CatalogError> {
    let id_of = |v: &Value| {
        v.get("manta_storage_id")
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    let ids: Vec<Option<String>> = sharks.iter().map(id_of).collect();
    if ids.iter().any(Option::is_none) {
        return Err(CatalogError::Malformed(
            "shark entry without manta_storage_id".to_string(),
        ));
    }

    let has = |id: &str| ids.iter().flatten().any(|s| s == id);
    let dest_present = has(&dest_shark.manta_storage_id);
    let source_present = has(&from_shark.manta_storage_id);

    if dest_present && (!remove_source || !source_present) {
        return Ok(false);
    }

    let dest_entry = serde_json::json!({
        "manta_storage_id": dest_shark.manta_storage_id,
        "datacenter": dest_shark.datacenter,
    });

    if remove_source && source_present {
        let src = ids
            .iter()
            .position(|s| s.as_deref() == Some(from_shark.manta_storage_id.as_str()));
        if let Some(pos) = src {
            if dest_present {
                sharks.remove(pos);
            } else {
                sharks[pos] = dest_entry;
            }
        }
    } else {
        sharks.push(dest_entry);
    }

    Ok(true)
}

/// Point an object's record at `dest_shark`.
///
/// With `remove_source` the evacuated copy is replaced in place, otherwise
/// the destination is appended. Etag conflicts are retried with a fresh read
/// up to `max_retries` times.
pub async fn update_object_sharks(
    catalog: &dyn Catalog,
    shard: u32,
    id: &str,
    from_shark: &StorageNode,
    dest_shark: &StorageNode,
    remove_source: bool,
    max_retries: u32,
) -> Result<UpdateOutcome, CatalogError> {
    let mut conflicts = 0;

    loop {
        let mut entry = catalog.get_object(shard, id).await?;

        let sharks = entry
            .value
            .get_mut("sharks")
            .and_then(Value::as_array_mut)
            .ok_or_else(|| CatalogError::Malformed("missing or invalid sharks array".into()))?;

        if !rewrite_sharks(sharks, from_shark, dest_shark, remove_source)? {
            debug!(object = %id, dest_shark = %dest_shark.manta_storage_id, "Metadata already updated");
            return Ok(UpdateOutcome::AlreadyApplied);
        }

        match catalog.put_object(shard, id, &entry.value, &entry.etag).await {
            Ok(()) => {
                debug!(
                    object = %id,
                    shard,
                    from_shark = %from_shark.manta_storage_id,
                    dest_shark = %dest_shark.manta_storage_id,
                    "Updated object sharks"
                );
                return Ok(UpdateOutcome::Updated { conflicts });
            }
            Err(CatalogError::EtagConflict(_)) if conflicts < max_retries => {
                conflicts += 1;
                metrics::record_metadata_conflict();
                warn!(object = %id, attempt = conflicts, "Etag conflict, rereading record");
            }
            Err(e) => {
                if matches!(e, CatalogError::EtagConflict(_)) {
                    metrics::record_metadata_conflict();
                    info!(object = %id, conflicts, "Giving up after repeated etag conflicts");
                }
                return Err(e);
            }
        }
    }
}
