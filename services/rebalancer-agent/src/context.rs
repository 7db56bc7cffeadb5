// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2020 Joyent, Inc.
// Copyright 2026 Edgecast Cloud LLC.

//! API context for the rebalancer agent

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};

use rebalancer_types::{Assignment, AssignmentPayload};

use crate::config::{AgentConfig, TMP_SUFFIX};
use crate::metrics;
use crate::processor::TaskProcessor;
use crate::storage::{AssignmentStorage, StorageError};
use crate::transfer::{HttpTransfer, ObjectTransfer};

/// API context shared across all request handlers
pub struct ApiContext {
    storage: Arc<AssignmentStorage>,
    processor: TaskProcessor,
    resume_failed: AtomicBool,
}

impl ApiContext {
    /// Open the agent's state and resume whatever a previous run left
    /// unfinished.
    pub async fn new(config: AgentConfig) -> Result<Self> {
        let transfer = HttpTransfer::new(config.download_timeout())
            .context("Failed to build HTTP client")?;
        Self::with_transfer(config, Arc::new(transfer)).await
    }

    pub async fn with_transfer(
        config: AgentConfig,
        transfer: Arc<dyn ObjectTransfer>,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .with_context(|| format!("Failed to create {}", config.data_dir.display()))?;
        tokio::fs::create_dir_all(&config.manta_root)
            .await
            .with_context(|| format!("Failed to create {}", config.manta_root.display()))?;

        let removed = purge_temp_files(&config.manta_root).await;
        if removed > 0 {
            tracing::info!(removed, "Removed stale temp files");
        }

        let storage = Arc::new(
            AssignmentStorage::new(&config.db_path()).context("Failed to open assignment database")?,
        );
        let processor = TaskProcessor::with_transfer(config, Arc::clone(&storage), transfer);

        let ctx = Self {
            storage,
            processor,
            resume_failed: AtomicBool::new(false),
        };
        ctx.resume_incomplete().await;
        Ok(ctx)
    }

    /// True if assignments from a previous run could not be enumerated.
    pub fn resume_failed(&self) -> bool {
        self.resume_failed.load(Ordering::SeqCst)
    }

    async fn resume_incomplete(&self) {
        let uuids = match self.storage.incomplete_assignments().await {
            Ok(uuids) => uuids,
            Err(e) => {
                tracing::error!(error = %e, "Failed to enumerate interrupted assignments");
                self.resume_failed.store(true, Ordering::SeqCst);
                return;
            }
        };

        for uuid in uuids {
            tracing::info!(assignment_id = %uuid, "Resuming interrupted assignment");
            self.spawn_processing(uuid);
        }
    }

    fn spawn_processing(&self, uuid: String) {
        let processor = self.processor.clone();
        tokio::spawn(async move {
            processor.process_assignment(&uuid).await;
        });
    }

    /// Persist a new assignment and start processing it.
    pub async fn create_assignment(&self, payload: AssignmentPayload) -> Result<(), StorageError> {
        let (uuid, tasks) = payload.into();
        self.storage.create(&uuid, &tasks).await?;
        self.spawn_processing(uuid);
        Ok(())
    }

    pub async fn get_assignment(&self, uuid: &str) -> Result<Assignment, StorageError> {
        self.storage.get(uuid).await
    }

    pub async fn delete_assignment(&self, uuid: &str) -> Result<(), StorageError> {
        self.storage.delete(uuid).await
    }
}

/// Delete every `*.tmp` file below `root`. Returns how many were removed.
pub async fn purge_temp_files(root: &Path) -> usize {
    let mut removed = 0;
    let mut pending: Vec<PathBuf> = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(path = %dir.display(), error = %e, "Cannot scan for temp files");
                continue;
            }
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(path = %dir.display(), error = %e, "Temp file scan interrupted");
                    break;
                }
            };

            let path = entry.path();
            let file_type = match entry.file_type().await {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Cannot stat entry");
                    continue;
                }
            };

            if file_type.is_dir() {
                pending.push(path);
            } else if path.to_string_lossy().ends_with(TMP_SUFFIX) {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => removed += 1,
                    Err(e) => {
                        metrics::record_cleanup_failure();
                        tracing::warn!(path = %path.display(), error = %e, "Failed to remove temp file");
                    }
                }
            }
        }
    }

    removed
}
