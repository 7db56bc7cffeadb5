// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2020 Joyent, Inc.
// Copyright 2026 Edgecast Cloud LLC.

//! Metadata update broker
//!
//! Objects the agents have copied arrive here and get their catalog record
//! pointed at the new location. Concurrency is bounded by a semaphore that
//! `SetMetadataThreads` resizes while the job runs.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use rebalancer_types::{EvacuateJobUpdateMessage, MAX_TUNABLE_MD_UPDATE_THREADS};

use super::types::{EvacuateObject, EvacuateObjectError};
use super::{StageContext, stopped};
use crate::catalog::{self, CatalogError};
use crate::jobs::JobError;
use crate::metrics;

/// Resizable bound on concurrent catalog updates
pub(super) struct MetadataPool {
    semaphore: Arc<Semaphore>,
    size: usize,
}

impl MetadataPool {
    pub(super) fn new(size: usize) -> Self {
        let size = size.clamp(1, MAX_TUNABLE_MD_UPDATE_THREADS as usize);
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub(super) fn size(&self) -> usize {
        self.size
    }

    pub(super) fn semaphore(&self) -> Arc<Semaphore> {
        Arc::clone(&self.semaphore)
    }

    /// Grow or shrink the pool. Shrinking takes effect as running updates
    /// give their permits back; nothing in flight is interrupted.
    pub(super) fn resize(&mut self, size: usize) {
        let size = size.clamp(1, MAX_TUNABLE_MD_UPDATE_THREADS as usize);
        if size > self.size {
            self.semaphore.add_permits(size - self.size);
        } else if size < self.size {
            let surplus = (self.size - size) as u32;
            let semaphore = self.semaphore();
            tokio::spawn(async move {
                // Fails only once the pool is closed.
                if let Ok(permits) = semaphore.acquire_many_owned(surplus).await {
                    permits.forget();
                }
            });
        }
        self.size = size;
    }

    /// Release anything still waiting on the pool.
    pub(super) fn close(&self) {
        self.semaphore.close();
    }
}

pub(super) async fn metadata_broker(
    ctx: StageContext,
    mut md_rx: mpsc::Receiver<EvacuateObject>,
    mut update_rx: watch::Receiver<Option<EvacuateJobUpdateMessage>>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), JobError> {
    let mut pool = MetadataPool::new(ctx.config.metadata_threads);
    let mut tasks: JoinSet<()> = JoinSet::new();
    let mut panics = 0u64;
    let mut updates_open = true;
    let mut stopping = false;
    // Nothing is read off `md_rx` until a permit is in hand, so a busy pool
    // leaves objects queued and the checker waits on the channel.
    let mut permit: Option<OwnedSemaphorePermit> = None;

    info!(job_id = %ctx.job_id, threads = pool.size(), "Metadata update broker started");

    loop {
        tokio::select! {
            _ = stopped(&mut shutdown) => {
                stopping = true;
                break;
            }

            changed = update_rx.changed(), if updates_open => {
                if changed.is_err() {
                    debug!(job_id = %ctx.job_id, "Update channel closed");
                    updates_open = false;
                    continue;
                }
                let msg = update_rx.borrow_and_update().clone();
                if let Some(EvacuateJobUpdateMessage::SetMetadataThreads(threads)) = msg {
                    info!(
                        job_id = %ctx.job_id,
                        old_threads = pool.size(),
                        new_threads = threads,
                        "Adjusting metadata threads"
                    );
                    pool.resize(threads as usize);
                }
            }

            Some(result) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = result {
                    if e.is_panic() {
                        panics += 1;
                        metrics::record_task_panic("metadata");
                        error!(job_id = %ctx.job_id, error = %e, "Metadata update task panicked");
                    }
                }
            }

            acquired = pool.semaphore().acquire_owned(), if permit.is_none() => {
                match acquired {
                    Ok(p) => permit = Some(p),
                    Err(_) => {
                        warn!(job_id = %ctx.job_id, "Metadata pool closed");
                        break;
                    }
                }
            }

            obj = md_rx.recv(), if permit.is_some() => {
                let Some(obj) = obj else {
                    break;
                };
                let Some(held) = permit.take() else {
                    continue;
                };
                let ctx = ctx.clone();
                tasks.spawn(async move {
                    let _permit = held;
                    update_metadata(ctx, obj).await;
                });
            }
        }
    }

    if stopping {
        // Unfinished objects stay post_processing and are picked up by a
        // retry job.
        tasks.abort_all();
    } else {
        info!(
            job_id = %ctx.job_id,
            pending_tasks = tasks.len(),
            "Waiting for remaining metadata update tasks to complete"
        );
    }

    drop(permit);
    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            if e.is_panic() {
                panics += 1;
                metrics::record_task_panic("metadata");
                error!(job_id = %ctx.job_id, error = %e, "Metadata update task panicked");
            }
        }
    }
    pool.close();

    if panics > 0 {
        return Err(JobError::MetadataPanics(panics));
    }

    info!(job_id = %ctx.job_id, "Metadata update broker completed");
    Ok(())
}

async fn update_metadata(ctx: StageContext, mut obj: EvacuateObject) {
    let Some(dest) = obj.dest_shark.clone() else {
        error!(object = %obj.id, "Copied object has no destination recorded");
        ctx.progress
            .fail(&mut obj, EvacuateObjectError::InternalError)
            .await;
        return;
    };

    let result = catalog::update_object_sharks(
        ctx.services.catalog.as_ref(),
        obj.shard,
        &obj.id,
        &ctx.from_shark,
        &dest,
        ctx.config.remove_source_location,
        ctx.config.metadata_update_retries,
    )
    .await;

    match result {
        Ok(outcome) => {
            debug!(object = %obj.id, ?outcome, "Metadata updated");
            ctx.progress.complete(&mut obj).await;
        }
        Err(CatalogError::EtagConflict(_)) => {
            ctx.progress
                .fail(&mut obj, EvacuateObjectError::MetadataConflict)
                .await;
        }
        Err(e) => {
            warn!(object = %obj.id, shard = obj.shard, error = %e, "Metadata update failed");
            ctx.progress
                .fail(&mut obj, EvacuateObjectError::MetadataUpdateFailed)
                .await;
        }
    }
}
