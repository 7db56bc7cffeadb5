// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2020 Joyent, Inc.
// Copyright 2026 Edgecast Cloud LLC.

//! Evacuate job implementation
//!
//! This module implements the evacuation of objects from a storage node being
//! decommissioned. The process involves:
//!
//! 1. Discovering objects on the source storage node (via the locator, or
//!    from a previous job's records for retry jobs)
//! 2. Choosing a destination per object and batching objects into
//!    assignments, one being filled per destination
//! 3. Posting assignments to rebalancer agents on destination sharks
//! 4. Polling assignment progress and handling completions
//! 5. Pointing each copied object's catalog record at its new location
//!
//! The stages run as tasks in a `JoinSet`, connected by channels. A stage
//! returning an error or panicking fails the job and stops the others.

pub mod agent;
pub mod assignment;
pub mod db;
mod metadata;
pub mod selection;
pub mod types;

pub use types::{EvacuateObject, EvacuateObjectError, EvacuateObjectStatus};

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use rebalancer_types::{
    AgentAssignmentState, EvacuateJobUpdateMessage, JobState, ObjectSkippedReason, StorageNode,
    Task, TaskStatus,
};

use super::{JobError, Services};
use crate::config::ManagerConfig;
use crate::db::JobStore;
use crate::metrics;
use agent::AgentClientError;
use assignment::{Assignment, AssignmentState};
use db::{InsertOutcome, ObjectStore};
use selection::{DestStatus, DestinationCache};
use types::{error_label, skipped_label};

/// Discovery to selection
const OBJECT_CHANNEL_CAPACITY: usize = 100;
/// Selection to poster
const ASSIGNMENT_CHANNEL_CAPACITY: usize = 10;
/// Poster to checker
const POSTED_CHANNEL_CAPACITY: usize = 10;
/// Checker to metadata pool
const METADATA_CHANNEL_CAPACITY: usize = 100;

/// Failure reason of a job stopped through the API
pub const STOPPED_REASON: &str = "stopped by operator";

/// Where a job's objects come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectSource {
    /// Stream the node's objects from the locator
    Locator,
    /// Objects a previous job left unresolved
    PriorJob(Uuid),
}

/// Configuration for an evacuate job, fixed when the job starts
#[derive(Debug, Clone)]
pub struct EvacuateConfig {
    /// Maximum objects to process (None = unlimited)
    pub max_objects: Option<u32>,
    pub max_tasks_per_assignment: usize,
    pub max_assignment_bytes: u64,
    /// A partially filled assignment is posted once it is this old
    pub max_assignment_age: Duration,
    /// Destinations are filled to at most this share of their capacity
    pub max_fill_percentage: u32,
    /// Datacenter names to exclude from destination selection
    pub blacklist_datacenters: Vec<String>,
    pub metadata_threads: usize,
    pub metadata_update_retries: u32,
    pub assignment_check_interval: Duration,
    pub max_check_failures: u32,
    /// Polls without progress before an assignment is abandoned
    pub max_stalled_checks: u32,
    pub remove_source_location: bool,
}

impl EvacuateConfig {
    pub fn from_manager(config: &ManagerConfig, max_objects: Option<u32>) -> Self {
        Self {
            max_objects,
            max_tasks_per_assignment: config.max_tasks_per_assignment,
            max_assignment_bytes: config.max_assignment_bytes,
            max_assignment_age: Duration::from_secs(config.max_assignment_age_secs),
            max_fill_percentage: config.max_fill_percentage,
            blacklist_datacenters: config.blacklist_datacenters.clone(),
            metadata_threads: config.metadata_threads,
            metadata_update_retries: config.metadata_update_retries,
            assignment_check_interval: Duration::from_millis(config.assignment_check_interval_ms),
            max_check_failures: config.max_check_failures,
            max_stalled_checks: config.max_stalled_checks,
            remove_source_location: config.remove_source_location,
        }
    }
}

impl Default for EvacuateConfig {
    fn default() -> Self {
        Self::from_manager(&ManagerConfig::default(), None)
    }
}

/// Control surface of a running job
#[derive(Clone)]
pub struct JobHandle {
    update_tx: Arc<watch::Sender<Option<EvacuateJobUpdateMessage>>>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl JobHandle {
    /// Publish a tunable change. Returns false once the job can no longer
    /// take updates.
    pub fn update(&self, msg: EvacuateJobUpdateMessage) -> bool {
        self.update_tx.send(Some(msg)).is_ok()
    }

    /// Ask every stage to wind down.
    pub fn stop(&self) {
        self.shutdown_tx.send_replace(true);
    }

    pub fn is_stopping(&self) -> bool {
        *self.shutdown_tx.borrow()
    }
}

/// Resolves once shutdown has been requested.
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Send `item` downstream unless the job is stopping.
///
/// Returns `Ok(false)` when the caller should wind down because shutdown is
/// in progress. A closed channel outside of shutdown is fatal.
async fn forward<T>(
    tx: &mpsc::Sender<T>,
    item: T,
    shutdown: &mut watch::Receiver<bool>,
    stage: &'static str,
) -> Result<bool, JobError> {
    tokio::select! {
        sent = tx.send(item) => match sent {
            Ok(()) => Ok(true),
            Err(_) if *shutdown.borrow() => {
                debug!(stage, "Downstream closed during shutdown");
                Ok(false)
            }
            Err(_) => {
                error!(stage, "Downstream channel closed unexpectedly");
                Err(JobError::ChannelClosed(stage))
            }
        },
        _ = stopped(shutdown) => Ok(false),
    }
}

/// Tell selection a destination has no assignment outstanding any more.
fn notify_ready(ready_tx: &mpsc::UnboundedSender<String>, node: &StorageNode) {
    // Selection may legitimately be done already.
    if ready_tx.send(node.manta_storage_id.clone()).is_err() {
        debug!(shark = %node.manta_storage_id, "Selection finished, ready notice dropped");
    }
}

/// Records per-object outcomes and bumps the job's result counters.
///
/// Store failures here never stop the job; they are logged and counted.
#[derive(Clone)]
pub(crate) struct Progress {
    job_id: Uuid,
    jobs: Arc<dyn JobStore>,
    objects: Arc<dyn ObjectStore>,
}

impl Progress {
    async fn count(&self, label: &str) {
        // arch-lint: allow(no-error-swallowing) reason="Counter is best-effort; failure tracked via metric"
        if let Err(e) = self.jobs.increment_result(&self.job_id, label).await {
            warn!(job_id = %self.job_id, label, error = %e, "Failed to increment result count");
            metrics::record_db_operation_failure("increment_result");
        }
    }

    async fn save(&self, obj: &EvacuateObject) {
        if let Err(e) = self.objects.update_object(&self.job_id, obj).await {
            warn!(job_id = %self.job_id, object = %obj.id, error = %e, "Failed to save object state");
            metrics::record_db_operation_failure("update_object");
        }
    }

    async fn skip(&self, obj: &mut EvacuateObject, reason: ObjectSkippedReason) {
        debug!(object = %obj.id, reason = %reason.label(), "Object skipped");
        obj.mark_skipped(reason);
        self.save(obj).await;
        self.count(&skipped_label(&reason)).await;
        metrics::record_object_outcome("skipped");
    }

    async fn fail(&self, obj: &mut EvacuateObject, error: EvacuateObjectError) {
        debug!(object = %obj.id, error = %error, "Object failed");
        obj.mark_error(error);
        self.save(obj).await;
        self.count(&error_label(&error)).await;
        metrics::record_object_outcome("error");
    }

    async fn complete(&self, obj: &mut EvacuateObject) {
        debug!(object = %obj.id, "Object complete");
        obj.status = EvacuateObjectStatus::Complete;
        self.save(obj).await;
        self.count("complete").await;
        metrics::record_object_outcome("complete");
    }
}

/// What every stage of one job shares
#[derive(Clone)]
pub(crate) struct StageContext {
    job_id: Uuid,
    from_shark: StorageNode,
    config: Arc<EvacuateConfig>,
    services: Services,
    progress: Progress,
}

pub struct EvacuateJob {
    job_id: Uuid,
    from_shark: StorageNode,
    source: ObjectSource,
    config: EvacuateConfig,
    services: Services,
    update_rx: watch::Receiver<Option<EvacuateJobUpdateMessage>>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl EvacuateJob {
    pub fn new(
        job_id: Uuid,
        from_shark: StorageNode,
        source: ObjectSource,
        config: EvacuateConfig,
        services: Services,
    ) -> (Self, JobHandle) {
        let (update_tx, update_rx) = watch::channel(None);
        let (shutdown_tx, _) = watch::channel(false);
        let shutdown_tx = Arc::new(shutdown_tx);

        let handle = JobHandle {
            update_tx: Arc::new(update_tx),
            shutdown_tx: Arc::clone(&shutdown_tx),
        };

        let job = Self {
            job_id,
            from_shark,
            source,
            config,
            services,
            update_rx,
            shutdown_tx,
        };
        (job, handle)
    }

    /// Run the job to a terminal state and record it.
    pub async fn run(self) -> JobState {
        let job_id = self.job_id;
        let jobs = Arc::clone(&self.services.jobs);

        info!(
            job_id = %job_id,
            from_shark = %self.from_shark.manta_storage_id,
            source = ?self.source,
            "Starting evacuate job"
        );

        let (state, failure_reason) = match self.execute().await {
            Ok(()) => (JobState::Complete, None),
            Err(reason) => (JobState::Failed, Some(reason)),
        };

        if let Err(e) = jobs
            .finish_job(&job_id, state, failure_reason.as_deref())
            .await
        {
            error!(job_id = %job_id, error = %e, "Failed to record final job state");
            metrics::record_db_operation_failure("finish_job");
        }

        match &failure_reason {
            Some(reason) => warn!(job_id = %job_id, reason = %reason, "Evacuate job failed"),
            None => info!(job_id = %job_id, "Evacuate job completed successfully"),
        }
        state
    }

    async fn execute(self) -> Result<(), String> {
        let EvacuateJob {
            job_id,
            from_shark,
            source,
            config,
            services,
            update_rx,
            shutdown_tx,
        } = self;

        services
            .jobs
            .set_state(&job_id, JobState::Setup)
            .await
            .map_err(|e| format!("failed to enter setup: {}", e))?;
        info!(job_id = %job_id, "Job entering setup");

        let nodes = services
            .storinfo
            .poll()
            .await
            .map_err(|e| format!("storinfo poll failed: {}", e))?;

        let cache = DestinationCache::new(
            nodes,
            &from_shark,
            &config.blacklist_datacenters,
            config.max_fill_percentage,
        );
        if !config.blacklist_datacenters.is_empty() {
            info!(
                blacklist = ?config.blacklist_datacenters,
                "Excluding datacenters from destination selection"
            );
        }
        info!(
            job_id = %job_id,
            destinations = cache.len(),
            max_fill_percentage = config.max_fill_percentage,
            "Initialized destination sharks cache"
        );

        let ctx = StageContext {
            job_id,
            from_shark,
            config: Arc::new(config),
            progress: Progress {
                job_id,
                jobs: Arc::clone(&services.jobs),
                objects: Arc::clone(&services.objects),
            },
            services,
        };

        let (object_tx, object_rx) = mpsc::channel(OBJECT_CHANNEL_CAPACITY);
        let (assign_tx, assign_rx) = mpsc::channel(ASSIGNMENT_CHANNEL_CAPACITY);
        let (posted_tx, posted_rx) = mpsc::channel(POSTED_CHANNEL_CAPACITY);
        let (md_tx, md_rx) = mpsc::channel(METADATA_CHANNEL_CAPACITY);
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();

        let mut stages: JoinSet<Result<(), JobError>> = JoinSet::new();
        let mut names = HashMap::new();

        let handle = stages.spawn(discovery(
            ctx.clone(),
            source,
            object_tx,
            shutdown_tx.subscribe(),
        ));
        names.insert(handle.id(), "discovery");

        let selection = Selection {
            ctx: ctx.clone(),
            cache,
            batches: BTreeMap::new(),
            assign_tx,
            shutdown: shutdown_tx.subscribe(),
        };
        let handle = stages.spawn(selection.run(object_rx, ready_rx));
        names.insert(handle.id(), "selection");

        let handle = stages.spawn(poster(
            ctx.clone(),
            assign_rx,
            posted_tx,
            ready_tx.clone(),
            shutdown_tx.subscribe(),
        ));
        names.insert(handle.id(), "poster");

        let handle = stages.spawn(checker(
            ctx.clone(),
            posted_rx,
            md_tx,
            ready_tx,
            shutdown_tx.subscribe(),
        ));
        names.insert(handle.id(), "checker");

        let handle = stages.spawn(metadata::metadata_broker(
            ctx.clone(),
            md_rx,
            update_rx,
            shutdown_tx.subscribe(),
        ));
        names.insert(handle.id(), "metadata");

        let mut failure: Option<String> = None;

        if let Err(e) = ctx.services.jobs.set_state(&job_id, JobState::Running).await {
            error!(job_id = %job_id, error = %e, "Failed to enter running");
            failure = Some(format!("failed to enter running: {}", e));
            shutdown_tx.send_replace(true);
        } else {
            info!(job_id = %job_id, "Job running");
        }

        while let Some(joined) = stages.join_next_with_id().await {
            match joined {
                Ok((id, Ok(()))) => {
                    let stage = names.get(&id).copied().unwrap_or("unknown");
                    debug!(job_id = %job_id, stage, "Stage finished");
                }
                Ok((id, Err(e))) => {
                    let stage = names.get(&id).copied().unwrap_or("unknown");
                    error!(job_id = %job_id, stage, error = %e, "Stage failed");
                    if failure.is_none() {
                        failure = Some(format!("{} stage failed: {}", stage, e));
                    }
                    shutdown_tx.send_replace(true);
                }
                Err(e) => {
                    let stage = names.get(&e.id()).copied().unwrap_or("unknown");
                    if e.is_panic() {
                        metrics::record_task_panic(stage);
                    }
                    error!(job_id = %job_id, stage, error = %e, "Stage panicked");
                    let failed = JobError::Panicked {
                        stage,
                        message: e.to_string(),
                    };
                    if failure.is_none() {
                        failure = Some(failed.to_string());
                    }
                    shutdown_tx.send_replace(true);
                }
            }
        }

        match failure {
            Some(reason) => Err(reason),
            None if *shutdown_tx.borrow() => Err(STOPPED_REASON.to_string()),
            None => Ok(()),
        }
    }
}

// ============================================================================
// Discovery
// ============================================================================

enum Discovered {
    /// Counted in the job total
    Counted,
    Duplicate,
    Stopped,
}

async fn discovery(
    ctx: StageContext,
    source: ObjectSource,
    object_tx: mpsc::Sender<EvacuateObject>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), JobError> {
    let limit = ctx.config.max_objects.map(u64::from);
    let mut counted = 0u64;

    match source {
        ObjectSource::PriorJob(prior) => {
            let objects = ctx.services.objects.unresolved_objects(&prior).await?;
            info!(
                job_id = %ctx.job_id,
                retry_of = %prior,
                objects = objects.len(),
                "Seeding retry job from prior job"
            );
            for mut obj in objects {
                if limit.is_some_and(|l| counted >= l) {
                    break;
                }
                obj.reset();
                match record_discovered(&ctx, obj, &object_tx, &mut shutdown).await? {
                    Discovered::Counted => counted += 1,
                    Discovered::Duplicate => {}
                    Discovered::Stopped => return Ok(()),
                }
            }
        }
        ObjectSource::Locator => {
            let (located_tx, mut located_rx) = mpsc::channel(OBJECT_CHANNEL_CAPACITY);
            let locator = Arc::clone(&ctx.services.locator);
            let storage_id = ctx.from_shark.manta_storage_id.clone();
            let listing =
                tokio::spawn(async move { locator.stream_objects(&storage_id, located_tx).await });

            loop {
                if limit.is_some_and(|l| counted >= l) {
                    info!(job_id = %ctx.job_id, max_objects = counted, "Object limit reached");
                    break;
                }
                let located = tokio::select! {
                    _ = stopped(&mut shutdown) => {
                        listing.abort();
                        return Ok(());
                    }
                    located = located_rx.recv() => located,
                };
                let Some(located) = located else {
                    break;
                };
                match record_discovered(&ctx, located.into(), &object_tx, &mut shutdown).await? {
                    Discovered::Counted => counted += 1,
                    Discovered::Duplicate => {}
                    Discovered::Stopped => {
                        listing.abort();
                        return Ok(());
                    }
                }
            }

            // The locator stops early once its receiver is gone.
            drop(located_rx);
            match listing.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(job_id = %ctx.job_id, error = %e, "Locator listing failed");
                    return Err(e.into());
                }
                Err(e) => {
                    if e.is_panic() {
                        metrics::record_task_panic("locator");
                    }
                    return Err(JobError::Panicked {
                        stage: "locator",
                        message: e.to_string(),
                    });
                }
            }
        }
    }

    info!(job_id = %ctx.job_id, objects = counted, "Object discovery completed");
    Ok(())
}

/// Record a discovered object and pass it on if it can be moved.
async fn record_discovered(
    ctx: &StageContext,
    mut obj: EvacuateObject,
    object_tx: &mpsc::Sender<EvacuateObject>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<Discovered, JobError> {
    // Without an id there is no row to keep; only the counters see it.
    if obj.id.is_empty() {
        warn!(job_id = %ctx.job_id, owner = %obj.owner, "Object record without an id");
        ctx.progress.count("total").await;
        ctx.progress
            .count(&error_label(&EvacuateObjectError::BadObjectRecord))
            .await;
        metrics::record_object_outcome("error");
        return Ok(Discovered::Counted);
    }

    if ctx.services.objects.insert_object(&ctx.job_id, &obj).await? == InsertOutcome::Duplicate {
        debug!(object = %obj.id, shard = obj.shard, "Duplicate object");
        if let Err(e) = ctx
            .services
            .objects
            .record_duplicate(&ctx.job_id, &obj.id, obj.shard)
            .await
        {
            warn!(object = %obj.id, error = %e, "Failed to record duplicate");
            metrics::record_db_operation_failure("record_duplicate");
        }
        ctx.progress.count("duplicate").await;
        return Ok(Discovered::Duplicate);
    }

    ctx.progress.count("total").await;

    if let Err(error) = obj.validate() {
        ctx.progress.fail(&mut obj, error).await;
        return Ok(Discovered::Counted);
    }

    if forward(object_tx, obj, shutdown, "discovery").await? {
        Ok(Discovered::Counted)
    } else {
        Ok(Discovered::Stopped)
    }
}

// ============================================================================
// Selection and batching
// ============================================================================

struct Selection {
    ctx: StageContext,
    cache: DestinationCache,
    /// The assignment being filled for each destination
    batches: BTreeMap<String, Assignment>,
    assign_tx: mpsc::Sender<Assignment>,
    shutdown: watch::Receiver<bool>,
}

impl Selection {
    async fn run(
        mut self,
        mut object_rx: mpsc::Receiver<EvacuateObject>,
        mut ready_rx: mpsc::UnboundedReceiver<String>,
    ) -> Result<(), JobError> {
        let tick_every = self
            .ctx
            .config
            .max_assignment_age
            .clamp(Duration::from_millis(10), Duration::from_secs(1));
        let mut tick = tokio::time::interval(tick_every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut discovery_done = false;
        // An object waiting for a busy destination to come free
        let mut waiting: Option<EvacuateObject> = None;

        info!(job_id = %self.ctx.job_id, "Assignment manager started");

        loop {
            if discovery_done && waiting.is_none() && self.batches.values().all(Assignment::is_empty)
            {
                break;
            }

            tokio::select! {
                _ = stopped(&mut self.shutdown) => return Ok(()),

                obj = object_rx.recv(), if !discovery_done && waiting.is_none() => {
                    match obj {
                        Some(obj) => {
                            if !self.place(obj, &mut waiting).await? {
                                return Ok(());
                            }
                        }
                        None => {
                            debug!(job_id = %self.ctx.job_id, "Discovery finished, flushing assignments");
                            discovery_done = true;
                            if !self.flush_due(true).await? {
                                return Ok(());
                            }
                        }
                    }
                }

                Some(storage_id) = ready_rx.recv() => {
                    self.cache.set_status(&storage_id, DestStatus::Ready);
                    if !self.flush_if_due(&storage_id, discovery_done).await? {
                        return Ok(());
                    }
                    if let Some(obj) = waiting.take() {
                        if !self.place(obj, &mut waiting).await? {
                            return Ok(());
                        }
                    }
                }

                _ = tick.tick() => {
                    if !self.flush_due(discovery_done).await? {
                        return Ok(());
                    }
                }
            }
        }

        info!(job_id = %self.ctx.job_id, "Assignment manager completed");
        Ok(())
    }

    /// A destination that has an assignment out and whose next one cannot
    /// take `bytes` more is skipped for now.
    fn is_available(&self, storage_id: &str, bytes: u64) -> bool {
        let config = &self.ctx.config;
        self.cache.status(storage_id) != Some(DestStatus::Assigned)
            || !self.batches.get(storage_id).is_some_and(|b| {
                b.would_overflow(
                    bytes,
                    config.max_tasks_per_assignment,
                    config.max_assignment_bytes,
                )
            })
    }

    /// Place one object. Returns false if the job is shutting down.
    async fn place(
        &mut self,
        mut obj: EvacuateObject,
        waiting: &mut Option<EvacuateObject>,
    ) -> Result<bool, JobError> {
        let from_shark = &self.ctx.from_shark;
        let bytes = obj.content_length;

        let dest = self
            .cache
            .select(&obj, from_shark, |id| self.is_available(id, bytes))
            .cloned();

        let Some(dest) = dest else {
            if self.cache.select(&obj, from_shark, |_| true).is_some() {
                debug!(object = %obj.id, "Every candidate destination is busy, waiting");
                *waiting = Some(obj);
            } else {
                self.ctx
                    .progress
                    .fail(&mut obj, EvacuateObjectError::NoEligibleDestination)
                    .await;
            }
            return Ok(true);
        };

        let Some(source) = obj.source_shark(from_shark).cloned() else {
            self.ctx
                .progress
                .fail(&mut obj, EvacuateObjectError::MissingLocations)
                .await;
            return Ok(true);
        };

        let storage_id = dest.manta_storage_id.clone();
        let (max_tasks, max_bytes) = (
            self.ctx.config.max_tasks_per_assignment,
            self.ctx.config.max_assignment_bytes,
        );

        // A free destination whose batch cannot take this object gets the
        // batch posted first.
        if self.cache.status(&storage_id) == Some(DestStatus::Ready)
            && self
                .batches
                .get(&storage_id)
                .is_some_and(|b| b.would_overflow(bytes, max_tasks, max_bytes))
            && !self.flush(&storage_id).await?
        {
            return Ok(false);
        }

        self.cache.debit(&storage_id, obj.size_mb());
        let batch = self
            .batches
            .entry(storage_id.clone())
            .or_insert_with(|| Assignment::new(dest));
        batch.add(obj, source);
        if let Some(added) = batch.objects.last() {
            debug!(
                object = %added.id,
                shark = %storage_id,
                assignment = %batch.id,
                "Object assigned"
            );
            self.ctx.progress.save(added).await;
        }

        let full = batch.is_full(max_tasks, max_bytes);
        if full && self.cache.status(&storage_id) == Some(DestStatus::Ready) {
            return self.flush(&storage_id).await;
        }
        Ok(true)
    }

    /// Hand a destination's batch to the poster.
    async fn flush(&mut self, storage_id: &str) -> Result<bool, JobError> {
        let Some(mut batch) = self.batches.remove(storage_id) else {
            return Ok(true);
        };
        if batch.is_empty() {
            return Ok(true);
        }

        self.cache.set_status(storage_id, DestStatus::Assigned);
        batch.state = AssignmentState::Init;
        info!(
            assignment = %batch.id,
            shark = %storage_id,
            tasks = batch.len(),
            bytes = batch.total_bytes,
            "Flushing assignment"
        );
        forward(&self.assign_tx, batch, &mut self.shutdown, "selection").await
    }

    async fn flush_if_due(
        &mut self,
        storage_id: &str,
        discovery_done: bool,
    ) -> Result<bool, JobError> {
        if self.cache.status(storage_id) != Some(DestStatus::Ready) {
            return Ok(true);
        }
        let config = &self.ctx.config;
        let due = self.batches.get(storage_id).is_some_and(|b| {
            !b.is_empty()
                && (discovery_done
                    || b.is_full(config.max_tasks_per_assignment, config.max_assignment_bytes)
                    || b.age() >= config.max_assignment_age)
        });
        if due {
            return self.flush(storage_id).await;
        }
        Ok(true)
    }

    async fn flush_due(&mut self, discovery_done: bool) -> Result<bool, JobError> {
        let ids: Vec<String> = self.batches.keys().cloned().collect();
        for id in ids {
            if !self.flush_if_due(&id, discovery_done).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

// ============================================================================
// Posting
// ============================================================================

async fn poster(
    ctx: StageContext,
    mut assign_rx: mpsc::Receiver<Assignment>,
    posted_tx: mpsc::Sender<Assignment>,
    ready_tx: mpsc::UnboundedSender<String>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), JobError> {
    info!(job_id = %ctx.job_id, "Assignment poster started");

    loop {
        let mut assignment = tokio::select! {
            _ = stopped(&mut shutdown) => break,
            assignment = assign_rx.recv() => match assignment {
                Some(a) => a,
                None => break,
            },
        };

        let payload = assignment.to_payload();
        match ctx
            .services
            .agents
            .post_assignment(&assignment.dest_shark, &payload)
            .await
        {
            Ok(()) => {
                debug!(
                    assignment = %assignment.id,
                    shark = %assignment.dest_shark.manta_storage_id,
                    tasks = assignment.len(),
                    "Assignment posted"
                );
                assignment.state = AssignmentState::Assigned;
                metrics::record_assignment("posted");
                if !forward(&posted_tx, assignment, &mut shutdown, "poster").await? {
                    break;
                }
            }
            Err(e) => {
                let (state, reason) = match e {
                    AgentClientError::Unreachable(_) => (
                        AssignmentState::AgentUnavailable,
                        ObjectSkippedReason::DestinationUnreachable,
                    ),
                    AgentClientError::Rejected(_) | AgentClientError::NotFound => (
                        AssignmentState::Rejected,
                        ObjectSkippedReason::AssignmentRejected,
                    ),
                };
                warn!(
                    assignment = %assignment.id,
                    shark = %assignment.dest_shark.manta_storage_id,
                    error = %e,
                    "Failed to post assignment"
                );
                assignment.state = state;
                metrics::record_assignment(if state == AssignmentState::Rejected {
                    "rejected"
                } else {
                    "agent_unavailable"
                });
                for obj in assignment.objects.iter_mut() {
                    ctx.progress.skip(obj, reason).await;
                }
                notify_ready(&ready_tx, &assignment.dest_shark);
            }
        }
    }

    info!(job_id = %ctx.job_id, "Assignment poster completed");
    Ok(())
}

// ============================================================================
// Checking
// ============================================================================

struct Outstanding {
    assignment: Assignment,
    /// Consecutive failed polls
    failures: u32,
    /// Tasks the agent had finished at the last poll
    finished: usize,
    /// Consecutive polls with no newly finished task
    stalled: u32,
}

async fn checker(
    ctx: StageContext,
    mut posted_rx: mpsc::Receiver<Assignment>,
    md_tx: mpsc::Sender<EvacuateObject>,
    ready_tx: mpsc::UnboundedSender<String>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), JobError> {
    info!(job_id = %ctx.job_id, "Assignment checker started");

    let mut outstanding: BTreeMap<String, Outstanding> = BTreeMap::new();
    let mut inbound_open = true;
    let mut interval = tokio::time::interval(ctx.config.assignment_check_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if !inbound_open && outstanding.is_empty() {
            break;
        }

        tokio::select! {
            _ = stopped(&mut shutdown) => break,

            posted = posted_rx.recv(), if inbound_open => match posted {
                Some(assignment) => {
                    outstanding.insert(
                        assignment.id.clone(),
                        Outstanding {
                            assignment,
                            failures: 0,
                            finished: 0,
                            stalled: 0,
                        },
                    );
                }
                None => inbound_open = false,
            },

            _ = interval.tick(), if !outstanding.is_empty() => {
                if !check_outstanding(&ctx, &mut outstanding, &md_tx, &ready_tx, &mut shutdown).await? {
                    break;
                }
            }
        }
    }

    info!(job_id = %ctx.job_id, "Assignment checker completed");
    Ok(())
}

/// Poll every outstanding assignment once. Returns false on shutdown.
async fn check_outstanding(
    ctx: &StageContext,
    outstanding: &mut BTreeMap<String, Outstanding>,
    md_tx: &mpsc::Sender<EvacuateObject>,
    ready_tx: &mpsc::UnboundedSender<String>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<bool, JobError> {
    let ids: Vec<String> = outstanding.keys().cloned().collect();

    for id in ids {
        let Some(entry) = outstanding.get_mut(&id) else {
            continue;
        };
        let dest = entry.assignment.dest_shark.clone();

        match ctx.services.agents.get_assignment(&dest, &id).await {
            Ok(status) => match status.stats.state {
                AgentAssignmentState::Complete(failed) => {
                    let Some(entry) = outstanding.remove(&id) else {
                        continue;
                    };
                    if !complete_assignment(ctx, entry.assignment, failed, md_tx, shutdown).await? {
                        return Ok(false);
                    }
                    notify_ready(ready_tx, &dest);
                }
                _ => {
                    entry.failures = 0;
                    if status.stats.complete > entry.finished {
                        entry.finished = status.stats.complete;
                        entry.stalled = 0;
                    } else {
                        entry.stalled += 1;
                    }
                    debug!(
                        assignment = %id,
                        finished = entry.finished,
                        stalled = entry.stalled,
                        "Assignment still in progress"
                    );
                    if entry.stalled >= ctx.config.max_stalled_checks {
                        warn!(
                            assignment = %id,
                            shark = %dest.manta_storage_id,
                            polls = entry.stalled,
                            "Assignment made no progress, abandoning it"
                        );
                        if let Some(mut entry) = outstanding.remove(&id) {
                            metrics::record_assignment("stalled");
                            abandon(ctx, &mut entry.assignment, ObjectSkippedReason::AgentBusy)
                                .await;
                        }
                        notify_ready(ready_tx, &dest);
                    }
                }
            },
            Err(AgentClientError::NotFound) => {
                warn!(assignment = %id, shark = %dest.manta_storage_id, "Agent lost assignment");
                if let Some(mut entry) = outstanding.remove(&id) {
                    metrics::record_assignment("lost");
                    abandon(ctx, &mut entry.assignment, ObjectSkippedReason::AgentAssignmentNoEnt)
                        .await;
                }
                notify_ready(ready_tx, &dest);
            }
            Err(e) => {
                entry.failures += 1;
                warn!(
                    assignment = %id,
                    shark = %dest.manta_storage_id,
                    failures = entry.failures,
                    error = %e,
                    "Error checking assignment"
                );
                if entry.failures > ctx.config.max_check_failures {
                    if let Some(mut entry) = outstanding.remove(&id) {
                        metrics::record_assignment("agent_unavailable");
                        abandon(
                            ctx,
                            &mut entry.assignment,
                            ObjectSkippedReason::DestinationUnreachable,
                        )
                        .await;
                    }
                    notify_ready(ready_tx, &dest);
                }
            }
        }
    }
    Ok(true)
}

async fn abandon(ctx: &StageContext, assignment: &mut Assignment, reason: ObjectSkippedReason) {
    assignment.state = AssignmentState::AgentUnavailable;
    for obj in assignment.objects.iter_mut() {
        ctx.progress.skip(obj, reason).await;
    }
}

/// Settle the objects of an assignment the agent has finished.
async fn complete_assignment(
    ctx: &StageContext,
    mut assignment: Assignment,
    failed_tasks: Option<Vec<Task>>,
    md_tx: &mpsc::Sender<EvacuateObject>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<bool, JobError> {
    assignment.state = AssignmentState::AgentComplete;
    metrics::record_assignment("complete");

    let failed: HashMap<String, ObjectSkippedReason> = failed_tasks
        .into_iter()
        .flatten()
        .filter_map(|task| match task.status {
            TaskStatus::Failed(reason) => Some((task.object_id, reason)),
            _ => None,
        })
        .collect();

    info!(
        assignment = %assignment.id,
        shark = %assignment.dest_shark.manta_storage_id,
        tasks = assignment.len(),
        failed = failed.len(),
        "Assignment complete on agent"
    );

    let mut copied = Vec::new();
    for mut obj in std::mem::take(&mut assignment.objects) {
        match failed.get(&obj.id) {
            Some(reason) => match EvacuateObjectError::from_agent_reason(reason) {
                Some(error) => ctx.progress.fail(&mut obj, error).await,
                None => ctx.progress.skip(&mut obj, *reason).await,
            },
            None => {
                obj.status = EvacuateObjectStatus::PostProcessing;
                ctx.progress.save(&obj).await;
                copied.push(obj);
            }
        }
    }

    // The agent keeps its record until told otherwise.
    if let Err(e) = ctx
        .services
        .agents
        .delete_assignment(&assignment.dest_shark, &assignment.id)
        .await
    {
        warn!(assignment = %assignment.id, error = %e, "Failed to delete assignment on agent");
    }
    assignment.state = AssignmentState::PostProcessed;

    for obj in copied {
        if !forward(md_tx, obj, shutdown, "checker").await? {
            return Ok(false);
        }
    }
    Ok(true)
}
