// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! End to end runs of the evacuate pipeline against in-process fakes of the
//! locator, storinfo, catalog and agents.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use uuid::Uuid;

use rebalancer_manager::catalog::{Catalog, CatalogEntry, CatalogError};
use rebalancer_manager::db::{JobStore, MemoryJobStore, NewJob};
use rebalancer_manager::jobs::Services;
use rebalancer_manager::jobs::evacuate::agent::{AgentClient, AgentClientError};
use rebalancer_manager::jobs::evacuate::db::{MemoryObjectStore, ObjectStore};
use rebalancer_manager::jobs::evacuate::{
    EvacuateConfig, EvacuateJob, EvacuateObjectError, EvacuateObjectStatus, JobHandle,
    ObjectSource, STOPPED_REASON,
};
use rebalancer_manager::locator::{LocatedObject, Locator, LocatorError};
use rebalancer_manager::storinfo::{StorageNodeInfo, Storinfo, StorinfoError};
use rebalancer_types::{
    AgentAssignmentState, AgentAssignmentStats, Assignment, AssignmentPayload,
    EvacuateJobUpdateMessage, JobState, ObjectSkippedReason, StorageNode, TaskStatus,
};

// ============================================================================
// Fakes
// ============================================================================

#[derive(Clone, Copy)]
enum LocatorMode {
    Ok,
    Fail,
    Panic,
}

struct FakeLocator {
    objects: Vec<LocatedObject>,
    mode: LocatorMode,
    calls: AtomicUsize,
}

#[async_trait]
impl Locator for FakeLocator {
    async fn stream_objects(
        &self,
        _storage_id: &str,
        tx: mpsc::Sender<LocatedObject>,
    ) -> Result<(), LocatorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.mode {
            LocatorMode::Ok => {}
            LocatorMode::Fail => return Err(LocatorError::Status(503)),
            LocatorMode::Panic => panic!("locator blew up"),
        }
        for obj in &self.objects {
            if tx.send(obj.clone()).await.is_err() {
                break;
            }
        }
        Ok(())
    }
}

struct FakeStorinfo {
    nodes: Vec<StorageNodeInfo>,
    fail: bool,
}

#[async_trait]
impl Storinfo for FakeStorinfo {
    async fn poll(&self) -> Result<Vec<StorageNodeInfo>, StorinfoError> {
        if self.fail {
            return Err(StorinfoError::Unavailable(503));
        }
        Ok(self.nodes.clone())
    }
}

/// Object records with an etag bumped on every write
#[derive(Default)]
struct FakeCatalog {
    records: Mutex<HashMap<String, (Value, u64)>>,
    /// Every write fails with this status; 409 is an etag conflict.
    fail_writes: Mutex<Option<u16>>,
}

impl FakeCatalog {
    fn seed(objects: &[LocatedObject]) -> Self {
        let records = objects
            .iter()
            .map(|o| (o.id.clone(), (json!({ "sharks": o.sharks }), 1)))
            .collect();
        Self {
            records: Mutex::new(records),
            fail_writes: Mutex::new(None),
        }
    }

    fn fail_writes(&self, status: u16) {
        *self.fail_writes.lock().unwrap() = Some(status);
    }

    fn shark_ids(&self, id: &str) -> Vec<String> {
        let records = self.records.lock().unwrap();
        records[id].0["sharks"]
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["manta_storage_id"].as_str().unwrap().to_string())
            .collect()
    }
}

#[async_trait]
impl Catalog for FakeCatalog {
    async fn get_object(&self, shard: u32, id: &str) -> Result<CatalogEntry, CatalogError> {
        let records = self.records.lock().unwrap();
        let (value, etag) = records.get(id).ok_or_else(|| CatalogError::NotFound {
            shard,
            id: id.to_string(),
        })?;
        Ok(CatalogEntry {
            value: value.clone(),
            etag: etag.to_string(),
        })
    }

    async fn put_object(
        &self,
        shard: u32,
        id: &str,
        value: &Value,
        etag: &str,
    ) -> Result<(), CatalogError> {
        match *self.fail_writes.lock().unwrap() {
            Some(409) => return Err(CatalogError::EtagConflict(id.to_string())),
            Some(status) => return Err(CatalogError::Status(status)),
            None => {}
        }
        let mut records = self.records.lock().unwrap();
        let record = records.get_mut(id).ok_or_else(|| CatalogError::NotFound {
            shard,
            id: id.to_string(),
        })?;
        if record.1.to_string() != etag {
            return Err(CatalogError::EtagConflict(id.to_string()));
        }
        *record = (value.clone(), record.1 + 1);
        Ok(())
    }
}

/// Agents that finish every assignment on the first poll unless held.
#[derive(Default)]
struct FakeAgents {
    posted: Mutex<HashMap<String, (StorageNode, AssignmentPayload)>>,
    /// Object ids the agent reports as failed, and why
    failures: Mutex<HashMap<String, ObjectSkippedReason>>,
    hold: AtomicBool,
    post_count: AtomicUsize,
}

impl FakeAgents {
    fn fail_object(&self, id: &str, reason: ObjectSkippedReason) {
        self.failures.lock().unwrap().insert(id.to_string(), reason);
    }

    fn destinations(&self) -> Vec<String> {
        self.posted
            .lock()
            .unwrap()
            .values()
            .map(|(node, _)| node.manta_storage_id.clone())
            .collect()
    }
}

#[async_trait]
impl AgentClient for FakeAgents {
    async fn post_assignment(
        &self,
        node: &StorageNode,
        payload: &AssignmentPayload,
    ) -> Result<(), AgentClientError> {
        self.post_count.fetch_add(1, Ordering::SeqCst);
        self.posted
            .lock()
            .unwrap()
            .insert(payload.id.clone(), (node.clone(), payload.clone()));
        Ok(())
    }

    async fn get_assignment(
        &self,
        _node: &StorageNode,
        id: &str,
    ) -> Result<Assignment, AgentClientError> {
        let posted = self.posted.lock().unwrap();
        let (_, payload) = posted.get(id).ok_or(AgentClientError::NotFound)?;
        let total = payload.tasks.len() as usize;

        if self.hold.load(Ordering::SeqCst) {
            return Ok(Assignment {
                uuid: id.to_string(),
                stats: AgentAssignmentStats {
                    state: AgentAssignmentState::Running,
                    failed: 0,
                    complete: 0,
                    total,
                },
            });
        }

        let failures = self.failures.lock().unwrap();
        let failed: Vec<_> = payload
            .tasks
            .iter()
            .filter_map(|t| {
                failures.get(&t.object_id).map(|reason| {
                    let mut task = t.clone();
                    task.status = TaskStatus::Failed(*reason);
                    task
                })
            })
            .collect();
        let failed_count = failed.len() as usize;

        Ok(Assignment {
            uuid: id.to_string(),
            stats: AgentAssignmentStats {
                state: AgentAssignmentState::Complete(if failed.is_empty() {
                    None
                } else {
                    Some(failed)
                }),
                failed: failed_count,
                complete: total - failed_count,
                total,
            },
        })
    }

    async fn delete_assignment(
        &self,
        _node: &StorageNode,
        _id: &str,
    ) -> Result<(), AgentClientError> {
        Ok(())
    }
}

// ============================================================================
// Harness
// ============================================================================

fn from_shark() -> StorageNode {
    StorageNode::new("1.stor.domain.com", "dc1")
}

fn located(n: usize) -> Vec<LocatedObject> {
    (0..n)
        .map(|i| LocatedObject {
            id: format!("obj-{}", i),
            owner: "owner".to_string(),
            content_length: 1024 * 1024,
            content_md5: "1B2M2Y8AsgTpgAmY7PhCfg==".to_string(),
            sharks: vec![from_shark(), StorageNode::new("2.stor.domain.com", "dc2")],
            shard: 1,
        })
        .collect()
}

fn nodes() -> Vec<StorageNodeInfo> {
    vec![
        StorageNodeInfo::new("1.stor.domain.com", "dc1", 100_000, 10.0),
        StorageNodeInfo::new("2.stor.domain.com", "dc2", 100_000, 10.0),
        StorageNodeInfo::new("4.stor.domain.com", "dc1", 900_000, 10.0),
        StorageNodeInfo::new("3.stor.domain.com", "dc3", 100_000, 10.0),
        StorageNodeInfo::new("5.stor.domain.com", "dc3", 50_000, 10.0),
    ]
}

fn test_config() -> EvacuateConfig {
    EvacuateConfig {
        max_tasks_per_assignment: 3,
        max_assignment_age: Duration::from_millis(20),
        assignment_check_interval: Duration::from_millis(10),
        max_check_failures: 2,
        ..EvacuateConfig::default()
    }
}

struct Harness {
    jobs: Arc<MemoryJobStore>,
    objects: Arc<MemoryObjectStore>,
    locator: Arc<FakeLocator>,
    catalog: Arc<FakeCatalog>,
    agents: Arc<FakeAgents>,
    services: Services,
}

impl Harness {
    fn new(objects: Vec<LocatedObject>, mode: LocatorMode, storinfo_fails: bool) -> Self {
        let jobs = Arc::new(MemoryJobStore::new());
        let object_store = Arc::new(MemoryObjectStore::new());
        let catalog = Arc::new(FakeCatalog::seed(&objects));
        let locator = Arc::new(FakeLocator {
            objects,
            mode,
            calls: AtomicUsize::new(0),
        });
        let agents = Arc::new(FakeAgents::default());
        let services = Services {
            jobs: jobs.clone(),
            objects: object_store.clone(),
            storinfo: Arc::new(FakeStorinfo {
                nodes: nodes(),
                fail: storinfo_fails,
            }),
            locator: locator.clone(),
            catalog: catalog.clone(),
            agents: agents.clone(),
        };
        Self {
            jobs,
            objects: object_store,
            locator,
            catalog,
            agents,
            services,
        }
    }

    async fn job(&self, source: ObjectSource, config: EvacuateConfig) -> (Uuid, EvacuateJob, JobHandle) {
        let retry_of = match &source {
            ObjectSource::PriorJob(id) => Some(*id),
            ObjectSource::Locator => None,
        };
        let job_id = self
            .jobs
            .create_job(&NewJob {
                from_shark: from_shark(),
                max_objects: config.max_objects,
                retry_of,
            })
            .await
            .unwrap();
        let (job, handle) =
            EvacuateJob::new(job_id, from_shark(), source, config, self.services.clone());
        (job_id, job, handle)
    }

    async fn run(&self, source: ObjectSource, config: EvacuateConfig) -> Uuid {
        let (job_id, job, _handle) = self.job(source, config).await;
        tokio::time::timeout(Duration::from_secs(10), job.run())
            .await
            .expect("job did not finish");
        job_id
    }

    async fn result(&self, job_id: &Uuid, label: &str) -> i64 {
        self.jobs
            .get_results(job_id)
            .await
            .unwrap()
            .get(label)
            .copied()
            .unwrap_or(0)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn evacuates_into_datacenters_without_a_copy() {
    let h = Harness::new(located(7), LocatorMode::Ok, false);
    let job_id = h.run(ObjectSource::Locator, test_config()).await;

    let record = h.jobs.get_job(&job_id).await.unwrap();
    assert_eq!(record.state, JobState::Complete);
    assert_eq!(record.failure_reason, None);
    assert_eq!(h.result(&job_id, "total").await, 7);
    assert_eq!(h.result(&job_id, "complete").await, 7);

    // dc1 and dc2 hold copies, so everything lands in dc3.
    for dest in h.agents.destinations() {
        assert!(
            dest == "3.stor.domain.com" || dest == "5.stor.domain.com",
            "unexpected destination {}",
            dest
        );
    }

    for obj in h.objects.objects(&job_id).await.unwrap() {
        assert_eq!(obj.status, EvacuateObjectStatus::Complete);
        let dest = obj.dest_shark.unwrap().manta_storage_id;
        let sharks = h.catalog.shark_ids(&obj.id);
        assert_eq!(sharks.len(), 2);
        assert!(sharks.contains(&dest));
        assert!(sharks.contains(&"2.stor.domain.com".to_string()));
        assert!(!sharks.contains(&"1.stor.domain.com".to_string()));
    }
}

#[tokio::test]
async fn agent_checksum_failures_are_errors() {
    let h = Harness::new(located(4), LocatorMode::Ok, false);
    h.agents
        .fail_object("obj-0", ObjectSkippedReason::ChecksumMismatch);
    h.agents.fail_object("obj-1", ObjectSkippedReason::AgentBusy);

    let job_id = h.run(ObjectSource::Locator, test_config()).await;

    assert_eq!(
        h.jobs.get_job(&job_id).await.unwrap().state,
        JobState::Complete
    );
    assert_eq!(h.result(&job_id, "total").await, 4);
    assert_eq!(h.result(&job_id, "complete").await, 2);
    assert_eq!(h.result(&job_id, "error:checksum_mismatch").await, 1);
    assert_eq!(h.result(&job_id, "skipped:agent_busy").await, 1);

    // Failed copies keep their original locations.
    assert_eq!(
        h.catalog.shark_ids("obj-0"),
        vec!["1.stor.domain.com", "2.stor.domain.com"]
    );
}

#[tokio::test]
async fn duplicates_and_bad_records_are_counted() {
    let mut objects = located(3);
    objects.push(objects[0].clone());
    objects.push(LocatedObject {
        id: "no-md5".to_string(),
        content_md5: String::new(),
        ..objects[1].clone()
    });
    let h = Harness::new(objects, LocatorMode::Ok, false);

    let job_id = h.run(ObjectSource::Locator, test_config()).await;

    assert_eq!(h.result(&job_id, "total").await, 4);
    assert_eq!(h.result(&job_id, "duplicate").await, 1);
    assert_eq!(h.result(&job_id, "complete").await, 3);
    assert_eq!(h.result(&job_id, "error:bad_object_record").await, 1);

    let duplicates = h.objects.duplicates(&job_id).await.unwrap();
    assert_eq!(duplicates.len(), 1);
    assert_eq!(duplicates[0].id, "obj-0");
}

#[tokio::test]
async fn unreadable_records_do_not_fail_the_job() {
    let mut objects = located(4);
    // An undecodable line and a record without an id both arrive as
    // records with an empty id.
    let no_id = LocatedObject {
        id: String::new(),
        ..objects[0].clone()
    };
    objects.insert(1, LocatedObject::default());
    objects.insert(3, no_id);
    let h = Harness::new(objects, LocatorMode::Ok, false);

    let job_id = h.run(ObjectSource::Locator, test_config()).await;

    let record = h.jobs.get_job(&job_id).await.unwrap();
    assert_eq!(record.state, JobState::Complete);
    assert_eq!(record.failure_reason, None);
    assert_eq!(h.result(&job_id, "total").await, 6);
    assert_eq!(h.result(&job_id, "complete").await, 4);
    assert_eq!(h.result(&job_id, "error:bad_object_record").await, 2);
    assert_eq!(h.result(&job_id, "duplicate").await, 0);
    assert_eq!(h.objects.objects(&job_id).await.unwrap().len(), 4);
}

#[tokio::test]
async fn max_objects_limits_discovery() {
    let h = Harness::new(located(10), LocatorMode::Ok, false);
    let config = EvacuateConfig {
        max_objects: Some(4),
        ..test_config()
    };

    let job_id = h.run(ObjectSource::Locator, config).await;

    assert_eq!(h.result(&job_id, "total").await, 4);
    assert_eq!(h.result(&job_id, "complete").await, 4);
    assert_eq!(h.objects.objects(&job_id).await.unwrap().len(), 4);
}

#[tokio::test]
async fn retry_reprocesses_only_unresolved_objects() {
    let h = Harness::new(located(6), LocatorMode::Ok, false);
    h.agents.fail_object("obj-1", ObjectSkippedReason::AgentBusy);
    h.agents
        .fail_object("obj-4", ObjectSkippedReason::NetworkError);

    let first = h.run(ObjectSource::Locator, test_config()).await;
    assert_eq!(h.result(&first, "complete").await, 4);

    h.agents.failures.lock().unwrap().clear();
    let retry = h.run(ObjectSource::PriorJob(first), test_config()).await;

    let record = h.jobs.get_job(&retry).await.unwrap();
    assert_eq!(record.state, JobState::Complete);
    assert_eq!(record.retry_of, Some(first));
    assert_eq!(h.locator.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.result(&retry, "total").await, 2);
    assert_eq!(h.result(&retry, "complete").await, 2);

    let mut ids: Vec<String> = h
        .objects
        .objects(&retry)
        .await
        .unwrap()
        .into_iter()
        .map(|o| o.id)
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["obj-1", "obj-4"]);
}

#[tokio::test]
async fn locator_failure_fails_the_job() {
    let h = Harness::new(located(3), LocatorMode::Fail, false);
    let job_id = h.run(ObjectSource::Locator, test_config()).await;

    let record = h.jobs.get_job(&job_id).await.unwrap();
    assert_eq!(record.state, JobState::Failed);
    let reason = record.failure_reason.unwrap();
    assert!(reason.contains("discovery"), "reason: {}", reason);
}

#[tokio::test]
async fn locator_panic_fails_the_job() {
    let h = Harness::new(located(3), LocatorMode::Panic, false);
    let job_id = h.run(ObjectSource::Locator, test_config()).await;

    let record = h.jobs.get_job(&job_id).await.unwrap();
    assert_eq!(record.state, JobState::Failed);
    let reason = record.failure_reason.unwrap();
    assert!(reason.contains("panicked"), "reason: {}", reason);
}

#[tokio::test]
async fn storinfo_failure_fails_the_job() {
    let h = Harness::new(located(3), LocatorMode::Ok, true);
    let job_id = h.run(ObjectSource::Locator, test_config()).await;

    let record = h.jobs.get_job(&job_id).await.unwrap();
    assert_eq!(record.state, JobState::Failed);
    assert!(record.failure_reason.unwrap().contains("storinfo"));
    assert_eq!(h.locator.calls.load(Ordering::SeqCst), 0);
}

async fn assert_metadata_failures(status: u16, label: &str, error: EvacuateObjectError) {
    let h = Harness::new(located(5), LocatorMode::Ok, false);
    h.catalog.fail_writes(status);

    let job_id = h.run(ObjectSource::Locator, test_config()).await;

    assert_eq!(
        h.jobs.get_job(&job_id).await.unwrap().state,
        JobState::Complete
    );
    assert_eq!(h.result(&job_id, "complete").await, 0);
    assert_eq!(h.result(&job_id, label).await, 5);

    for obj in h.objects.objects(&job_id).await.unwrap() {
        assert_eq!(obj.status, EvacuateObjectStatus::Error);
        assert_eq!(obj.error, Some(error));
        // The record still points at the old locations.
        assert_eq!(
            h.catalog.shark_ids(&obj.id),
            vec!["1.stor.domain.com", "2.stor.domain.com"]
        );
    }
}

#[tokio::test]
async fn catalog_conflicts_leave_objects_in_error() {
    assert_metadata_failures(
        409,
        "error:metadata_conflict",
        EvacuateObjectError::MetadataConflict,
    )
    .await;
}

#[tokio::test]
async fn catalog_write_errors_leave_objects_in_error() {
    assert_metadata_failures(
        500,
        "error:metadata_update_failed",
        EvacuateObjectError::MetadataUpdateFailed,
    )
    .await;
}

#[tokio::test]
async fn stalled_assignments_are_abandoned() {
    let h = Harness::new(located(4), LocatorMode::Ok, false);
    h.agents.hold.store(true, Ordering::SeqCst);
    let config = EvacuateConfig {
        max_stalled_checks: 3,
        ..test_config()
    };

    let job_id = h.run(ObjectSource::Locator, config).await;

    assert_eq!(
        h.jobs.get_job(&job_id).await.unwrap().state,
        JobState::Complete
    );
    assert_eq!(h.result(&job_id, "complete").await, 0);
    assert_eq!(h.result(&job_id, "skipped:agent_busy").await, 4);
    for obj in h.objects.objects(&job_id).await.unwrap() {
        assert_eq!(obj.status, EvacuateObjectStatus::Skipped);
    }
}

#[tokio::test]
async fn stop_ends_the_job_as_failed() {
    let h = Harness::new(located(5), LocatorMode::Ok, false);
    h.agents.hold.store(true, Ordering::SeqCst);

    let (job_id, job, handle) = h.job(ObjectSource::Locator, test_config()).await;
    let running = tokio::spawn(job.run());

    tokio::time::timeout(Duration::from_secs(5), async {
        while h.agents.post_count.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("nothing was posted");

    handle.stop();
    assert!(handle.is_stopping());
    let state = tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("job did not stop")
        .unwrap();

    assert_eq!(state, JobState::Failed);
    let record = h.jobs.get_job(&job_id).await.unwrap();
    assert_eq!(record.failure_reason.as_deref(), Some(STOPPED_REASON));
    assert_eq!(h.result(&job_id, "complete").await, 0);
}

#[tokio::test]
async fn metadata_threads_change_while_running() {
    let h = Harness::new(located(6), LocatorMode::Ok, false);
    h.agents.hold.store(true, Ordering::SeqCst);

    let (job_id, job, handle) = h.job(ObjectSource::Locator, test_config()).await;
    let running = tokio::spawn(job.run());

    tokio::time::timeout(Duration::from_secs(5), async {
        while h.agents.post_count.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("nothing was posted");

    assert!(handle.update(EvacuateJobUpdateMessage::SetMetadataThreads(2)));
    h.agents.hold.store(false, Ordering::SeqCst);

    let state = tokio::time::timeout(Duration::from_secs(10), running)
        .await
        .expect("job did not finish")
        .unwrap();
    assert_eq!(state, JobState::Complete);
    assert_eq!(h.result(&job_id, "complete").await, 6);

    // Nothing is left to take the update.
    assert!(!handle.update(EvacuateJobUpdateMessage::SetMetadataThreads(4)));
}
