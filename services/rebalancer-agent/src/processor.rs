// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2020 Joyent, Inc.
// Copyright 2026 Edgecast Cloud LLC.

//! Task processing logic
//!
//! A task's object is streamed into `{path}.tmp`, hashed on the way in, and
//! renamed over the final path only once the checksum matches. The final
//! path therefore only ever holds a verified copy.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use futures_util::StreamExt;
use md5::{Digest, Md5};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Semaphore;

use rebalancer_types::{ObjectSkippedReason, Task};

use crate::config::{AgentConfig, tmp_path};
use crate::metrics;
use crate::storage::{AssignmentState, AssignmentStorage, StorageError, TaskState};
use crate::transfer::{HttpTransfer, ObjectTransfer};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// How a task reached the complete state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOutcome {
    /// A verified copy was already in place; nothing was fetched.
    AlreadyPresent,
    /// Downloaded and verified this many bytes.
    Downloaded(u64),
}

fn encode_md5(hasher: Md5) -> String {
    base64::Engine::encode(&base64::engine::general_purpose::STANDARD, hasher.finalize())
}

/// Base64 MD5 of a file on disk, or `None` if it is not there.
pub async fn file_md5(path: &Path) -> std::io::Result<Option<String>> {
    let mut file = match File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    let mut hasher = Md5::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(Some(encode_md5(hasher)))
}

/// Downloads the objects of an assignment, bounded by a shared semaphore.
#[derive(Clone)]
pub struct TaskProcessor {
    transfer: Arc<dyn ObjectTransfer>,
    config: AgentConfig,
    storage: Arc<AssignmentStorage>,
    semaphore: Arc<Semaphore>,
}

impl TaskProcessor {
    /// Processor fetching over HTTP from the source storage nodes.
    pub fn new(config: AgentConfig, storage: Arc<AssignmentStorage>) -> Result<Self, reqwest::Error> {
        let transfer = HttpTransfer::new(config.download_timeout())?;
        Ok(Self::with_transfer(config, storage, Arc::new(transfer)))
    }

    pub fn with_transfer(
        config: AgentConfig,
        storage: Arc<AssignmentStorage>,
        transfer: Arc<dyn ObjectTransfer>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.concurrent_downloads.max(1)));
        Self {
            transfer,
            config,
            storage,
            semaphore,
        }
    }

    /// Run every unfinished task of an assignment, then mark it complete.
    ///
    /// Safe to call again for an assignment that was interrupted: tasks that
    /// already have a terminal status are not repeated. The assignment is
    /// always marked complete in the end; a task whose outcome could not be
    /// recorded is reported as failed by [`AssignmentStorage::get`].
    pub async fn process_assignment(&self, assignment_uuid: &str) {
        let started = Instant::now();

        let tasks = match self.start_assignment(assignment_uuid).await {
            Ok(tasks) => tasks,
            Err(e) => {
                tracing::error!(
                    assignment_id = %assignment_uuid,
                    error = %e,
                    "Failed to start assignment, finishing it without running tasks"
                );
                Vec::new()
            }
        };

        tracing::info!(
            assignment_id = %assignment_uuid,
            task_count = tasks.len(),
            "Starting to process assignment"
        );

        let mut handles = Vec::with_capacity(tasks.len());
        for task in tasks {
            let processor = self.clone();
            let uuid = assignment_uuid.to_string();
            let object_id = task.object_id.clone();
            let handle = tokio::spawn(async move {
                processor.process_task(&uuid, task).await;
            });
            handles.push((object_id, handle));
        }

        for (object_id, handle) in handles {
            if let Err(e) = handle.await {
                tracing::error!(
                    assignment_id = %assignment_uuid,
                    object_id = %object_id,
                    error = %e,
                    "Task aborted"
                );
                self.record_failure(assignment_uuid, &object_id, ObjectSkippedReason::AgentFSError)
                    .await;
            }
        }

        if let Err(e) = self
            .storage
            .set_state(assignment_uuid, AssignmentState::Complete)
            .await
        {
            tracing::error!(
                assignment_id = %assignment_uuid,
                error = %e,
                "Failed to set assignment state to complete"
            );
            return;
        }

        metrics::record_assignment_duration(started.elapsed().as_secs_f64());
        tracing::info!(assignment_id = %assignment_uuid, "Assignment processing complete");
    }

    async fn start_assignment(&self, assignment_uuid: &str) -> Result<Vec<Task>, StorageError> {
        self.storage
            .set_state(assignment_uuid, AssignmentState::Running)
            .await?;
        self.storage.unfinished_tasks(assignment_uuid).await
    }

    async fn process_task(&self, assignment_uuid: &str, task: Task) {
        let _permit = match self.semaphore.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                tracing::error!(error = %e, "Download semaphore closed");
                return;
            }
        };

        tracing::debug!(
            assignment_id = %assignment_uuid,
            object_id = %task.object_id,
            source = %task.source.manta_storage_id,
            "Processing task"
        );

        match self.copy_object(assignment_uuid, &task).await {
            Ok(outcome) => {
                match outcome {
                    CopyOutcome::AlreadyPresent => metrics::record_object_skipped(),
                    CopyOutcome::Downloaded(bytes) => metrics::record_object_completed(bytes),
                }
                if let Err(e) = self
                    .storage
                    .mark_task_complete(assignment_uuid, &task.object_id)
                    .await
                {
                    tracing::error!(
                        assignment_id = %assignment_uuid,
                        object_id = %task.object_id,
                        error = %e,
                        "Failed to mark task complete"
                    );
                }
            }
            Err(reason) => {
                tracing::warn!(
                    assignment_id = %assignment_uuid,
                    object_id = %task.object_id,
                    reason = %reason.label(),
                    "Task failed"
                );
                self.record_failure(assignment_uuid, &task.object_id, reason)
                    .await;
            }
        }
    }

    async fn record_failure(&self, assignment_uuid: &str, object_id: &str, reason: ObjectSkippedReason) {
        metrics::record_object_failed(&reason.label());
        if let Err(e) = self
            .storage
            .mark_task_failed(assignment_uuid, object_id, &reason)
            .await
        {
            tracing::error!(
                assignment_id = %assignment_uuid,
                object_id = %object_id,
                error = %e,
                "Failed to mark task failed"
            );
        }
    }

    /// Place a verified copy of the task's object at its final path.
    pub async fn copy_object(
        &self,
        assignment_uuid: &str,
        task: &Task,
    ) -> Result<CopyOutcome, ObjectSkippedReason> {
        let dest_path = self.config.object_path(&task.owner, &task.object_id);

        match file_md5(&dest_path).await {
            Ok(Some(existing)) if existing == task.md5sum => {
                tracing::debug!(
                    object_id = %task.object_id,
                    "Verified copy already present, skipping download"
                );
                return Ok(CopyOutcome::AlreadyPresent);
            }
            Ok(_) => {}
            Err(e) => {
                // Unreadable files are replaced by the download below.
                tracing::warn!(
                    path = %dest_path.display(),
                    error = %e,
                    "Could not checksum existing object"
                );
            }
        }

        let attempts = self.config.max_download_attempts.max(1);
        let mut last_reason = ObjectSkippedReason::AgentFSError;
        for attempt in 1..=attempts {
            match self.download_once(assignment_uuid, task, &dest_path).await {
                Ok(bytes) => return Ok(CopyOutcome::Downloaded(bytes)),
                Err(reason) => {
                    tracing::debug!(
                        object_id = %task.object_id,
                        attempt,
                        reason = %reason.label(),
                        "Download attempt failed"
                    );
                    if !reason.is_retryable() {
                        return Err(reason);
                    }
                    last_reason = reason;
                    if attempt < attempts {
                        tokio::time::sleep(self.config.retry_backoff()).await;
                    }
                }
            }
        }

        Err(last_reason)
    }

    async fn download_once(
        &self,
        assignment_uuid: &str,
        task: &Task,
        dest_path: &Path,
    ) -> Result<u64, ObjectSkippedReason> {
        if let Some(dir) = dest_path.parent() {
            fs::create_dir_all(dir).await.map_err(|e| {
                tracing::error!(
                    path = %dir.display(),
                    error = %e,
                    "Failed to create destination directory"
                );
                ObjectSkippedReason::AgentFSError
            })?;
        }

        self.progress(assignment_uuid, &task.object_id, TaskState::Downloading)
            .await;

        let tmp = tmp_path(dest_path);
        let (computed_md5, bytes) = match self.stream_to_file(task, &tmp).await {
            Ok(result) => result,
            Err(reason) => {
                discard(&tmp).await;
                return Err(reason);
            }
        };

        self.progress(assignment_uuid, &task.object_id, TaskState::Verifying)
            .await;

        if computed_md5 != task.md5sum {
            tracing::warn!(
                object_id = %task.object_id,
                expected = %task.md5sum,
                computed = %computed_md5,
                "MD5 checksum mismatch"
            );
            discard(&tmp).await;
            return Err(ObjectSkippedReason::ChecksumMismatch);
        }

        if let Err(e) = fs::rename(&tmp, dest_path).await {
            tracing::error!(
                path = %dest_path.display(),
                error = %e,
                "Failed to move verified object into place"
            );
            discard(&tmp).await;
            return Err(ObjectSkippedReason::AgentFSError);
        }

        Ok(bytes)
    }

    async fn progress(&self, assignment_uuid: &str, object_id: &str, state: TaskState) {
        if let Err(e) = self
            .storage
            .set_task_state(assignment_uuid, object_id, state)
            .await
        {
            tracing::warn!(
                assignment_id = %assignment_uuid,
                object_id = %object_id,
                state = %state,
                error = %e,
                "Failed to record task progress"
            );
        }
    }

    /// Stream the object into `path`, returning its MD5 and length.
    async fn stream_to_file(
        &self,
        task: &Task,
        path: &Path,
    ) -> Result<(String, u64), ObjectSkippedReason> {
        let fs_error = |e: std::io::Error| {
            tracing::error!(path = %path.display(), error = %e, "Failed to write object to disk");
            ObjectSkippedReason::AgentFSError
        };

        let mut stream = self.transfer.fetch(task).await.map_err(|e| e.reason())?;
        let mut file = File::create(path).await.map_err(fs_error)?;
        let mut hasher = Md5::new();
        let mut bytes = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| e.reason())?;
            hasher.update(&chunk);
            file.write_all(&chunk).await.map_err(fs_error)?;
            bytes += chunk.len() as u64;
        }

        file.flush().await.map_err(fs_error)?;
        file.sync_all().await.map_err(fs_error)?;

        Ok((encode_md5(hasher), bytes))
    }
}

/// Remove a temp file that will never be promoted.
async fn discard(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            metrics::record_cleanup_failure();
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove temp file");
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use bytes::Bytes;
    use futures_util::stream;
    use rebalancer_types::{StorageNode, TaskStatus};
    use tempfile::TempDir;

    use super::*;
    use crate::transfer::{ByteStream, TransferError};

    /// Serves fixed bytes, optionally cutting the stream short with an error.
    struct FakeTransfer {
        body: Vec<u8>,
        fail_after: Option<usize>,
        calls: AtomicUsize,
    }

    impl FakeTransfer {
        fn serving(body: &[u8]) -> Arc<Self> {
            Arc::new(Self {
                body: body.to_vec(),
                fail_after: None,
                calls: AtomicUsize::new(0),
            })
        }

        fn truncating(body: &[u8], fail_after: usize) -> Arc<Self> {
            Arc::new(Self {
                body: body.to_vec(),
                fail_after: Some(fail_after),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ObjectTransfer for FakeTransfer {
        async fn fetch(&self, _task: &Task) -> Result<ByteStream, TransferError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let chunks: Vec<Result<Bytes, TransferError>> = match self.fail_after {
                None => vec![Ok(Bytes::from(self.body.clone()))],
                Some(n) => vec![
                    Ok(Bytes::from(self.body[..n].to_vec())),
                    Err(TransferError::Network("connection reset".into())),
                ],
            };
            Ok(stream::iter(chunks).boxed())
        }
    }

    fn md5_of(content: &[u8]) -> String {
        let mut hasher = Md5::new();
        hasher.update(content);
        encode_md5(hasher)
    }

    fn task(md5sum: &str) -> Task {
        Task {
            object_id: "object-1".to_string(),
            owner: "owner-1".to_string(),
            md5sum: md5sum.to_string(),
            source: StorageNode::new("1.stor.domain.com", "dc1"),
            status: TaskStatus::Pending,
        }
    }

    async fn setup(transfer: Arc<FakeTransfer>, task: &Task) -> (TempDir, TaskProcessor) {
        let dir = TempDir::new().unwrap();
        let config = AgentConfig {
            data_dir: dir.path().to_path_buf(),
            manta_root: dir.path().join("manta"),
            retry_backoff_ms: 1,
            ..Default::default()
        };
        let storage = Arc::new(AssignmentStorage::new(&config.db_path()).unwrap());
        storage.create("assignment-1", std::slice::from_ref(task)).await.unwrap();
        let processor = TaskProcessor::with_transfer(config, storage, transfer);
        (dir, processor)
    }

    fn final_path(dir: &TempDir) -> std::path::PathBuf {
        dir.path().join("manta").join("owner-1").join("object-1")
    }

    #[tokio::test]
    async fn test_existing_verified_copy_is_not_downloaded() {
        let content = b"already here";
        let transfer = FakeTransfer::serving(content);
        let task = task(&md5_of(content));
        let (dir, processor) = setup(Arc::clone(&transfer), &task).await;

        let path = final_path(&dir);
        fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        fs::write(&path, content).await.unwrap();

        let outcome = processor.copy_object("assignment-1", &task).await;
        assert_eq!(outcome, Ok(CopyOutcome::AlreadyPresent));
        assert_eq!(transfer.calls(), 0);
    }

    #[tokio::test]
    async fn test_damaged_copy_is_replaced() {
        let content = b"the real bytes";
        let transfer = FakeTransfer::serving(content);
        let task = task(&md5_of(content));
        let (dir, processor) = setup(Arc::clone(&transfer), &task).await;

        let path = final_path(&dir);
        fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        fs::write(&path, b"bit rot").await.unwrap();

        let outcome = processor.copy_object("assignment-1", &task).await;
        assert_eq!(outcome, Ok(CopyOutcome::Downloaded(content.len() as u64)));
        assert_eq!(transfer.calls(), 1);
        assert_eq!(fs::read(&path).await.unwrap(), content);
        assert!(!fs::try_exists(tmp_path(&path)).await.unwrap());
    }

    #[tokio::test]
    async fn test_partial_write_never_reaches_final_path() {
        let content = b"0123456789abcdef";
        for cut in [0, 1, 8, content.len() - 1] {
            let transfer = FakeTransfer::truncating(content, cut);
            let task = task(&md5_of(content));
            let (dir, processor) = setup(Arc::clone(&transfer), &task).await;

            let outcome = processor.copy_object("assignment-1", &task).await;
            assert_eq!(outcome, Err(ObjectSkippedReason::NetworkError));
            assert_eq!(transfer.calls(), 3);

            let path = final_path(&dir);
            assert!(!fs::try_exists(&path).await.unwrap(), "cut at {}", cut);
            assert!(!fs::try_exists(tmp_path(&path)).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_checksum_never_matching_fails_after_three_attempts() {
        let transfer = FakeTransfer::serving(b"not what the manager expects");
        let task = task(&md5_of(b"something else entirely"));
        let (dir, processor) = setup(Arc::clone(&transfer), &task).await;

        processor.process_assignment("assignment-1").await;

        assert_eq!(transfer.calls(), 3);
        let path = final_path(&dir);
        assert!(!fs::try_exists(&path).await.unwrap());
        assert!(!fs::try_exists(tmp_path(&path)).await.unwrap());

        let assignment = processor.storage.get("assignment-1").await.unwrap();
        match assignment.stats.state {
            rebalancer_types::AgentAssignmentState::Complete(Some(failed)) => {
                assert_eq!(
                    failed[0].status,
                    TaskStatus::Failed(ObjectSkippedReason::ChecksumMismatch)
                );
            }
            other => panic!("unexpected state {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unrecorded_outcome_is_reported_as_failed() {
        let content = b"copied but never recorded";
        let transfer = FakeTransfer::serving(content);
        let task = task(&md5_of(content));
        let (_dir, processor) = setup(Arc::clone(&transfer), &task).await;

        // Terminal task updates fail, as they would on a full disk.
        processor
            .storage
            .corrupt(
                "CREATE TRIGGER refuse_terminal BEFORE UPDATE OF status ON tasks \
                 WHEN NEW.status IN ('complete', 'failed') \
                 BEGIN SELECT RAISE(ABORT, 'disk full'); END",
            )
            .await;

        processor.process_assignment("assignment-1").await;

        let assignment = processor.storage.get("assignment-1").await.unwrap();
        assert_eq!(assignment.stats.failed, 1);
        match assignment.stats.state {
            rebalancer_types::AgentAssignmentState::Complete(Some(failed)) => {
                assert_eq!(failed.len(), 1);
                assert_eq!(
                    failed[0].status,
                    TaskStatus::Failed(ObjectSkippedReason::AgentFSError)
                );
            }
            other => panic!("unexpected state {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        struct Missing(AtomicUsize);

        #[async_trait]
        impl ObjectTransfer for Missing {
            async fn fetch(&self, _task: &Task) -> Result<ByteStream, TransferError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Err(TransferError::Status(404))
            }
        }

        let dir = TempDir::new().unwrap();
        let config = AgentConfig {
            data_dir: dir.path().to_path_buf(),
            manta_root: dir.path().join("manta"),
            retry_backoff_ms: 1,
            ..Default::default()
        };
        let storage = Arc::new(AssignmentStorage::new(&config.db_path()).unwrap());
        let missing = Arc::new(Missing(AtomicUsize::new(0)));
        let processor = TaskProcessor::with_transfer(config, storage, missing.clone());

        let outcome = processor.copy_object("none", &task("x")).await;
        assert_eq!(outcome, Err(ObjectSkippedReason::HTTPStatusCode(404)));
        assert_eq!(missing.0.load(Ordering::SeqCst), 1);
    }
}
