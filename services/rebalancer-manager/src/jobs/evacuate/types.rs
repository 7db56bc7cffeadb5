// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2020 Joyent, Inc.
// Copyright 2026 Edgecast Cloud LLC.

//! Types for evacuate job tracking

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use rebalancer_types::{ObjectSkippedReason, StorageNode, Task, TaskStatus};

use crate::locator::LocatedObject;

const MIB: u64 = 1024 * 1024;

/// Status of an object in the evacuate process
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default, Display, EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EvacuateObjectStatus {
    /// Default state - object discovered but not yet processed
    #[default]
    Unprocessed,
    /// Object has been included in an assignment
    Assigned,
    /// Not moved this time; a retry job may pick it up
    Skipped,
    /// A persistent error has occurred
    Error,
    /// Copied, catalog update pending
    PostProcessing,
    /// Object has been fully rebalanced
    Complete,
}

/// Errors that can occur during object evacuation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EvacuateObjectError {
    /// The locator record lacks an id, owner or checksum
    BadObjectRecord,
    /// Object has no locations
    MissingLocations,
    /// No storage node can take the object
    NoEligibleDestination,
    /// The agent never got the expected bytes
    ChecksumMismatch,
    /// The agent could not write the object
    AgentFsError,
    /// Metadata update failed
    MetadataUpdateFailed,
    /// Catalog record kept changing underneath the update
    MetadataConflict,
    /// Internal error occurred
    InternalError,
}

impl EvacuateObjectError {
    /// The error an agent-side failure amounts to, if it is one.
    pub fn from_agent_reason(reason: &ObjectSkippedReason) -> Option<Self> {
        match reason {
            ObjectSkippedReason::ChecksumMismatch => Some(Self::ChecksumMismatch),
            ObjectSkippedReason::AgentFSError => Some(Self::AgentFsError),
            _ => None,
        }
    }
}

/// Result counter label for a skipped object, e.g. `skipped:agent_busy`.
pub fn skipped_label(reason: &ObjectSkippedReason) -> String {
    format!("skipped:{}", reason.label())
}

/// Result counter label for a failed object, e.g. `error:checksum_mismatch`.
pub fn error_label(error: &EvacuateObjectError) -> String {
    format!("error:{}", error)
}

/// An object being evacuated from a storage node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvacuateObject {
    /// Object identifier (primary key within the job)
    pub id: String,
    pub owner: String,
    pub content_length: u64,
    /// Base64 MD5 of the content
    pub content_md5: String,
    /// Where copies live right now
    pub sharks: Vec<StorageNode>,
    /// Catalog shard holding the object's record
    pub shard: u32,

    /// Assignment this object is part of
    pub assignment_id: Option<String>,
    pub dest_shark: Option<StorageNode>,
    pub status: EvacuateObjectStatus,
    pub skipped_reason: Option<ObjectSkippedReason>,
    pub error: Option<EvacuateObjectError>,
}

impl From<LocatedObject> for EvacuateObject {
    fn from(obj: LocatedObject) -> Self {
        Self {
            id: obj.id,
            owner: obj.owner,
            content_length: obj.content_length,
            content_md5: obj.content_md5,
            sharks: obj.sharks,
            shard: obj.shard,
            assignment_id: None,
            dest_shark: None,
            status: EvacuateObjectStatus::Unprocessed,
            skipped_reason: None,
            error: None,
        }
    }
}

impl EvacuateObject {
    /// Size in whole MiB, rounded up.
    pub fn size_mb(&self) -> u64 {
        self.content_length.div_ceil(MIB)
    }

    /// Why this record cannot be moved, if it cannot.
    pub fn validate(&self) -> Result<(), EvacuateObjectError> {
        if self.id.is_empty() || self.owner.is_empty() || self.content_md5.is_empty() {
            return Err(EvacuateObjectError::BadObjectRecord);
        }
        if self.sharks.is_empty() {
            return Err(EvacuateObjectError::MissingLocations);
        }
        Ok(())
    }

    /// Forget everything a previous job learned about this object.
    pub fn reset(&mut self) {
        self.assignment_id = None;
        self.dest_shark = None;
        self.status = EvacuateObjectStatus::Unprocessed;
        self.skipped_reason = None;
        self.error = None;
    }

    /// Copy to download from: any copy other than the evacuated one,
    /// falling back to the evacuated node itself.
    pub fn source_shark(&self, from_shark: &StorageNode) -> Option<&StorageNode> {
        self.sharks
            .iter()
            .find(|s| s.manta_storage_id != from_shark.manta_storage_id)
            .or_else(|| self.sharks.first())
    }

    /// Agent task that copies this object.
    pub fn to_task(&self, source: StorageNode) -> Task {
        Task {
            object_id: self.id.clone(),
            owner: self.owner.clone(),
            md5sum: self.content_md5.clone(),
            source,
            status: TaskStatus::Pending,
        }
    }

    pub fn mark_assigned(&mut self, assignment_id: &str, dest_shark: &StorageNode) {
        self.assignment_id = Some(assignment_id.to_string());
        self.dest_shark = Some(dest_shark.clone());
        self.status = EvacuateObjectStatus::Assigned;
    }

    pub fn mark_skipped(&mut self, reason: ObjectSkippedReason) {
        self.status = EvacuateObjectStatus::Skipped;
        self.skipped_reason = Some(reason);
    }

    pub fn mark_error(&mut self, error: EvacuateObjectError) {
        self.status = EvacuateObjectStatus::Error;
        self.error = Some(error);
    }

    /// Anything a retry job should look at again.
    pub fn is_unresolved(&self) -> bool {
        self.status != EvacuateObjectStatus::Complete
    }
}
