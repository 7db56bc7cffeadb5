// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2020 Joyent, Inc.
// Copyright 2026 Edgecast Cloud LLC.

//! Shared types for the rebalancer agent and manager services.
//!
//! The agent only ever sees assignments and tasks. Job, status and update
//! types are the manager's API surface.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, VariantNames};

// ============================================================================
// Type Aliases and Constants
// ============================================================================

/// HTTP status code type
pub type HttpStatusCode = u16;

/// Object identifier (UUID string)
pub type ObjectId = String;

/// Storage node identifier (hostname)
pub type StorageId = String;

/// Assignment identifier (UUID string)
pub type AssignmentId = String;

/// Upper bound accepted for `SetMetadataThreads`.
pub const MAX_TUNABLE_MD_UPDATE_THREADS: u32 = 100;

// ============================================================================
// Agent Types
// ============================================================================

/// A reference to a storage node (shark) and the datacenter it lives in.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
pub struct StorageNode {
    /// The datacenter name where this storage node is located
    pub datacenter: String,
    /// The storage node identifier (e.g., "1.stor.domain.com")
    pub manta_storage_id: String,
}

impl StorageNode {
    pub fn new(manta_storage_id: &str, datacenter: &str) -> Self {
        StorageNode {
            datacenter: datacenter.to_string(),
            manta_storage_id: manta_storage_id.to_string(),
        }
    }
}

/// Payload for creating a new assignment on an agent.
///
/// Every task in the payload is copied onto the agent receiving it.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AssignmentPayload {
    /// Unique identifier for this assignment
    pub id: AssignmentId,
    /// Objects to copy onto the receiving node
    pub tasks: Vec<Task>,
}

impl From<AssignmentPayload> for (String, Vec<Task>) {
    fn from(p: AssignmentPayload) -> (String, Vec<Task>) {
        let AssignmentPayload { id, tasks } = p;
        (id, tasks)
    }
}

/// One object copy inside an assignment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Task {
    /// The object's unique identifier (UUID)
    pub object_id: ObjectId,
    /// The owner account identifier (UUID)
    pub owner: String,
    /// MD5 checksum of the object (base64 encoded)
    pub md5sum: String,
    /// Storage node to download from
    pub source: StorageNode,
    /// Current status of this task
    #[serde(default)]
    pub status: TaskStatus,
}

impl Task {
    pub fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
    }
}

/// Status of a task as reported by the agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "state", content = "reason")]
pub enum TaskStatus {
    #[default]
    Pending,
    Complete,
    Failed(ObjectSkippedReason),
}

/// Why a task (or a whole assignment) did not produce a copy.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
    Display,
    EnumString,
    VariantNames,
    EnumIter,
)]
#[strum(serialize_all = "snake_case")]
#[serde(tag = "type", content = "status_code")]
pub enum ObjectSkippedReason {
    /// Agent encountered a local filesystem error
    AgentFSError,
    /// The specified agent does not have that assignment
    AgentAssignmentNoEnt,
    /// The agent is busy and can't accept assignments at this time
    AgentBusy,
    /// The assignment was rejected by the agent
    AssignmentRejected,
    /// The downloaded bytes never matched the expected checksum
    ChecksumMismatch,
    /// Destination agent was not reachable
    DestinationUnreachable,
    /// Catchall for unspecified network errors
    NetworkError,
    /// Encountered some other error while contacting the source
    SourceOtherError,
    /// The source answered with a non-success HTTP status
    HTTPStatusCode(HttpStatusCode),
}

impl ObjectSkippedReason {
    /// Counter-friendly label. HTTP status codes keep their value, e.g.
    /// `http_status_code:404`.
    pub fn label(&self) -> String {
        match self {
            ObjectSkippedReason::HTTPStatusCode(sc) => format!("{}:{}", self, sc),
            _ => self.to_string(),
        }
    }

    /// Inverse of [`ObjectSkippedReason::label`].
    pub fn parse_label(label: &str) -> Result<Self, String> {
        if let Some(code) = label.strip_prefix("http_status_code:") {
            return code
                .parse::<HttpStatusCode>()
                .map(ObjectSkippedReason::HTTPStatusCode)
                .map_err(|_| format!("invalid status code in reason '{}'", label));
        }

        match ObjectSkippedReason::from_str(label) {
            Ok(ObjectSkippedReason::HTTPStatusCode(_)) | Err(_) => {
                Err(format!("unknown skipped reason '{}'", label))
            }
            Ok(reason) => Ok(reason),
        }
    }

    /// Reasons that mean the data could not be safely placed, as opposed to
    /// conditions a retry job may get past.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            ObjectSkippedReason::ChecksumMismatch | ObjectSkippedReason::AgentFSError
        )
    }

    /// Whether the agent should try the download again.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ObjectSkippedReason::HTTPStatusCode(sc) if (400..500).contains(sc))
    }
}

/// Current state of an assignment on an agent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub enum AgentAssignmentState {
    Scheduled,
    Running,
    /// Finished. Carries the failed tasks, if any.
    Complete(Option<Vec<Task>>),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AgentAssignmentStats {
    pub state: AgentAssignmentState,
    /// Number of tasks that failed
    pub failed: usize,
    /// Number of tasks with a terminal status (including failed)
    pub complete: usize,
    /// Total number of tasks in the assignment
    pub total: usize,
}

impl AgentAssignmentStats {
    pub fn new(total: usize) -> AgentAssignmentStats {
        AgentAssignmentStats {
            state: AgentAssignmentState::Scheduled,
            failed: 0,
            complete: 0,
            total,
        }
    }
}

/// Assignment status returned by `GET /assignments/{uuid}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Assignment {
    pub uuid: AssignmentId,
    pub stats: AgentAssignmentStats,
}

// ============================================================================
// Manager Types
// ============================================================================

/// Payload for creating a new job.
///
/// Jobs are created by sending a JSON object with an "action" field specifying
/// the job type and a "params" field containing action-specific parameters.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "action", content = "params")]
#[serde(rename_all = "lowercase")]
pub enum JobPayload {
    /// Evacuate all objects from a storage node
    Evacuate(EvacuateJobPayload),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct EvacuateJobPayload {
    /// The storage node to evacuate (e.g., "1.stor.domain.com")
    pub from_shark: String,
    /// Optional limit on number of objects to process
    pub max_objects: Option<u32>,
}

/// Lifecycle of a job. Transitions only ever move forward.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    JsonSchema,
    Display,
    EnumString,
    VariantNames,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    #[default]
    Init,
    Setup,
    Running,
    Complete,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Complete | JobState::Failed)
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    JsonSchema,
    Display,
    EnumString,
    VariantNames,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobAction {
    #[default]
    Evacuate,
}

/// Summary row returned by `GET /jobs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct JobDbEntry {
    pub id: String,
    pub action: JobAction,
    pub state: JobState,
    pub from_shark: String,
    pub created_at: DateTime<Utc>,
}

/// Query filter for `GET /jobs`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct JobListFilter {
    /// Only return jobs in this state
    pub state: Option<JobState>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobConfigEvacuate {
    /// The storage node being evacuated
    pub from_shark: StorageNode,
    pub max_objects: Option<u32>,
    /// Job whose unresolved objects seeded this one
    pub retry_of: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "action")]
pub enum JobStatusConfig {
    Evacuate(JobConfigEvacuate),
}

/// Counts by result label: "total", "duplicate", "complete",
/// "skipped:<reason>" and "error:<reason>".
pub type JobStatusResultsEvacuate = HashMap<String, i64>;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum JobStatusResults {
    Evacuate(JobStatusResultsEvacuate),
}

/// Full job status returned by `GET /jobs/{uuid}`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobStatus {
    pub id: String,
    pub config: JobStatusConfig,
    pub results: JobStatusResults,
    pub state: JobState,
    /// First fatal error reported by the job, when it failed
    pub failure_reason: Option<String>,
}

/// An object id seen more than once while a job enumerated its source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DuplicateObject {
    pub id: ObjectId,
    pub shard: u32,
}

/// Update message for dynamically configuring a running evacuate job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", content = "value")]
pub enum EvacuateJobUpdateMessage {
    /// Resize the metadata update worker pool
    SetMetadataThreads(u32),
}

impl EvacuateJobUpdateMessage {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            EvacuateJobUpdateMessage::SetMetadataThreads(n) => {
                if *n == 0 || *n > MAX_TUNABLE_MD_UPDATE_THREADS {
                    return Err(format!(
                        "Metadata threads must be between 1 and {}",
                        MAX_TUNABLE_MD_UPDATE_THREADS
                    ));
                }
                Ok(())
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use strum::IntoEnumIterator;

    #[test]
    fn test_task_status_serialization() {
        let json = serde_json::to_string(&TaskStatus::Pending).expect("serialize pending");
        assert_eq!(json, r#"{"state":"Pending"}"#);

        let failed = TaskStatus::Failed(ObjectSkippedReason::ChecksumMismatch);
        let json = serde_json::to_string(&failed).expect("serialize failed");
        assert_eq!(
            json,
            r#"{"state":"Failed","reason":{"type":"ChecksumMismatch"}}"#
        );

        let http = TaskStatus::Failed(ObjectSkippedReason::HTTPStatusCode(404));
        let json = serde_json::to_string(&http).expect("serialize http");
        let back: TaskStatus = serde_json::from_str(&json).expect("deserialize http");
        assert_eq!(back, http);
    }

    #[test]
    fn test_job_payload_serialization() {
        let payload = JobPayload::Evacuate(EvacuateJobPayload {
            from_shark: "1.stor.domain.com".to_string(),
            max_objects: Some(100),
        });
        let json = serde_json::to_value(&payload).expect("serialize payload");
        assert_eq!(json["action"], "evacuate");
        assert_eq!(json["params"]["from_shark"], "1.stor.domain.com");
        assert_eq!(json["params"]["max_objects"], 100);
    }

    #[test]
    fn test_job_state_display_matches_serde() {
        for (state, name) in [
            (JobState::Init, "init"),
            (JobState::Setup, "setup"),
            (JobState::Running, "running"),
            (JobState::Complete, "complete"),
            (JobState::Failed, "failed"),
        ] {
            assert_eq!(state.to_string(), name);
            assert_eq!(
                serde_json::to_value(state).expect("serialize state"),
                serde_json::Value::String(name.to_string())
            );
            assert_eq!(JobState::from_str(name), Ok(state));
        }
        assert!(JobState::Failed.is_terminal());
        assert!(!JobState::Running.is_terminal());
    }

    #[test]
    fn test_skipped_reason_labels() {
        assert_eq!(
            ObjectSkippedReason::ChecksumMismatch.label(),
            "checksum_mismatch"
        );
        assert_eq!(ObjectSkippedReason::AgentFSError.label(), "agent_fs_error");
        assert_eq!(
            ObjectSkippedReason::HTTPStatusCode(404).label(),
            "http_status_code:404"
        );

        for reason in ObjectSkippedReason::iter() {
            let reason = match reason {
                ObjectSkippedReason::HTTPStatusCode(_) => ObjectSkippedReason::HTTPStatusCode(503),
                other => other,
            };
            assert_eq!(ObjectSkippedReason::parse_label(&reason.label()), Ok(reason));
        }
    }

    #[test]
    fn test_skipped_reason_rejects_garbage() {
        assert!(ObjectSkippedReason::parse_label("md5_mismatch").is_err());
        assert!(ObjectSkippedReason::parse_label("http_status_code").is_err());
        assert!(ObjectSkippedReason::parse_label("http_status_code:abc").is_err());
    }

    #[test]
    fn test_skipped_reason_classification() {
        assert!(ObjectSkippedReason::ChecksumMismatch.is_error());
        assert!(!ObjectSkippedReason::NetworkError.is_error());
        assert!(ObjectSkippedReason::NetworkError.is_retryable());
        assert!(ObjectSkippedReason::HTTPStatusCode(503).is_retryable());
        assert!(!ObjectSkippedReason::HTTPStatusCode(404).is_retryable());
    }

    #[test]
    fn test_update_message_bounds() {
        assert!(EvacuateJobUpdateMessage::SetMetadataThreads(0).validate().is_err());
        assert!(EvacuateJobUpdateMessage::SetMetadataThreads(1).validate().is_ok());
        assert!(
            EvacuateJobUpdateMessage::SetMetadataThreads(MAX_TUNABLE_MD_UPDATE_THREADS)
                .validate()
                .is_ok()
        );
        assert!(
            EvacuateJobUpdateMessage::SetMetadataThreads(MAX_TUNABLE_MD_UPDATE_THREADS + 1)
                .validate()
                .is_err()
        );

        let json = r#"{"type":"SetMetadataThreads","value":4}"#;
        let msg: EvacuateJobUpdateMessage = serde_json::from_str(json).expect("parse update");
        assert_eq!(msg, EvacuateJobUpdateMessage::SetMetadataThreads(4));
    }
}
