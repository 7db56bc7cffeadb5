// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2020 Joyent, Inc.
// Copyright 2026 Edgecast Cloud LLC.

//! Assignment batching for evacuate jobs

use std::time::{Duration, Instant};

use uuid::Uuid;

use rebalancer_types::{AssignmentPayload, StorageNode, Task};

use super::types::EvacuateObject;

/// State of an assignment in the evacuation process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AssignmentState {
    /// Assignment is in the process of being created
    #[default]
    Init,
    /// Assignment has been submitted to the Agent
    Assigned,
    /// Agent has rejected the Assignment
    Rejected,
    /// Could not connect to agent
    AgentUnavailable,
    /// Agent has completed its work
    AgentComplete,
    /// The Assignment has completed all necessary work
    PostProcessed,
}

/// A batch of objects bound for one destination
#[derive(Debug, Clone)]
pub struct Assignment {
    pub id: String,
    pub dest_shark: StorageNode,
    /// Objects in the order they were added
    pub objects: Vec<EvacuateObject>,
    /// One task per object, same order
    pub tasks: Vec<Task>,
    pub total_bytes: u64,
    pub state: AssignmentState,
    created: Instant,
}

impl Assignment {
    pub fn new(dest_shark: StorageNode) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            dest_shark,
            objects: Vec::new(),
            tasks: Vec::new(),
            total_bytes: 0,
            state: AssignmentState::Init,
            created: Instant::now(),
        }
    }

    /// Add an object, copied from `source`. The object is marked assigned.
    pub fn add(&mut self, mut obj: EvacuateObject, source: StorageNode) {
        obj.mark_assigned(&self.id, &self.dest_shark);
        self.total_bytes = self.total_bytes.saturating_add(obj.content_length);
        self.tasks.push(obj.to_task(source));
        self.objects.push(obj);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Whether adding `bytes` more would exceed either limit. An empty
    /// assignment always takes its first object.
    pub fn would_overflow(&self, bytes: u64, max_tasks: usize, max_bytes: u64) -> bool {
        if self.is_empty() {
            return false;
        }
        self.len() + 1 > max_tasks || self.total_bytes.saturating_add(bytes) > max_bytes
    }

    pub fn is_full(&self, max_tasks: usize, max_bytes: u64) -> bool {
        self.len() >= max_tasks || self.total_bytes >= max_bytes
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// Convert to assignment payload for posting to agent
    pub fn to_payload(&self) -> AssignmentPayload {
        AssignmentPayload {
            id: self.id.clone(),
            tasks: self.tasks.clone(),
        }
    }
}
