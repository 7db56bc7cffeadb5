// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Destination selection
//!
//! The cache is built from one storinfo poll when the job starts and is
//! owned by the selection stage for the rest of the run. Every placement
//! debits the chosen node so later choices see what this job has already
//! committed to it.

use std::collections::{BTreeMap, HashSet};

use rebalancer_types::StorageNode;

use super::types::EvacuateObject;
use crate::storinfo::StorageNodeInfo;

/// Whether a destination has an assignment out with its agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestStatus {
    Ready,
    Assigned,
}

#[derive(Debug, Clone)]
pub struct DestinationShark {
    pub node: StorageNode,
    pub available_mb: u64,
    pub percent_used: f64,
    /// Committed to this node by the current job
    pub assigned_mb: u64,
    pub status: DestStatus,
}

/// Space this job may still use on a node.
///
/// The node's total size is inferred from what it reports free and the
/// share in use. It may be filled to `max_fill_percentage` of that total,
/// less what is already used and what this job has assigned to it.
pub fn calculate_available_mb(shark: &DestinationShark, max_fill_percentage: u32) -> u64 {
    let percent_used = shark.percent_used.round().clamp(0.0, 100.0) as u64;
    if percent_used >= 100 || shark.available_mb == 0 {
        return 0;
    }

    let total_mb = shark.available_mb * 100 / (100 - percent_used);
    let max_fill_mb = total_mb * u64::from(max_fill_percentage) / 100;
    let used_mb = total_mb - shark.available_mb;

    max_fill_mb
        .saturating_sub(used_mb)
        .saturating_sub(shark.assigned_mb)
}

pub struct DestinationCache {
    // Ordered by storage id, which decides ties.
    sharks: BTreeMap<String, DestinationShark>,
    max_fill_percentage: u32,
}

impl DestinationCache {
    /// Build the cache, leaving out the evacuated node and blacklisted
    /// datacenters.
    pub fn new(
        nodes: Vec<StorageNodeInfo>,
        from_shark: &StorageNode,
        blacklist_datacenters: &[String],
        max_fill_percentage: u32,
    ) -> Self {
        let blacklist: HashSet<&str> = blacklist_datacenters.iter().map(String::as_str).collect();

        let sharks = nodes
            .into_iter()
            .filter(|info| info.node.manta_storage_id != from_shark.manta_storage_id)
            .filter(|info| !blacklist.contains(info.node.datacenter.as_str()))
            .map(|info| {
                (
                    info.node.manta_storage_id.clone(),
                    DestinationShark {
                        node: info.node,
                        available_mb: info.available_mb,
                        percent_used: info.percent_used,
                        assigned_mb: 0,
                        status: DestStatus::Ready,
                    },
                )
            })
            .collect();

        Self {
            sharks,
            max_fill_percentage,
        }
    }

    pub fn len(&self) -> usize {
        self.sharks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sharks.is_empty()
    }

    pub fn get(&self, storage_id: &str) -> Option<&DestinationShark> {
        self.sharks.get(storage_id)
    }

    pub fn remaining_mb(&self, storage_id: &str) -> Option<u64> {
        self.sharks
            .get(storage_id)
            .map(|s| calculate_available_mb(s, self.max_fill_percentage))
    }

    /// Pick the destination for `obj` among the nodes `eligible` allows.
    ///
    /// Nodes holding a copy, and every node in a datacenter that holds a
    /// copy, are never chosen. Of the rest, the one with the most room left
    /// wins; on a tie the lowest storage id.
    pub fn select<F>(
        &self,
        obj: &EvacuateObject,
        from_shark: &StorageNode,
        eligible: F,
    ) -> Option<&StorageNode>
    where
        F: Fn(&str) -> bool,
    {
        let size_mb = obj.size_mb();
        let holders: HashSet<&str> = obj
            .sharks
            .iter()
            .map(|s| s.manta_storage_id.as_str())
            .chain(std::iter::once(from_shark.manta_storage_id.as_str()))
            .collect();
        let datacenters: HashSet<&str> = obj
            .sharks
            .iter()
            .map(|s| s.datacenter.as_str())
            .chain(std::iter::once(from_shark.datacenter.as_str()))
            .collect();

        let mut best: Option<(&DestinationShark, u64)> = None;
        for (id, shark) in &self.sharks {
            if holders.contains(id.as_str())
                || datacenters.contains(shark.node.datacenter.as_str())
                || !eligible(id)
            {
                continue;
            }

            let remaining = calculate_available_mb(shark, self.max_fill_percentage);
            if remaining < size_mb {
                continue;
            }

            match best {
                Some((_, best_remaining)) if remaining <= best_remaining => {}
                _ => best = Some((shark, remaining)),
            }
        }

        best.map(|(shark, _)| &shark.node)
    }

    /// Commit `size_mb` of a node's space to this job.
    pub fn debit(&mut self, storage_id: &str, size_mb: u64) {
        if let Some(shark) = self.sharks.get_mut(storage_id) {
            shark.assigned_mb = shark.assigned_mb.saturating_add(size_mb);
        }
    }

    pub fn status(&self, storage_id: &str) -> Option<DestStatus> {
        self.sharks.get(storage_id).map(|s| s.status)
    }

    pub fn set_status(&mut self, storage_id: &str, status: DestStatus) {
        if let Some(shark) = self.sharks.get_mut(storage_id) {
            shark.status = status;
        }
    }
}
