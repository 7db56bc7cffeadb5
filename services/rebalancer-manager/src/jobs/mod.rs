// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2020 Joyent, Inc.
// Copyright 2026 Edgecast Cloud LLC.

//! Job execution for the rebalancer manager
//!
//! Evacuate is the only job type. A job runs as a set of async stages
//! connected by channels; [`Services`] bundles the collaborators every
//! stage may reach.

pub mod evacuate;

use std::sync::Arc;

use thiserror::Error;

use crate::catalog::Catalog;
use crate::db::{JobStore, StoreError};
use crate::locator::{Locator, LocatorError};
use crate::storinfo::{Storinfo, StorinfoError};
use evacuate::agent::AgentClient;
use evacuate::db::ObjectStore;

/// Errors that end a job
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Storinfo error: {0}")]
    Storinfo(#[from] StorinfoError),

    #[error("Locator error: {0}")]
    Locator(#[from] LocatorError),

    #[error("{0} channel closed unexpectedly")]
    ChannelClosed(&'static str),

    #[error("{stage} task panicked: {message}")]
    Panicked { stage: &'static str, message: String },

    #[error("{0} metadata update task(s) panicked")]
    MetadataPanics(u64),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Everything a running job talks to
#[derive(Clone)]
pub struct Services {
    pub jobs: Arc<dyn JobStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub storinfo: Arc<dyn Storinfo>,
    pub locator: Arc<dyn Locator>,
    pub catalog: Arc<dyn Catalog>,
    pub agents: Arc<dyn AgentClient>,
}
