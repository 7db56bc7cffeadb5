// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2020 Joyent, Inc.
// Copyright 2026 Edgecast Cloud LLC.

//! Configuration for the rebalancer manager

use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::sync::watch;

/// Manager configuration loaded from environment variables or JSON file
///
/// Service URLs come from the environment only. Everything else may also be
/// set in the JSON file named by `CONFIG_FILE` and reloaded with SIGUSR1;
/// running jobs keep the values they started with.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// PostgreSQL connection URL (not reloadable)
    #[serde(skip)]
    pub database_url: String,

    /// Storinfo service URL (not reloadable)
    #[serde(skip)]
    pub storinfo_url: String,

    /// Object locator service URL (not reloadable)
    #[serde(skip)]
    pub locator_url: String,

    /// Metadata catalog service URL (not reloadable)
    #[serde(skip)]
    pub catalog_url: String,

    /// Port the rebalancer agents listen on
    pub agent_port: u16,

    /// HTTP client timeout in seconds
    pub http_timeout_secs: u64,

    /// Refuse to create jobs while snaplinks still need cleaning up.
    ///
    /// Objects reachable through snaplinks share their storage, so moving
    /// them before cleanup would strand the links.
    pub snaplink_cleanup_required: bool,

    /// Datacenter names never used as destinations.
    /// From BLACKLIST_DATACENTERS (comma-separated).
    pub blacklist_datacenters: Vec<String>,

    /// Tasks per assignment before it is posted
    pub max_tasks_per_assignment: usize,

    /// Bytes per assignment before it is posted
    pub max_assignment_bytes: u64,

    /// A partially filled assignment is posted after this long
    pub max_assignment_age_secs: u64,

    /// Destinations are filled to at most this share of their capacity
    pub max_fill_percentage: u32,

    /// Initial size of the metadata update pool
    pub metadata_threads: usize,

    /// Catalog conflicts tolerated per object before giving up
    pub metadata_update_retries: u32,

    /// How often outstanding assignments are polled
    pub assignment_check_interval_ms: u64,

    /// Consecutive failed polls before an agent's assignment is abandoned
    pub max_check_failures: u32,

    /// Polls in a row that find an assignment with no newly finished task
    /// before it is abandoned
    pub max_stalled_checks: u32,

    /// Drop the evacuated node from the object's locations once the copy
    /// is in place. When false the new copy is only added.
    pub remove_source_location: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            storinfo_url: String::new(),
            locator_url: String::new(),
            catalog_url: String::new(),
            agent_port: 7878,
            http_timeout_secs: 30,
            snaplink_cleanup_required: false,
            blacklist_datacenters: Vec::new(),
            max_tasks_per_assignment: 200,
            max_assignment_bytes: 10 * 1024 * 1024 * 1024,
            max_assignment_age_secs: 300,
            max_fill_percentage: 90,
            metadata_threads: 10,
            metadata_update_retries: 5,
            assignment_check_interval_ms: 5000,
            max_check_failures: 10,
            max_stalled_checks: 720,
            remove_source_location: true,
        }
    }
}

fn required(name: &str) -> Result<String> {
    std::env::var(name).with_context(|| format!("{} environment variable required", name))
}

fn parsed_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(v) => v.parse().with_context(|| format!("Invalid {}", name)),
        Err(_) => Ok(default),
    }
}

fn flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(default)
}

impl ManagerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let blacklist_datacenters = std::env::var("BLACKLIST_DATACENTERS")
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let config = Self {
            database_url: required("DATABASE_URL")?,
            storinfo_url: required("STORINFO_URL")?,
            locator_url: required("LOCATOR_URL")?,
            catalog_url: required("CATALOG_URL")?,
            agent_port: parsed_or("AGENT_PORT", defaults.agent_port)?,
            http_timeout_secs: parsed_or("HTTP_TIMEOUT_SECS", defaults.http_timeout_secs)?,
            snaplink_cleanup_required: flag("SNAPLINK_CLEANUP_REQUIRED", false),
            blacklist_datacenters,
            max_tasks_per_assignment: parsed_or(
                "MAX_TASKS_PER_ASSIGNMENT",
                defaults.max_tasks_per_assignment,
            )?,
            max_assignment_bytes: parsed_or("MAX_ASSIGNMENT_BYTES", defaults.max_assignment_bytes)?,
            max_assignment_age_secs: parsed_or(
                "MAX_ASSIGNMENT_AGE_SECS",
                defaults.max_assignment_age_secs,
            )?,
            max_fill_percentage: parsed_or("MAX_FILL_PERCENTAGE", defaults.max_fill_percentage)?,
            metadata_threads: parsed_or("METADATA_THREADS", defaults.metadata_threads)?,
            metadata_update_retries: parsed_or(
                "METADATA_UPDATE_RETRIES",
                defaults.metadata_update_retries,
            )?,
            assignment_check_interval_ms: parsed_or(
                "ASSIGNMENT_CHECK_INTERVAL_MS",
                defaults.assignment_check_interval_ms,
            )?,
            max_check_failures: parsed_or("MAX_CHECK_FAILURES", defaults.max_check_failures)?,
            max_stalled_checks: parsed_or("MAX_STALLED_CHECKS", defaults.max_stalled_checks)?,
            remove_source_location: flag("REMOVE_SOURCE_LOCATION", true),
        };

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file
    ///
    /// Service URLs are never read from the file.
    pub async fn from_file(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_fill_percentage == 0 || self.max_fill_percentage > 100 {
            anyhow::bail!(
                "max_fill_percentage must be between 1 and 100, got {}",
                self.max_fill_percentage
            );
        }
        if self.max_stalled_checks == 0 {
            anyhow::bail!("max_stalled_checks must be positive");
        }
        if self.max_tasks_per_assignment == 0 {
            anyhow::bail!("max_tasks_per_assignment must be positive");
        }
        let max_threads = rebalancer_types::MAX_TUNABLE_MD_UPDATE_THREADS as usize;
        if self.metadata_threads == 0 || self.metadata_threads > max_threads {
            anyhow::bail!(
                "metadata_threads must be between 1 and {}, got {}",
                max_threads,
                self.metadata_threads
            );
        }
        Ok(())
    }

    /// Copy the reloadable fields from `other`, keeping service URLs.
    pub fn merge_reloadable(&mut self, other: &ManagerConfig) {
        let urls = (
            std::mem::take(&mut self.database_url),
            std::mem::take(&mut self.storinfo_url),
            std::mem::take(&mut self.locator_url),
            std::mem::take(&mut self.catalog_url),
        );
        *self = other.clone();
        (
            self.database_url,
            self.storinfo_url,
            self.locator_url,
            self.catalog_url,
        ) = urls;
    }

    /// Reload the config file on every SIGUSR1 and publish the result.
    #[cfg(unix)]
    pub async fn start_config_watcher(
        config_file: std::path::PathBuf,
        current_config: Self,
        config_tx: watch::Sender<Self>,
    ) {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigusr1 = match signal(SignalKind::user_defined1()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "Failed to register SIGUSR1 handler");
                return;
            }
        };

        let mut config = current_config;

        loop {
            sigusr1.recv().await;
            tracing::info!(
                config_file = %config_file.display(),
                "Received SIGUSR1, reloading config"
            );

            match Self::from_file(&config_file).await {
                Ok(new_config) => {
                    config.merge_reloadable(&new_config);

                    if config_tx.send(config.clone()).is_err() {
                        tracing::warn!("No config subscribers, reload had no effect");
                    } else {
                        tracing::info!(
                            blacklist = ?config.blacklist_datacenters,
                            snaplink_cleanup_required = config.snaplink_cleanup_required,
                            max_fill_percentage = config.max_fill_percentage,
                            "Config reloaded successfully"
                        );
                    }
                }
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        config_file = %config_file.display(),
                        "Failed to reload config"
                    );
                }
            }
        }
    }

    /// Return a display-safe version of the database URL (password masked)
    pub fn database_url_display(&self) -> String {
        // scheme://[user[:password]@]host[:port]/path
        let authority_start = match self.database_url.find("://") {
            Some(pos) => pos + 3,
            None => return self.database_url.clone(),
        };

        // The last '@' ends the userinfo; passwords may contain '@' too.
        let at_pos = match self.database_url[authority_start..].rfind('@') {
            Some(pos) => authority_start + pos,
            None => return self.database_url.clone(),
        };

        if let Some(relative_colon_pos) = self.database_url[authority_start..at_pos].find(':') {
            let colon_pos = authority_start + relative_colon_pos;
            let prefix = &self.database_url[..colon_pos + 1];
            let suffix = &self.database_url[at_pos..];
            return format!("{}****{}", prefix, suffix);
        }

        self.database_url.clone()
    }
}
