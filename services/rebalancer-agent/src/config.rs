// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2020 Joyent, Inc.
// Copyright 2026 Edgecast Cloud LLC.

//! Agent configuration

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Default data directory for agent storage
const DEFAULT_DATA_DIR: &str = "/var/tmp/rebalancer";

/// Default root under which objects are stored as `{owner}/{object_id}`
const DEFAULT_MANTA_ROOT: &str = "/manta";

const DEFAULT_CONCURRENT_DOWNLOADS: usize = 4;

/// Default HTTP timeout for downloads (seconds)
const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 300;

const DEFAULT_MAX_DOWNLOAD_ATTEMPTS: u32 = 3;

const DEFAULT_RETRY_BACKOFF_MS: u64 = 1000;

/// Suffix of in-progress downloads. Anything carrying it is never a
/// verified object.
pub const TMP_SUFFIX: &str = ".tmp";

#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// Directory holding the assignment database
    pub data_dir: PathBuf,
    /// Root of the object tree on this storage node
    pub manta_root: PathBuf,
    /// Number of concurrent download tasks
    pub concurrent_downloads: usize,
    /// HTTP timeout for downloads
    pub download_timeout_secs: u64,
    /// Attempts per task before recording a failure
    pub max_download_attempts: u32,
    /// Pause between attempts
    pub retry_backoff_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            manta_root: PathBuf::from(DEFAULT_MANTA_ROOT),
            concurrent_downloads: DEFAULT_CONCURRENT_DOWNLOADS,
            download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
            max_download_attempts: DEFAULT_MAX_DOWNLOAD_ATTEMPTS,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => match raw.parse() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(variable = name, value = %raw, "ignoring unparseable value");
                default
            }
        },
        Err(_) => default,
    }
}

impl AgentConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            data_dir: env_or("DATA_DIR", defaults.data_dir),
            manta_root: env_or("MANTA_ROOT", defaults.manta_root),
            concurrent_downloads: env_or("CONCURRENT_DOWNLOADS", defaults.concurrent_downloads)
                .max(1),
            download_timeout_secs: env_or("DOWNLOAD_TIMEOUT_SECS", defaults.download_timeout_secs),
            max_download_attempts: env_or("MAX_DOWNLOAD_ATTEMPTS", defaults.max_download_attempts)
                .max(1),
            retry_backoff_ms: env_or("RETRY_BACKOFF_MS", defaults.retry_backoff_ms),
        }
    }

    /// Get the path to the SQLite database
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("assignments.db")
    }

    /// Final location of an object on this node.
    ///
    /// `owner` and `object_id` must each pass [`is_path_component`].
    pub fn object_path(&self, owner: &str, object_id: &str) -> PathBuf {
        self.manta_root.join(owner).join(object_id)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Whether `name` is a single, plain path component that cannot lead out of
/// the directory it is joined to.
pub fn is_path_component(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}

/// `{path}.tmp`, the sibling a download is written to before verification.
pub fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(TMP_SUFFIX);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        let config = AgentConfig {
            manta_root: PathBuf::from("/manta"),
            data_dir: PathBuf::from("/var/tmp/rebalancer"),
            ..Default::default()
        };
        let path = config.object_path("owner", "object");
        assert_eq!(path, PathBuf::from("/manta/owner/object"));
        assert_eq!(tmp_path(&path), PathBuf::from("/manta/owner/object.tmp"));
        assert_eq!(
            config.db_path(),
            PathBuf::from("/var/tmp/rebalancer/assignments.db")
        );
    }

    #[test]
    fn test_path_components() {
        for good in ["owner", "0f3c-object", "a.b", "..hidden"] {
            assert!(is_path_component(good), "{}", good);
        }
        for bad in ["", ".", "..", "../etc", "a/b", "/abs", "a\\b", "nul\0"] {
            assert!(!is_path_component(bad), "{:?}", bad);
        }
    }

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.max_download_attempts, 3);
        assert_eq!(config.concurrent_downloads, 4);
        assert_eq!(config.download_timeout(), Duration::from_secs(300));
    }
}
