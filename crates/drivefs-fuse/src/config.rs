//! Configuration: runtime tuning and the persisted service state.
//!
//! [`MountConfig`] tunes the filesystem (network directory name, attribute
//! TTL, per-call timeout, handle cache bound). [`SavedConfig`] is the small
//! JSON document that remembers which root drive was mounted where, so the
//! next start can pick up without arguments.

use crate::drive_cache::CachePolicy;
use drivefs_core::DriveKey;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Name of the virtual directory that exposes drives by key.
pub const DEFAULT_NETWORK_DIR: &str = "Network";

/// Kernel attribute cache TTL. Short, since the network listing changes as
/// drives are browsed.
pub const DEFAULT_ATTR_TTL: Duration = Duration::from_secs(1);

/// Per-call timeout; opening a remote drive can take a while.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// How long to wait for the kernel to report the mount as active.
pub const DEFAULT_MOUNT_TIMEOUT: Duration = Duration::from_secs(10);

/// File name of the persisted service state.
pub const SAVED_CONFIG_FILE: &str = "fuse.json";

/// Directory name used for the default mountpoint under `$HOME`.
pub const DEFAULT_MOUNT_DIR: &str = "Drives";

/// Runtime configuration for the routed filesystem.
#[derive(Debug, Clone)]
pub struct MountConfig {
    /// Name of the by-key directory at the mount root.
    pub network_dir: String,

    /// Time-to-live for attributes and entries handed to the kernel.
    pub attr_ttl: Duration,

    /// Maximum time a single routed call may take before it fails with
    /// ETIMEDOUT.
    pub call_timeout: Duration,

    /// Bound on cached by-key drive handles.
    pub cache_policy: CachePolicy,

    /// How long to wait for the kernel mount to come up.
    pub mount_timeout: Duration,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            network_dir: DEFAULT_NETWORK_DIR.to_string(),
            attr_ttl: DEFAULT_ATTR_TTL,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            cache_policy: CachePolicy::Unbounded,
            mount_timeout: DEFAULT_MOUNT_TIMEOUT,
        }
    }
}

impl MountConfig {
    #[must_use]
    pub fn network_dir(mut self, name: impl Into<String>) -> Self {
        self.network_dir = name.into();
        self
    }

    #[must_use]
    pub fn attr_ttl(mut self, ttl: Duration) -> Self {
        self.attr_ttl = ttl;
        self
    }

    #[must_use]
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    #[must_use]
    pub fn cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = policy;
        self
    }

    #[must_use]
    pub fn mount_timeout(mut self, timeout: Duration) -> Self {
        self.mount_timeout = timeout;
        self
    }
}

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Failed to find config directory")]
    NoConfigDir,
}

/// Persisted service state.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedConfig {
    /// Root drive mounted last time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_drive_key: Option<DriveKey>,
    /// Mountpoint used last time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mnt: Option<PathBuf>,
}

impl SavedConfig {
    /// Default location: `<platform config dir>/fuse.json`.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let dirs = directories::ProjectDirs::from("org", "drivefs", "drivefs")
            .ok_or(ConfigError::NoConfigDir)?;
        Ok(dirs.config_dir().join(SAVED_CONFIG_FILE))
    }

    /// Loads the state at `path`. A missing file is `Ok(None)`.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let config = serde_json::from_str(&contents)?;
        tracing::debug!("Loaded service config from {}", path.display());
        Ok(Some(config))
    }

    /// Writes the state to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        tracing::info!("Saved service config to {}", path.display());
        Ok(())
    }
}

/// Default mountpoint: `$HOME/Drives`.
pub fn default_mountpoint() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|dirs| dirs.home_dir().join(DEFAULT_MOUNT_DIR))
}
