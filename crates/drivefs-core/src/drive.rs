//! Collaborator interfaces: drives, stores and network configuration.
//!
//! The filesystem layer only ever talks to these traits. A store hands out
//! [`Drive`] handles by key; each drive is a versioned tree that may contain
//! nested mounts of other drives. Network visibility (announce/lookup) is
//! configured per discovery key through [`NetworkConfig`].

use crate::error::DriveResult;
use crate::key::{DiscoveryKey, DriveKey};
use crate::stat::Stat;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Announced when a drive gains a nested mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEvent {
    /// Path of the mountpoint inside the parent drive.
    pub path: String,
    /// Key of the mounted child drive.
    pub key: DriveKey,
    /// Pinned version of the child, if any.
    pub version: Option<u64>,
}

/// Which drive owns a path, as seen from some outer drive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathInfo {
    pub key: DriveKey,
    pub discovery_key: DiscoveryKey,
    pub writable: bool,
    /// Path of the owning drive's mountpoint inside the outer drive.
    /// Empty when the outer drive owns the path itself.
    pub mount_path: String,
}

/// A versioned drive tree.
///
/// Paths are drive-relative and `/`-separated. Implementations follow nested
/// mounts transparently, so `stat("/docs/a.txt")` on a drive with a child
/// mounted at `/docs` answers from the child.
#[async_trait]
pub trait Drive: Send + Sync + fmt::Debug {
    fn key(&self) -> DriveKey;

    fn discovery_key(&self) -> DiscoveryKey {
        self.key().discovery_key()
    }

    /// Latest version visible through this handle.
    fn version(&self) -> u64;

    /// The pinned version if this handle is a checkout.
    fn checkout(&self) -> Option<u64>;

    /// Whether writes through this handle can succeed.
    fn writable(&self) -> bool;

    async fn stat(&self, path: &str) -> DriveResult<Stat>;

    /// Names of the entries in a directory, in a stable order.
    async fn readdir(&self, path: &str) -> DriveResult<Vec<String>>;

    /// Reads up to `len` bytes at `offset`. Short reads happen only at EOF.
    async fn read(&self, path: &str, offset: u64, len: u32) -> DriveResult<Bytes>;

    /// Writes `data` at `offset`, extending the file as needed.
    async fn write(&self, path: &str, offset: u64, data: &[u8]) -> DriveResult<u32>;

    /// Creates an empty file. Fails if the entry exists.
    async fn create(&self, path: &str, mode: u32) -> DriveResult<Stat>;

    async fn truncate(&self, path: &str, size: u64) -> DriveResult<()>;

    async fn unlink(&self, path: &str) -> DriveResult<()>;

    async fn mkdir(&self, path: &str, mode: u32) -> DriveResult<Stat>;

    async fn rmdir(&self, path: &str) -> DriveResult<()>;

    async fn symlink(&self, target: &str, path: &str) -> DriveResult<Stat>;

    async fn readlink(&self, path: &str) -> DriveResult<String>;

    async fn rename(&self, from: &str, to: &str) -> DriveResult<()>;

    /// Mounts drive `key` (optionally pinned to `version`) at `path`.
    async fn mount(&self, path: &str, key: DriveKey, version: Option<u64>) -> DriveResult<()>;

    /// Removes the mount at `path`. The child drive itself is untouched.
    async fn unmount(&self, path: &str) -> DriveResult<()>;

    /// Reports which drive owns `path`.
    async fn path_info(&self, path: &str) -> DriveResult<PathInfo>;

    /// Mounts that exist directly in this drive (not in its children).
    async fn mounts(&self) -> DriveResult<Vec<MountEvent>>;

    /// Subscribes to nested mount announcements.
    ///
    /// Only mounts added after subscribing are delivered; pair with
    /// [`Drive::mounts`] to see the ones that already exist.
    fn watch_mounts(&self) -> broadcast::Receiver<MountEvent>;

    /// Releases the handle. Later calls fail with `DriveError::Closed`.
    async fn close(&self) -> DriveResult<()>;

    /// Reads a whole file.
    async fn read_file(&self, path: &str) -> DriveResult<Bytes> {
        let stat = self.stat(path).await?;
        let len = u32::try_from(stat.size).unwrap_or(u32::MAX);
        self.read(path, 0, len).await
    }

    /// Creates or replaces a file with `data`.
    async fn write_file(&self, path: &str, data: &[u8]) -> DriveResult<()> {
        match self.create(path, crate::stat::DEFAULT_FILE_MODE).await {
            Ok(_) => {}
            Err(crate::DriveError::AlreadyExists(_)) => self.truncate(path, 0).await?,
            Err(e) => return Err(e),
        }
        self.write(path, 0, data).await?;
        Ok(())
    }
}

/// Network visibility settings for one drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetworkConfiguration {
    /// Advertise the drive to peers.
    pub announce: bool,
    /// Look for peers that have the drive.
    pub lookup: bool,
    /// Persist the configuration across restarts.
    pub remember: bool,
}

/// A request to change a drive's network configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetworkConfigRequest {
    pub announce: bool,
    pub lookup: bool,
    pub remember: bool,
    /// Copy announce/lookup from this drive instead of using the fields above.
    pub copy_from: Option<DiscoveryKey>,
    /// Replace an existing configuration. When false, an existing entry wins.
    pub overwrite: bool,
}

impl NetworkConfigRequest {
    /// Lookup-only, not remembered.
    pub fn lookup_only() -> Self {
        Self {
            lookup: true,
            ..Self::default()
        }
    }

    /// Copy the configuration of `parent` without overwriting.
    pub fn inherit(parent: DiscoveryKey) -> Self {
        Self {
            copy_from: Some(parent),
            ..Self::default()
        }
    }
}

/// Per-drive network configuration registry.
#[async_trait]
pub trait NetworkConfig: Send + Sync {
    async fn get(&self, discovery_key: DiscoveryKey) -> DriveResult<Option<NetworkConfiguration>>;

    /// Applies `request` and returns the configuration now in effect, or
    /// `None` when a `copy_from` source had nothing to copy.
    async fn configure(
        &self,
        discovery_key: DiscoveryKey,
        request: NetworkConfigRequest,
    ) -> DriveResult<Option<NetworkConfiguration>>;
}

/// Connection to the drive storage engine.
#[async_trait]
pub trait DriveStore: Send + Sync {
    /// Connects, or reconnects after [`DriveStore::close`].
    async fn ready(&self) -> DriveResult<()>;

    /// Creates a new writable drive owned by this store.
    async fn create_drive(&self) -> DriveResult<Arc<dyn Drive>>;

    /// Opens drive `key`, optionally as a checkout of `version`.
    async fn open_drive(&self, key: DriveKey, version: Option<u64>) -> DriveResult<Arc<dyn Drive>>;

    fn network(&self) -> Arc<dyn NetworkConfig>;

    /// Disconnects. Drives opened through this connection stop working.
    async fn close(&self) -> DriveResult<()>;
}
