//! Client operations against a running root drive.
//!
//! Paths given to the client are host paths under the mountpoint, e.g.
//! `~/Drives/docs`. They are translated to paths inside the root drive before
//! anything is touched; a path outside the mountpoint is rejected.

use crate::config::SavedConfig;
use crate::error::ServiceError;
use drivefs_core::{
    DiscoveryKey, Drive, DriveError, DriveKey, DriveStore, NetworkConfigRequest,
    NetworkConfiguration,
};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// What [`ServiceClient::info`] reports about the drive owning a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveInfo {
    pub key: DriveKey,
    pub discovery_key: DiscoveryKey,
    pub writable: bool,
    /// Where the owning drive is mounted, relative to the root drive.
    /// Empty for paths owned by the root drive itself.
    pub mount_path: String,
    pub announce: bool,
    pub lookup: bool,
}

/// The drive a seed/unseed request is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeedTarget {
    /// Whichever drive owns this host path.
    Path(PathBuf),
    /// An explicit drive.
    Key(DriveKey),
}

/// Performs drive management against the root drive.
pub struct ServiceClient {
    store: Arc<dyn DriveStore>,
    key: Option<DriveKey>,
    mountpoint: Option<PathBuf>,
    config_path: Option<PathBuf>,
    root: Option<Arc<dyn Drive>>,
}

impl ServiceClient {
    pub fn new(store: Arc<dyn DriveStore>) -> Self {
        Self {
            store,
            key: None,
            mountpoint: None,
            config_path: None,
            root: None,
        }
    }

    #[must_use]
    pub fn key(mut self, key: DriveKey) -> Self {
        self.key = Some(key);
        self
    }

    #[must_use]
    pub fn mountpoint(mut self, mountpoint: impl Into<PathBuf>) -> Self {
        self.mountpoint = Some(mountpoint.into());
        self
    }

    /// Reads missing settings from this file instead of the default location.
    #[must_use]
    pub fn config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Fills in the key and mountpoint from the saved config when either is
    /// missing, then opens the root drive. Later calls do nothing.
    pub async fn ready(&mut self) -> Result<(), ServiceError> {
        if self.root.is_some() {
            return Ok(());
        }
        if self.key.is_none() || self.mountpoint.is_none() {
            let path = match &self.config_path {
                Some(p) => p.clone(),
                None => SavedConfig::default_path()?,
            };
            if let Some(saved) = SavedConfig::load(&path)? {
                self.key = self.key.or(saved.root_drive_key);
                if self.mountpoint.is_none() {
                    self.mountpoint = saved.mnt;
                }
            }
        }
        let key = self.key.ok_or(ServiceError::NoRootKey)?;
        if self.mountpoint.is_none() {
            return Err(ServiceError::NoMountpoint);
        }
        self.store.ready().await?;
        self.root = Some(self.store.open_drive(key, None).await?);
        Ok(())
    }

    fn root(&self) -> Result<&Arc<dyn Drive>, ServiceError> {
        self.root.as_ref().ok_or(ServiceError::NotMounted)
    }

    /// Translates a host path under the mountpoint into a root-drive path.
    pub fn resolve_path(&self, path: &Path) -> Result<String, ServiceError> {
        let mountpoint = self.mountpoint.as_deref().ok_or(ServiceError::NoMountpoint)?;
        let outside = || ServiceError::OutsideMount(path.display().to_string());
        let full = std::path::absolute(path).map_err(|_| outside())?;
        let rel = full.strip_prefix(mountpoint).map_err(|_| outside())?;
        let mut drive_path = String::new();
        for component in rel.components() {
            match component {
                Component::Normal(name) => {
                    drive_path.push('/');
                    drive_path.push_str(name.to_str().ok_or_else(outside)?);
                }
                Component::CurDir => {}
                _ => return Err(outside()),
            }
        }
        if drive_path.is_empty() {
            drive_path.push('/');
        }
        Ok(drive_path)
    }

    /// Mounts a drive at `path`. Without a key a new drive is created.
    pub async fn mount(
        &mut self,
        path: &Path,
        key: Option<DriveKey>,
        version: Option<u64>,
    ) -> Result<Arc<dyn Drive>, ServiceError> {
        self.ready().await?;
        let at = self.resolve_path(path)?;
        let drive = match key {
            Some(key) => self.store.open_drive(key, None).await?,
            None => self.store.create_drive().await?,
        };
        self.root()?.mount(&at, drive.key(), version).await?;
        tracing::info!(key = %drive.key(), path = %at, ?version, "drive mounted");
        Ok(drive)
    }

    /// Removes the mount at `path`.
    pub async fn unmount(&mut self, path: &Path) -> Result<(), ServiceError> {
        self.ready().await?;
        let at = self.resolve_path(path)?;
        self.root()?.unmount(&at).await?;
        tracing::info!(path = %at, "drive unmounted");
        Ok(())
    }

    /// Describes the drive that owns `path`. `None` when the path does not
    /// lead into any drive.
    pub async fn info(&mut self, path: &Path) -> Result<Option<DriveInfo>, ServiceError> {
        self.ready().await?;
        let at = self.resolve_path(path)?;
        let info = match self.root()?.path_info(&at).await {
            Ok(info) => info,
            Err(DriveError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let config = self
            .store
            .network()
            .get(info.discovery_key)
            .await?
            .unwrap_or_default();
        Ok(Some(DriveInfo {
            key: info.key,
            discovery_key: info.discovery_key,
            writable: info.writable,
            mount_path: info.mount_path,
            announce: config.announce,
            lookup: config.lookup,
        }))
    }

    /// Announces and looks up the target drive.
    pub async fn seed(
        &mut self,
        target: SeedTarget,
        remember: bool,
    ) -> Result<Option<NetworkConfiguration>, ServiceError> {
        self.configure(target, true, remember).await
    }

    /// Stops announcing and looking up the target drive.
    pub async fn unseed(
        &mut self,
        target: SeedTarget,
        remember: bool,
    ) -> Result<Option<NetworkConfiguration>, ServiceError> {
        self.configure(target, false, remember).await
    }

    async fn configure(
        &mut self,
        target: SeedTarget,
        visible: bool,
        remember: bool,
    ) -> Result<Option<NetworkConfiguration>, ServiceError> {
        let discovery_key = match target {
            SeedTarget::Key(key) => key.discovery_key(),
            SeedTarget::Path(path) => match self.info(&path).await? {
                Some(info) => info.discovery_key,
                None => {
                    return Err(DriveError::NotFound(path.display().to_string()).into());
                }
            },
        };
        let request = NetworkConfigRequest {
            announce: visible,
            lookup: visible,
            remember,
            copy_from: None,
            overwrite: true,
        };
        let config = self.store.network().configure(discovery_key, request).await?;
        tracing::info!(%discovery_key, announce = visible, lookup = visible, "network configuration updated");
        Ok(config)
    }

    /// Closes the root drive handle held by this client.
    pub async fn close(&mut self) -> Result<(), ServiceError> {
        if let Some(root) = self.root.take() {
            root.close().await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ServiceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceClient")
            .field("key", &self.key)
            .field("mountpoint", &self.mountpoint)
            .field("ready", &self.root.is_some())
            .finish_non_exhaustive()
    }
}
