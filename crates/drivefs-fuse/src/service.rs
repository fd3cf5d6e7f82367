//! Mount lifecycle.
//!
//! [`DriveService`] owns the root drive for as long as it is mounted. Opening
//! connects to the store, resolves the root key and mountpoint (explicit
//! options first, then the saved config), opens the root drive with network
//! heuristics attached, builds the routed handler chain and registers it with
//! the kernel bridge. Closing undoes the same steps in reverse, draining
//! outstanding kernel calls before any drive is released.

use crate::backend::{BridgeSession, FilesystemBridge};
use crate::config::{MountConfig, SavedConfig, default_mountpoint};
use crate::drive_cache::{DriveHandle, DriveOpener};
use crate::error::ServiceError;
use crate::handlers::{DriveHandlers, OpHandler, Owner};
use crate::heuristics::{HeuristicsHandle, apply_heuristics};
use crate::network::NetworkHandlers;
use async_trait::async_trait;
use drivefs_core::{Drive, DriveKey, DriveResult, DriveStore, NetworkConfig};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Mutex;

/// How long close waits for outstanding kernel calls.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Options for [`DriveService`].
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    /// Root drive key. Loaded from the saved config when absent.
    pub key: Option<DriveKey>,
    /// Where to mount. Loaded from the saved config, then `$HOME/Drives`.
    pub mountpoint: Option<PathBuf>,
    /// Load and save [`SavedConfig`].
    pub remember: bool,
    /// Open the root drive without registering a kernel mount.
    pub disable_fuse: bool,
    /// Saved config location. Defaults to [`SavedConfig::default_path`].
    pub config_path: Option<PathBuf>,
    pub mount: MountConfig,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            key: None,
            mountpoint: None,
            remember: true,
            disable_fuse: false,
            config_path: None,
            mount: MountConfig::default(),
        }
    }
}

impl ServiceOptions {
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

    #[must_use]
    pub fn remember(mut self, remember: bool) -> Self {
        self.remember = remember;
        self
    }

    #[must_use]
    pub fn disable_fuse(mut self, disable: bool) -> Self {
        self.disable_fuse = disable;
        self
    }

    #[must_use]
    pub fn config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn mount_config(mut self, config: MountConfig) -> Self {
        self.mount = config;
        self
    }
}

/// Where the service is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountState {
    Unmounted,
    Opening,
    Mounted,
    Closing,
}

/// Opens by-key drives through the store, with heuristics attached.
struct HeuristicOpener {
    store: Arc<dyn DriveStore>,
    network: Arc<dyn NetworkConfig>,
    owner: Owner,
}

#[async_trait]
impl DriveOpener for HeuristicOpener {
    async fn open(&self, key: DriveKey, version: Option<u64>) -> DriveResult<DriveHandle> {
        let drive = self.store.open_drive(key, version).await?;
        let watcher = match apply_heuristics(&drive, &self.network).await {
            Ok(w) => w,
            Err(e) => {
                let _ = drive.close().await;
                return Err(e);
            }
        };
        Ok(DriveHandle::new(key, version, drive, self.owner).with_watcher(watcher))
    }
}

/// Everything that exists only while mounted.
struct Mounted {
    key: DriveKey,
    mountpoint: PathBuf,
    root: Arc<dyn Drive>,
    _watcher: HeuristicsHandle,
    network: Arc<NetworkHandlers>,
    session: Option<Box<dyn BridgeSession>>,
}

#[derive(Default)]
struct Inner {
    key: Option<DriveKey>,
    mountpoint: Option<PathBuf>,
    mounted: Option<Mounted>,
    connected: bool,
}

/// The mount lifecycle manager.
pub struct DriveService {
    store: Arc<dyn DriveStore>,
    bridge: Arc<dyn FilesystemBridge>,
    remember: bool,
    disable_fuse: bool,
    config_path: Option<PathBuf>,
    mount: MountConfig,
    owner: Owner,
    state: RwLock<MountState>,
    inner: Mutex<Inner>,
}

impl DriveService {
    pub fn new(
        store: Arc<dyn DriveStore>,
        bridge: Arc<dyn FilesystemBridge>,
        options: ServiceOptions,
    ) -> Self {
        Self {
            store,
            bridge,
            remember: options.remember,
            disable_fuse: options.disable_fuse,
            config_path: options.config_path,
            mount: options.mount,
            owner: Owner::current(),
            state: RwLock::new(MountState::Unmounted),
            inner: Mutex::new(Inner {
                key: options.key,
                mountpoint: options.mountpoint,
                ..Inner::default()
            }),
        }
    }

    pub fn state(&self) -> MountState {
        *self.state.read()
    }

    fn set_state(&self, state: MountState) {
        *self.state.write() = state;
    }

    fn config_path(&self) -> Result<PathBuf, ServiceError> {
        match &self.config_path {
            Some(p) => Ok(p.clone()),
            None => Ok(SavedConfig::default_path()?),
        }
    }

    /// Opens and mounts. Mounting again first unmounts the current mount.
    pub async fn open(&self) -> Result<(), ServiceError> {
        let mut inner = self.inner.lock().await;
        self.set_state(MountState::Opening);
        match self.open_locked(&mut inner).await {
            Ok(()) => {
                self.set_state(MountState::Mounted);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "mount failed");
                self.set_state(MountState::Unmounted);
                Err(e)
            }
        }
    }

    /// Unmounts, then mounts again with the same key and mountpoint.
    pub async fn remount(&self) -> Result<(), ServiceError> {
        self.open().await
    }

    async fn open_locked(&self, inner: &mut Inner) -> Result<(), ServiceError> {
        self.store.ready().await?;
        inner.connected = true;

        if self.remember
            && (inner.key.is_none() || inner.mountpoint.is_none())
            && let Some(saved) = SavedConfig::load(&self.config_path()?)?
        {
            inner.key = inner.key.or(saved.root_drive_key);
            if inner.mountpoint.is_none() {
                inner.mountpoint = saved.mnt;
            }
        }
        let key = inner.key.ok_or(ServiceError::NoRootKey)?;
        let mountpoint = inner
            .mountpoint
            .clone()
            .or_else(default_mountpoint)
            .ok_or(ServiceError::NoMountpoint)?;
        inner.mountpoint = Some(mountpoint.clone());

        if inner.mounted.is_some() {
            self.unmount_locked(inner).await?;
        }

        let network_config = self.store.network();
        let root = self.store.open_drive(key, None).await?;
        let watcher = match apply_heuristics(&root, &network_config).await {
            Ok(w) => w,
            Err(e) => {
                let _ = root.close().await;
                return Err(e.into());
            }
        };

        let base = Arc::new(DriveHandlers::new(Arc::clone(&root), self.owner));
        let opener = Arc::new(HeuristicOpener {
            store: Arc::clone(&self.store),
            network: network_config,
            owner: self.owner,
        });
        let network = match NetworkHandlers::new(
            base,
            opener,
            &self.mount.network_dir,
            self.mount.cache_policy,
            self.owner,
        ) {
            Ok(n) => Arc::new(n),
            Err(e) => {
                let _ = root.close().await;
                return Err(e.into());
            }
        };

        let session = if self.disable_fuse {
            tracing::info!("kernel mount disabled, serving the root drive only");
            None
        } else if !self.bridge.is_available() {
            tracing::warn!(
                bridge = self.bridge.name(),
                "filesystem bridge is not available, serving the root drive without a kernel mount"
            );
            None
        } else {
            match self.mount_bridge(network.root_handler(), &mountpoint).await {
                Ok(s) => Some(s),
                Err(e) => {
                    network.close().await;
                    let _ = root.close().await;
                    return Err(e);
                }
            }
        };
        let kernel_mounted = session.is_some();
        inner.mounted = Some(Mounted {
            key,
            mountpoint: mountpoint.clone(),
            root,
            _watcher: watcher,
            network,
            session,
        });

        if self.remember
            && let Err(e) = self.save_config(key, &mountpoint)
        {
            if let Err(unmount) = self.unmount_locked(inner).await {
                tracing::warn!(error = %unmount, "teardown after failed config save");
            }
            return Err(e);
        }

        tracing::info!(
            key = %key,
            mountpoint = %mountpoint.display(),
            bridge = self.bridge.name(),
            kernel_mounted,
            "root drive mounted"
        );
        Ok(())
    }

    fn save_config(&self, key: DriveKey, mountpoint: &Path) -> Result<(), ServiceError> {
        let saved = SavedConfig {
            root_drive_key: Some(key),
            mnt: Some(mountpoint.to_path_buf()),
        };
        saved.save(&self.config_path()?)?;
        Ok(())
    }

    async fn mount_bridge(
        &self,
        handler: Arc<dyn OpHandler>,
        mountpoint: &Path,
    ) -> Result<Box<dyn BridgeSession>, ServiceError> {
        let bridge = Arc::clone(&self.bridge);
        let mountpoint = mountpoint.to_path_buf();
        let config = self.mount.clone();
        let runtime = Handle::current();
        let session = tokio::task::spawn_blocking(move || {
            bridge.mount(handler, &mountpoint, runtime, &config)
        })
        .await??;
        Ok(session)
    }

    /// Tears down the current mount. The root drive is closed only after the
    /// kernel session is gone and its calls have drained.
    async fn unmount_locked(&self, inner: &mut Inner) -> Result<(), ServiceError> {
        let Some(mounted) = inner.mounted.take() else {
            return Ok(());
        };
        let mut result: Result<(), ServiceError> = Ok(());
        if let Some(session) = mounted.session {
            let calls = session.calls();
            match tokio::task::spawn_blocking(move || session.unmount()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "unmount reported an error");
                    result = Err(e.into());
                }
                Err(e) => result = Err(e.into()),
            }
            if let Some(calls) = calls {
                let left = calls.drain(DRAIN_TIMEOUT).await;
                if left > 0 {
                    tracing::warn!(left, "closing drives with calls still in flight");
                }
            }
        }
        mounted.network.close().await;
        if let Err(e) = mounted.root.close().await {
            tracing::warn!(error = %e, "root drive did not close cleanly");
        }
        tracing::info!(
            key = %mounted.key,
            mountpoint = %mounted.mountpoint.display(),
            "root drive unmounted"
        );
        result
    }

    /// Unmounts and disconnects. Closing an unmounted service does nothing.
    pub async fn close(&self) -> Result<(), ServiceError> {
        let mut inner = self.inner.lock().await;
        if inner.mounted.is_none() && !inner.connected {
            return Ok(());
        }
        self.set_state(MountState::Closing);
        let unmounted = self.unmount_locked(&mut inner).await;
        inner.connected = false;
        let closed = self.store.close().await;
        self.set_state(MountState::Unmounted);
        unmounted?;
        closed?;
        Ok(())
    }

    pub fn store(&self) -> &Arc<dyn DriveStore> {
        &self.store
    }

    /// The root drive, while mounted.
    pub async fn root_drive(&self) -> Option<Arc<dyn Drive>> {
        let inner = self.inner.lock().await;
        inner.mounted.as_ref().map(|m| Arc::clone(&m.root))
    }

    /// The routed handler chain, while mounted.
    pub async fn handler(&self) -> Option<Arc<dyn OpHandler>> {
        let inner = self.inner.lock().await;
        inner.mounted.as_ref().map(|m| m.network.root_handler())
    }

    /// The network directory layer, while mounted.
    pub async fn network(&self) -> Option<Arc<NetworkHandlers>> {
        let inner = self.inner.lock().await;
        inner.mounted.as_ref().map(|m| Arc::clone(&m.network))
    }

    /// The resolved root key, once known.
    pub async fn key(&self) -> Option<DriveKey> {
        self.inner.lock().await.key
    }

    /// The resolved mountpoint, once known.
    pub async fn mountpoint(&self) -> Option<PathBuf> {
        self.inner.lock().await.mountpoint.clone()
    }
}

impl std::fmt::Debug for DriveService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriveService")
            .field("bridge", &self.bridge.name())
            .field("state", &self.state())
            .field("disable_fuse", &self.disable_fuse)
            .finish_non_exhaustive()
    }
}
