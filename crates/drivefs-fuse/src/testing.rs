//! In-process bridge for tests.
//!
//! [`LoopbackBridge`] accepts a mount like the kernel bridge would, but
//! instead of serving a device it keeps the handler so tests can issue
//! [`FsCall`]s directly. Calls made while nothing is mounted fail with
//! `ENOTCONN`, the errno a dead FUSE mount returns.

use crate::backend::{BridgeSession, FilesystemBridge};
use crate::config::MountConfig;
use crate::error::MountError;
use crate::handlers::OpHandler;
use crate::ops::{FsCall, FsResult};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::runtime::Handle;

#[derive(Default)]
struct Shared {
    active: Mutex<Option<(u64, Arc<dyn OpHandler>)>>,
    mounts: AtomicUsize,
    unavailable: AtomicBool,
}

/// A [`FilesystemBridge`] that serves calls in-process.
#[derive(Clone, Default)]
pub struct LoopbackBridge {
    shared: Arc<Shared>,
}

impl LoopbackBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes [`FilesystemBridge::is_available`] report `available`.
    pub fn set_available(&self, available: bool) {
        self.shared.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn is_mounted(&self) -> bool {
        self.shared.active.lock().is_some()
    }

    /// Number of mounts accepted so far.
    pub fn mounts(&self) -> usize {
        self.shared.mounts.load(Ordering::SeqCst)
    }

    /// Delivers `call` to the mounted handler.
    pub async fn call(&self, call: FsCall) -> FsResult {
        let handler = self.shared.active.lock().as_ref().map(|(_, h)| Arc::clone(h));
        match handler {
            Some(handler) => {
                tracing::trace!(op = %call.op(), path = call.routed_path(), "loopback call");
                handler.call(call).await
            }
            None => Err(libc::ENOTCONN),
        }
    }
}

impl std::fmt::Debug for LoopbackBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackBridge")
            .field("mounted", &self.is_mounted())
            .field("mounts", &self.mounts())
            .finish()
    }
}

impl FilesystemBridge for LoopbackBridge {
    fn name(&self) -> &'static str {
        "loopback"
    }

    fn is_available(&self) -> bool {
        !self.shared.unavailable.load(Ordering::SeqCst)
    }

    fn mount(
        &self,
        handler: Arc<dyn OpHandler>,
        mountpoint: &Path,
        _runtime: Handle,
        _config: &MountConfig,
    ) -> Result<Box<dyn BridgeSession>, MountError> {
        let mut active = self.shared.active.lock();
        if active.is_some() {
            return Err(MountError::Mount(std::io::Error::from_raw_os_error(
                libc::EBUSY,
            )));
        }
        let id = self.shared.mounts.fetch_add(1, Ordering::SeqCst) as u64 + 1;
        *active = Some((id, handler));
        tracing::debug!(mountpoint = %mountpoint.display(), id, "loopback mounted");
        Ok(Box::new(LoopbackSession {
            shared: Arc::clone(&self.shared),
            mountpoint: mountpoint.to_path_buf(),
            id,
        }))
    }
}

struct LoopbackSession {
    shared: Arc<Shared>,
    mountpoint: PathBuf,
    id: u64,
}

impl BridgeSession for LoopbackSession {
    fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    fn unmount(self: Box<Self>) -> Result<(), MountError> {
        let mut active = self.shared.active.lock();
        // Only clear our own mount.
        if active.as_ref().is_some_and(|(id, _)| *id == self.id) {
            *active = None;
            Ok(())
        } else {
            Err(MountError::Unmount(format!(
                "{} is not mounted",
                self.mountpoint.display()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::Reply;
    use async_trait::async_trait;
    use std::time::Duration;

    struct Echo;

    #[async_trait]
    impl OpHandler for Echo {
        async fn call(&self, call: FsCall) -> FsResult {
            Ok(Reply::Link(call.routed_path().to_string()))
        }
    }

    #[tokio::test]
    async fn test_calls_reach_mounted_handler() {
        let bridge = LoopbackBridge::new();
        assert_eq!(
            bridge.call(FsCall::Readlink { path: "/a".into() }).await,
            Err(libc::ENOTCONN)
        );
        let session = bridge
            .mount(
                Arc::new(Echo),
                Path::new("/mnt"),
                Handle::current(),
                &MountConfig::default().call_timeout(Duration::from_secs(1)),
            )
            .unwrap();
        assert_eq!(
            bridge.call(FsCall::Readlink { path: "/a".into() }).await,
            Ok(Reply::Link("/a".into()))
        );
        session.unmount().unwrap();
        assert!(!bridge.is_mounted());
        assert_eq!(bridge.mounts(), 1);
    }

    #[tokio::test]
    async fn test_second_mount_is_busy() {
        let bridge = LoopbackBridge::new();
        let config = MountConfig::default();
        let _session = bridge
            .mount(Arc::new(Echo), Path::new("/mnt"), Handle::current(), &config)
            .unwrap();
        let err = bridge
            .mount(Arc::new(Echo), Path::new("/mnt"), Handle::current(), &config)
            .err()
            .unwrap();
        assert!(matches!(err, MountError::Mount(_)));
    }
}
