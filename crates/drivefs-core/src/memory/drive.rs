//! Versioned in-memory drive.

use super::tree::{Location, Tree};
use super::{Backend, Connection};
use crate::drive::{Drive, MountEvent, PathInfo};
use crate::error::{DriveError, DriveResult};
use crate::key::DriveKey;
use crate::path;
use crate::stat::Stat;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;
use tokio::sync::broadcast;

/// Capacity of the mount announcement channel.
const MOUNT_EVENT_CAPACITY: usize = 64;

/// Shared state of one drive: its full version history.
pub(crate) struct DriveState {
    key: DriveKey,
    /// `history[v]` is the tree at version `v`. Never empty.
    history: RwLock<Vec<Arc<Tree>>>,
    mounts_tx: broadcast::Sender<MountEvent>,
}

impl DriveState {
    pub(crate) fn new(key: DriveKey) -> Arc<Self> {
        let (mounts_tx, _) = broadcast::channel(MOUNT_EVENT_CAPACITY);
        Arc::new(Self {
            key,
            history: RwLock::new(vec![Arc::new(Tree::new(SystemTime::now()))]),
            mounts_tx,
        })
    }

    pub(crate) fn latest_version(&self) -> u64 {
        (self.history.read().len() as u64).saturating_sub(1)
    }

    fn snapshot(&self, version: Option<u64>) -> DriveResult<Arc<Tree>> {
        let history = self.history.read();
        let latest = (history.len() as u64).saturating_sub(1);
        let idx = version.unwrap_or(latest);
        usize::try_from(idx)
            .ok()
            .and_then(|i| history.get(i))
            .cloned()
            .ok_or(DriveError::VersionUnavailable {
                requested: idx,
                latest,
            })
    }

    /// Applies `f` to a copy of the latest tree and records it as a new version.
    fn commit<T>(&self, f: impl FnOnce(&mut Tree) -> DriveResult<T>) -> DriveResult<T> {
        let mut history = self.history.write();
        let mut next = history
            .last()
            .map_or_else(|| Tree::new(SystemTime::now()), |t| Tree::clone(t));
        let out = f(&mut next)?;
        history.push(Arc::new(next));
        Ok(out)
    }
}

/// Where a call on a [`MemoryDrive`] is serviced.
enum Route {
    Local(String, Arc<Tree>),
    Child {
        drive: MemoryDrive,
        rest: String,
        mount_path: String,
    },
}

/// Handle to a drive held by a [`MemoryStore`](super::MemoryStore).
pub struct MemoryDrive {
    state: Arc<DriveState>,
    writable: bool,
    checkout: Option<u64>,
    backend: Arc<Backend>,
    conn: Arc<Connection>,
    closed: AtomicBool,
}

impl fmt::Debug for MemoryDrive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryDrive")
            .field("key", &self.state.key)
            .field("writable", &self.writable)
            .field("checkout", &self.checkout)
            .finish_non_exhaustive()
    }
}

impl MemoryDrive {
    pub(crate) fn new(
        state: Arc<DriveState>,
        writable: bool,
        checkout: Option<u64>,
        backend: Arc<Backend>,
        conn: Arc<Connection>,
    ) -> Self {
        Self {
            state,
            // Checkouts are views of history and never writable.
            writable: writable && checkout.is_none(),
            checkout,
            backend,
            conn,
            closed: AtomicBool::new(false),
        }
    }

    fn live(&self) -> DriveResult<()> {
        if self.closed.load(Ordering::Acquire) || self.conn.is_closed() {
            return Err(DriveError::Closed);
        }
        Ok(())
    }

    fn child(&self, key: DriveKey, version: Option<u64>) -> MemoryDrive {
        let replica = self.backend.replica(key);
        MemoryDrive::new(
            replica.state,
            replica.writable,
            version,
            Arc::clone(&self.backend),
            Arc::clone(&self.conn),
        )
    }

    fn route(&self, raw: &str, through_last: bool) -> DriveResult<Route> {
        self.live()?;
        let canonical = path::normalize(raw)?;
        let tree = self.state.snapshot(self.checkout)?;
        Ok(match tree.locate(&canonical, through_last) {
            Location::Local(p) => Route::Local(p, tree),
            Location::Mounted {
                mount_path,
                key,
                version,
                rest,
            } => Route::Child {
                drive: self.child(key, version),
                rest,
                mount_path,
            },
        })
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut Tree) -> DriveResult<T>) -> DriveResult<T> {
        if !self.writable {
            return Err(DriveError::ReadOnly);
        }
        self.state.commit(f)
    }
}

#[async_trait]
impl Drive for MemoryDrive {
    fn key(&self) -> DriveKey {
        self.state.key
    }

    fn version(&self) -> u64 {
        self.checkout
            .unwrap_or_else(|| self.state.latest_version())
    }

    fn checkout(&self) -> Option<u64> {
        self.checkout
    }

    fn writable(&self) -> bool {
        self.writable
    }

    async fn stat(&self, path: &str) -> DriveResult<Stat> {
        match self.route(path, true)? {
            Route::Local(p, tree) => tree.stat(&p),
            Route::Child { drive, rest, .. } => drive.stat(&rest).await,
        }
    }

    async fn readdir(&self, path: &str) -> DriveResult<Vec<String>> {
        match self.route(path, true)? {
            Route::Local(p, tree) => tree.readdir(&p),
            Route::Child { drive, rest, .. } => drive.readdir(&rest).await,
        }
    }

    async fn read(&self, path: &str, offset: u64, len: u32) -> DriveResult<Bytes> {
        match self.route(path, true)? {
            Route::Local(p, tree) => tree.read(&p, offset, len),
            Route::Child { drive, rest, .. } => drive.read(&rest, offset, len).await,
        }
    }

    async fn write(&self, path: &str, offset: u64, data: &[u8]) -> DriveResult<u32> {
        match self.route(path, true)? {
            Route::Local(p, _) => {
                self.mutate(|t| t.write(&p, offset, data, SystemTime::now()))
            }
            Route::Child { drive, rest, .. } => drive.write(&rest, offset, data).await,
        }
    }

    async fn create(&self, path: &str, mode: u32) -> DriveResult<Stat> {
        match self.route(path, true)? {
            Route::Local(p, _) => self.mutate(|t| t.create(&p, mode, SystemTime::now())),
            Route::Child { drive, rest, .. } => drive.create(&rest, mode).await,
        }
    }

    async fn truncate(&self, path: &str, size: u64) -> DriveResult<()> {
        match self.route(path, true)? {
            Route::Local(p, _) => self.mutate(|t| t.truncate(&p, size, SystemTime::now())),
            Route::Child { drive, rest, .. } => drive.truncate(&rest, size).await,
        }
    }

    async fn unlink(&self, path: &str) -> DriveResult<()> {
        match self.route(path, true)? {
            Route::Local(p, _) => self.mutate(|t| t.unlink(&p)),
            Route::Child { drive, rest, .. } => drive.unlink(&rest).await,
        }
    }

    async fn mkdir(&self, path: &str, mode: u32) -> DriveResult<Stat> {
        match self.route(path, true)? {
            Route::Local(p, _) => self.mutate(|t| t.mkdir(&p, mode, SystemTime::now())),
            Route::Child { drive, rest, .. } => drive.mkdir(&rest, mode).await,
        }
    }

    async fn rmdir(&self, path: &str) -> DriveResult<()> {
        match self.route(path, true)? {
            Route::Local(p, _) => self.mutate(|t| t.rmdir(&p)),
            Route::Child { drive, rest, .. } => drive.rmdir(&rest).await,
        }
    }

    async fn symlink(&self, target: &str, path: &str) -> DriveResult<Stat> {
        match self.route(path, true)? {
            Route::Local(p, _) => self.mutate(|t| t.symlink(target, &p, SystemTime::now())),
            Route::Child { drive, rest, .. } => drive.symlink(target, &rest).await,
        }
    }

    async fn readlink(&self, path: &str) -> DriveResult<String> {
        match self.route(path, true)? {
            Route::Local(p, tree) => tree.readlink(&p),
            Route::Child { drive, rest, .. } => drive.readlink(&rest).await,
        }
    }

    async fn rename(&self, from: &str, to: &str) -> DriveResult<()> {
        match (self.route(from, false)?, self.route(to, false)?) {
            (Route::Local(src, _), Route::Local(dst, _)) => self.mutate(|t| t.rename(&src, &dst)),
            (
                Route::Child {
                    drive,
                    rest: src,
                    mount_path: a,
                },
                Route::Child {
                    rest: dst,
                    mount_path: b,
                    ..
                },
            ) if a == b => drive.rename(&src, &dst).await,
            _ => Err(DriveError::CrossDrive),
        }
    }

    async fn mount(&self, path: &str, key: DriveKey, version: Option<u64>) -> DriveResult<()> {
        match self.route(path, false)? {
            Route::Local(p, _) => {
                self.mutate(|t| t.mount(&p, key, version))?;
                tracing::debug!(drive = ?self.state.key, path = %p, child = ?key, "drive mounted");
                // No subscribers is fine.
                let _ = self.state.mounts_tx.send(MountEvent {
                    path: p,
                    key,
                    version,
                });
                Ok(())
            }
            Route::Child { drive, rest, .. } => drive.mount(&rest, key, version).await,
        }
    }

    async fn unmount(&self, path: &str) -> DriveResult<()> {
        match self.route(path, false)? {
            Route::Local(p, _) => self.mutate(|t| t.unmount(&p)),
            Route::Child { drive, rest, .. } => drive.unmount(&rest).await,
        }
    }

    async fn path_info(&self, path: &str) -> DriveResult<PathInfo> {
        match self.route(path, true)? {
            Route::Local(..) => Ok(PathInfo {
                key: self.state.key,
                discovery_key: self.state.key.discovery_key(),
                writable: self.writable,
                mount_path: String::new(),
            }),
            Route::Child {
                drive,
                rest,
                mount_path,
            } => {
                let mut info = drive.path_info(&rest).await?;
                info.mount_path = format!("{mount_path}{}", info.mount_path);
                Ok(info)
            }
        }
    }

    async fn mounts(&self) -> DriveResult<Vec<MountEvent>> {
        self.live()?;
        let tree = self.state.snapshot(self.checkout)?;
        Ok(tree
            .mounts()
            .into_iter()
            .map(|(path, key, version)| MountEvent { path, key, version })
            .collect())
    }

    fn watch_mounts(&self) -> broadcast::Receiver<MountEvent> {
        self.state.mounts_tx.subscribe()
    }

    async fn close(&self) -> DriveResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
