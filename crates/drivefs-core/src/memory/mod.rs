//! In-memory drive engine.
//!
//! Backs tests and `drivefs start`. Drives are
//! versioned trees: every mutation appends a new version and
//! `open_drive(key, Some(v))` yields a read-only checkout of version `v`.
//!
//! A [`MemoryStore`] is one connection to a shared backend. Additional
//! connections from [`MemoryStore::connect`] see the same drives and network
//! configuration, but closing one connection only invalidates the drive
//! handles it opened. Drives from another backend can be attached read-only
//! with [`MemoryStore::add_remote`], which models a drive replicated from a
//! peer: the data is live but this backend cannot write it.

mod drive;
mod network;
mod tree;

pub use drive::MemoryDrive;
pub use network::MemoryNetwork;
pub use tree::MAX_FILE_SIZE;

use crate::drive::{Drive, DriveStore, NetworkConfig};
use crate::error::{DriveError, DriveResult};
use crate::key::DriveKey;
use async_trait::async_trait;
use dashmap::DashMap;
use drive::DriveState;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A drive as known to one backend.
#[derive(Clone)]
pub(crate) struct Replica {
    state: Arc<DriveState>,
    writable: bool,
}

/// Drives and network configuration shared by all connections.
#[derive(Default)]
pub(crate) struct Backend {
    drives: DashMap<DriveKey, Replica>,
    network: Arc<MemoryNetwork>,
}

impl Backend {
    /// Looks up a drive, registering an empty read-only replica for keys
    /// this backend has never seen.
    pub(crate) fn replica(&self, key: DriveKey) -> Replica {
        self.drives
            .entry(key)
            .or_insert_with(|| Replica {
                state: DriveState::new(key),
                writable: false,
            })
            .clone()
    }
}

#[derive(Debug, Default)]
pub(crate) struct Connection {
    closed: AtomicBool,
}

impl Connection {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Connection to an in-memory drive backend.
pub struct MemoryStore {
    backend: Arc<Backend>,
    conn: Mutex<Arc<Connection>>,
}

impl MemoryStore {
    /// Creates a fresh backend and connects to it.
    pub fn new() -> Self {
        Self {
            backend: Arc::new(Backend::default()),
            conn: Mutex::new(Arc::new(Connection::default())),
        }
    }

    /// Opens another connection to the same backend.
    #[must_use]
    pub fn connect(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            conn: Mutex::new(Arc::new(Connection::default())),
        }
    }

    /// Attaches drive `key` from `peer`'s backend as a read-only replica.
    pub fn add_remote(&self, peer: &MemoryStore, key: DriveKey) -> DriveResult<()> {
        let state = peer
            .backend
            .drives
            .get(&key)
            .map(|r| Arc::clone(&r.state))
            .ok_or_else(|| DriveError::NotFound(key.to_hex()))?;
        self.backend.drives.insert(
            key,
            Replica {
                state,
                writable: false,
            },
        );
        Ok(())
    }

    /// Number of drives the backend knows about.
    pub fn drive_count(&self) -> usize {
        self.backend.drives.len()
    }

    /// The backend's network configuration, concretely typed.
    pub fn memory_network(&self) -> Arc<MemoryNetwork> {
        Arc::clone(&self.backend.network)
    }

    fn current(&self) -> DriveResult<Arc<Connection>> {
        let conn = self.conn.lock();
        if conn.is_closed() {
            return Err(DriveError::Closed);
        }
        Ok(Arc::clone(&conn))
    }

    fn handle(&self, replica: Replica, checkout: Option<u64>, conn: Arc<Connection>) -> Arc<dyn Drive> {
        Arc::new(MemoryDrive::new(
            replica.state,
            replica.writable,
            checkout,
            Arc::clone(&self.backend),
            conn,
        ))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DriveStore for MemoryStore {
    async fn ready(&self) -> DriveResult<()> {
        let mut conn = self.conn.lock();
        if conn.is_closed() {
            *conn = Arc::new(Connection::default());
            tracing::debug!("memory store reconnected");
        }
        Ok(())
    }

    async fn create_drive(&self) -> DriveResult<Arc<dyn Drive>> {
        let conn = self.current()?;
        let key = DriveKey::generate();
        let replica = Replica {
            state: DriveState::new(key),
            writable: true,
        };
        self.backend.drives.insert(key, replica.clone());
        tracing::debug!(?key, "created drive");
        Ok(self.handle(replica, None, conn))
    }

    async fn open_drive(&self, key: DriveKey, version: Option<u64>) -> DriveResult<Arc<dyn Drive>> {
        let conn = self.current()?;
        let replica = self.backend.replica(key);
        if let Some(requested) = version {
            let latest = replica.state.latest_version();
            if requested > latest {
                return Err(DriveError::VersionUnavailable { requested, latest });
            }
        }
        Ok(self.handle(replica, version, conn))
    }

    fn network(&self) -> Arc<dyn NetworkConfig> {
        self.backend.network.clone()
    }

    async fn close(&self) -> DriveResult<()> {
        self.conn.lock().closed.store(true, Ordering::Release);
        Ok(())
    }
}
