//! Network visibility heuristics for newly opened drives.
//!
//! Two rules, both applied without clobbering explicit configuration:
//!
//! * A drive this node cannot write is configured lookup-only (find peers,
//!   never announce) the first time it is seen.
//! * A nested mount inherits its parent's announce/lookup settings the first
//!   time the parent exposes it.

use drivefs_core::{
    DiscoveryKey, Drive, DriveKey, DriveResult, MountEvent, NetworkConfig, NetworkConfigRequest,
};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// Background mount watcher for one drive. Stops when dropped.
#[derive(Debug)]
pub struct HeuristicsHandle {
    task: JoinHandle<()>,
}

impl HeuristicsHandle {
    pub fn abort(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for HeuristicsHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Applies the heuristics to `drive` and starts watching its mounts.
///
/// Must be called from within a tokio runtime.
pub async fn apply_heuristics(
    drive: &Arc<dyn Drive>,
    network: &Arc<dyn NetworkConfig>,
) -> DriveResult<HeuristicsHandle> {
    let dkey = drive.discovery_key();
    if !drive.writable() {
        match network.get(dkey).await? {
            None => {
                network
                    .configure(dkey, NetworkConfigRequest::lookup_only())
                    .await?;
                tracing::debug!(drive = ?drive.key(), "read-only drive configured for lookup");
            }
            Some(existing) => {
                tracing::trace!(drive = ?drive.key(), ?existing, "keeping existing network configuration");
            }
        }
    }
    Ok(watch_mounts(drive, network))
}

fn watch_mounts(drive: &Arc<dyn Drive>, network: &Arc<dyn NetworkConfig>) -> HeuristicsHandle {
    // Subscribe before listing so nothing slips between the two.
    let mut rx = drive.watch_mounts();
    let drive = Arc::clone(drive);
    let network = Arc::clone(network);
    let task = tokio::spawn(async move {
        let parent = drive.discovery_key();
        let mut seen = HashSet::new();
        inherit_existing(&*drive, &*network, parent, &mut seen).await;
        loop {
            match rx.recv().await {
                Ok(event) => inherit(&*network, parent, &event, &mut seen).await,
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(drive = ?drive.key(), missed, "mount watcher lagged, rescanning");
                    inherit_existing(&*drive, &*network, parent, &mut seen).await;
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
    HeuristicsHandle { task }
}

async fn inherit_existing(
    drive: &dyn Drive,
    network: &dyn NetworkConfig,
    parent: DiscoveryKey,
    seen: &mut HashSet<DriveKey>,
) {
    match drive.mounts().await {
        Ok(mounts) => {
            for event in &mounts {
                inherit(network, parent, event, seen).await;
            }
        }
        Err(e) => tracing::debug!(drive = ?drive.key(), error = %e, "could not list mounts"),
    }
}

async fn inherit(
    network: &dyn NetworkConfig,
    parent: DiscoveryKey,
    event: &MountEvent,
    seen: &mut HashSet<DriveKey>,
) {
    if !seen.insert(event.key) {
        return;
    }
    let child = event.key.discovery_key();
    match network
        .configure(child, NetworkConfigRequest::inherit(parent))
        .await
    {
        Ok(config) => {
            tracing::debug!(path = %event.path, child = ?event.key, ?config, "mount inherited network configuration");
        }
        Err(e) => {
            tracing::warn!(path = %event.path, child = ?event.key, error = %e, "failed to configure mounted drive");
        }
    }
}
