//! Drive interfaces for drivefs.
//!
//! `drivefs-core` defines what the filesystem layer needs from a drive
//! storage engine: keyed, versioned drives with nested mounts
//! ([`Drive`]), a connection that opens them ([`DriveStore`]), and per-drive
//! network visibility settings ([`NetworkConfig`]). The [`memory`] module
//! provides a complete in-memory engine implementing all three.

pub mod drive;
pub mod error;
pub mod key;
pub mod memory;
pub mod path;
pub mod stat;

pub use drive::{
    Drive, DriveStore, MountEvent, NetworkConfig, NetworkConfigRequest, NetworkConfiguration,
    PathInfo,
};
pub use error::{DriveError, DriveResult};
pub use key::{DiscoveryKey, DriveKey, KEY_LEN, KeyError};
pub use memory::{MAX_FILE_SIZE, MemoryDrive, MemoryNetwork, MemoryStore};
pub use stat::{EntryKind, Stat};
