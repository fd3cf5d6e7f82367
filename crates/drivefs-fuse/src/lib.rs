//! FUSE filesystem that routes calls across drives.
//!
//! One root drive is mounted at the mountpoint. Next to its own entries the
//! root lists a virtual `Network` directory; any drive can be browsed there
//! by key, without mounting it anywhere, as
//! `/Network/<hex key>[+<version>]/path/inside/drive`.
//!
//! # Features
//!
//! - Path router with regex rules, a nested router for the network directory
//!   and fallthrough to the root drive
//! - Drive handle cache with single-flight opening, so concurrent first
//!   access to a drive opens it once
//! - Network heuristics: read-only drives are looked up but never announced,
//!   nested mounts inherit their parent's visibility
//! - Persisted root key and mountpoint
//! - Kernel calls run on tokio with a per-call timeout; unmount drains them
//!
//! # Usage
//!
//! ```ignore
//! use drivefs_fuse::{DriveService, FuseBridge, ServiceOptions};
//!
//! let service = DriveService::new(store, Arc::new(FuseBridge::new()), ServiceOptions::default());
//! service.open().await?;
//! // ...
//! service.close().await?;
//! ```

pub mod async_bridge;
pub mod backend;
pub mod client;
pub mod config;
pub mod drive_cache;
pub mod error;
#[cfg(any(target_os = "linux", target_os = "macos"))]
pub mod filesystem;
pub mod handlers;
pub mod handles;
pub mod heuristics;
pub mod inode;
pub mod network;
pub mod network_set;
pub mod ops;
pub mod router;
pub mod service;
pub mod single_flight;
pub mod testing;

pub use async_bridge::{BridgeError, BridgeStats, CallBridge};
#[cfg(any(target_os = "linux", target_os = "macos"))]
pub use backend::{FuseBridge, FuseSession};
pub use backend::{BridgeSession, FilesystemBridge, force_unmount};
pub use client::{DriveInfo, SeedTarget, ServiceClient};
pub use config::{MountConfig, SavedConfig};
pub use drive_cache::{CachePolicy, DriveCache, DriveHandle, DriveOpener};
pub use error::{MountError, ResolveError, ServiceError, ToErrno};
#[cfg(any(target_os = "linux", target_os = "macos"))]
pub use filesystem::RoutedFs;
pub use handlers::{DriveHandlers, OpHandler, Owner};
pub use network::NetworkHandlers;
pub use network_set::{NETWORK_SET_CAPACITY, NetworkSet};
pub use ops::{FsCall, FsResult, OpName, OpSet, Reply};
pub use router::{RouteHandler, RouteMatch, RouteRule, Router};
pub use service::{DriveService, MountState, ServiceOptions};
pub use testing::LoopbackBridge;
