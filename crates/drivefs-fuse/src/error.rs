//! Error handling and errno mapping.
//!
//! Routed calls complete with `Result<Reply, c_int>`; everything that can go
//! wrong below the router is converted to a POSIX errno through [`ToErrno`].
//! Lifecycle and configuration failures use the richer enums here and never
//! cross into the call path.

use crate::async_bridge::BridgeError;
use crate::config::ConfigError;
use drivefs_core::{DriveError, KeyError};
use std::io;
use std::os::raw::c_int;
use thiserror::Error;

/// Extension trait to convert errors to errno.
pub trait ToErrno {
    /// Converts this error to a libc error code.
    fn to_errno(&self) -> c_int;
}

impl ToErrno for DriveError {
    fn to_errno(&self) -> c_int {
        match self {
            DriveError::NotFound(_)
            | DriveError::InvalidKey(_)
            | DriveError::VersionUnavailable { .. }
            // A closing handle answers like a vanished entry.
            | DriveError::Closed => libc::ENOENT,
            DriveError::NotADirectory(_) => libc::ENOTDIR,
            DriveError::IsADirectory(_) => libc::EISDIR,
            DriveError::AlreadyExists(_) => libc::EEXIST,
            DriveError::NotEmpty(_) => libc::ENOTEMPTY,
            DriveError::ReadOnly => libc::EPERM,
            DriveError::InvalidPath(_) => libc::EINVAL,
            DriveError::FileTooLarge(_) => libc::EFBIG,
            DriveError::CrossDrive => libc::EXDEV,
            DriveError::Io(e) => e.to_errno(),
        }
    }
}

impl ToErrno for io::Error {
    fn to_errno(&self) -> c_int {
        self.raw_os_error().unwrap_or(libc::EIO)
    }
}

impl ToErrno for KeyError {
    fn to_errno(&self) -> c_int {
        libc::ENOENT
    }
}

/// Failure to materialize a drive handle.
///
/// `Clone` because one failure is delivered to every caller that waited on
/// the same in-flight creation.
#[derive(Debug, Clone, Error)]
pub enum ResolveError {
    /// The store failed to open the drive.
    #[error("failed to open drive {name}: {reason}")]
    Open {
        name: String,
        reason: String,
        errno: c_int,
    },

    /// The creating task went away before finishing.
    #[error("drive creation for {0} was abandoned")]
    Abandoned(String),

    /// The cache has been shut down.
    #[error("drive cache is closed")]
    Closed,
}

impl ToErrno for ResolveError {
    fn to_errno(&self) -> c_int {
        match self {
            ResolveError::Open { errno, .. } => *errno,
            ResolveError::Abandoned(_) | ResolveError::Closed => libc::ENOENT,
        }
    }
}

/// Error from the kernel mount bridge.
#[derive(Debug, Error)]
pub enum MountError {
    #[error("filesystem bridge unavailable: {0}")]
    BridgeUnavailable(String),

    #[error("mount failed: {0}")]
    Mount(#[from] io::Error),

    #[error("unmount failed: {0}")]
    Unmount(String),
}

/// Errors from the mount lifecycle and the service client.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// No root key was given and none could be loaded.
    #[error("no root drive key configured")]
    NoRootKey,

    /// No mountpoint was given and none could be loaded.
    #[error("no mountpoint configured")]
    NoMountpoint,

    /// A client path lies outside the mountpoint.
    #[error("path {0} is not inside the mountpoint")]
    OutsideMount(String),

    #[error("service is not mounted")]
    NotMounted,

    #[error(transparent)]
    Drive(#[from] DriveError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Mount(#[from] MountError),

    #[error("routing table is invalid: {0}")]
    Routes(#[from] regex::Error),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    /// A blocking mount/unmount task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Task(String),
}

impl From<tokio::task::JoinError> for ServiceError {
    fn from(e: tokio::task::JoinError) -> Self {
        ServiceError::Task(e.to_string())
    }
}
