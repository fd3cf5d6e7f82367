//! Errors reported by drives and stores.

use crate::key::KeyError;
use std::io;
use thiserror::Error;

/// Failure of a drive or store operation.
///
/// Variants carry the drive-relative path where one is meaningful so that
/// logs can name the entry without extra context.
#[derive(Debug, Error)]
pub enum DriveError {
    #[error("no such entry: {0}")]
    NotFound(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("directory not empty: {0}")]
    NotEmpty(String),

    /// Mutation attempted on a drive (or checkout) that is not writable.
    #[error("drive is read-only")]
    ReadOnly,

    /// A write or truncate would grow the file past what the drive can hold.
    #[error("file too large: {0}")]
    FileTooLarge(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error(transparent)]
    InvalidKey(#[from] KeyError),

    /// A checkout asked for a version the drive does not have.
    #[error("version {requested} is not available (latest is {latest})")]
    VersionUnavailable { requested: u64, latest: u64 },

    /// Rename across a mount boundary.
    #[error("cannot move entries across drives")]
    CrossDrive,

    /// The drive or store connection has been closed.
    #[error("drive is closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl DriveError {
    /// True for errors that mean "nothing is there", as opposed to a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, DriveError::NotFound(_))
    }
}

/// Result type for drive operations.
pub type DriveResult<T> = Result<T, DriveError>;
