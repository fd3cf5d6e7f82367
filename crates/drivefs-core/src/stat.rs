//! Entry metadata returned by drives.

use std::time::SystemTime;

/// Default permission bits for files.
pub const DEFAULT_FILE_MODE: u32 = 0o644;

/// Default permission bits for directories.
pub const DEFAULT_DIR_MODE: u32 = 0o755;

/// Kind of a drive entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

/// Metadata for a single drive entry.
///
/// `mode` holds permission bits only; the entry type lives in `kind`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    pub kind: EntryKind,
    pub size: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

impl Stat {
    /// Directory metadata with both timestamps set to `time`.
    pub fn directory(time: SystemTime) -> Self {
        Self {
            kind: EntryKind::Directory,
            size: 0,
            mode: DEFAULT_DIR_MODE,
            uid: 0,
            gid: 0,
            mtime: time,
            ctime: time,
        }
    }

    /// File metadata with both timestamps set to `time`.
    pub fn file(size: u64, time: SystemTime) -> Self {
        Self {
            kind: EntryKind::File,
            size,
            mode: DEFAULT_FILE_MODE,
            uid: 0,
            gid: 0,
            mtime: time,
            ctime: time,
        }
    }

    /// Symlink metadata; `size` is the length of the target.
    pub fn symlink(target_len: usize, time: SystemTime) -> Self {
        Self {
            kind: EntryKind::Symlink,
            size: target_len as u64,
            mode: 0o777,
            uid: 0,
            gid: 0,
            mtime: time,
            ctime: time,
        }
    }

    /// Replaces the owner.
    #[must_use]
    pub fn with_owner(mut self, uid: u32, gid: u32) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }
}
