//! Filesystem calls as they travel through the router.
//!
//! The kernel bridge speaks inodes; the routing layer speaks paths. Every
//! call is lowered to an [`FsCall`]: a typed operation whose positional
//! arguments keep the order of the classic path-based FUSE API, so that the
//! path the router matches on sits at a known position ([`OpName::path_position`]).

use bytes::Bytes;
use drivefs_core::Stat;
use std::fmt;
use std::os::raw::c_int;

/// Names of the operations the router can be configured for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OpName {
    Getattr,
    Readdir,
    Opendir,
    Releasedir,
    Open,
    Read,
    Write,
    Flush,
    Release,
    Create,
    Truncate,
    Unlink,
    Mkdir,
    Rmdir,
    Symlink,
    Readlink,
    Rename,
    Getxattr,
}

impl OpName {
    pub const ALL: [OpName; 18] = [
        OpName::Getattr,
        OpName::Readdir,
        OpName::Opendir,
        OpName::Releasedir,
        OpName::Open,
        OpName::Read,
        OpName::Write,
        OpName::Flush,
        OpName::Release,
        OpName::Create,
        OpName::Truncate,
        OpName::Unlink,
        OpName::Mkdir,
        OpName::Rmdir,
        OpName::Symlink,
        OpName::Readlink,
        OpName::Rename,
        OpName::Getxattr,
    ];

    /// Position of the routed path among the call's arguments.
    ///
    /// Link creation takes `(target, path)`; everything else leads with the path.
    pub fn path_position(self) -> usize {
        match self {
            OpName::Symlink => 1,
            _ => 0,
        }
    }

    /// True for operations that change drive contents.
    pub fn is_mutating(self) -> bool {
        matches!(
            self,
            OpName::Write
                | OpName::Create
                | OpName::Truncate
                | OpName::Unlink
                | OpName::Mkdir
                | OpName::Rmdir
                | OpName::Symlink
                | OpName::Rename
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OpName::Getattr => "getattr",
            OpName::Readdir => "readdir",
            OpName::Opendir => "opendir",
            OpName::Releasedir => "releasedir",
            OpName::Open => "open",
            OpName::Read => "read",
            OpName::Write => "write",
            OpName::Flush => "flush",
            OpName::Release => "release",
            OpName::Create => "create",
            OpName::Truncate => "truncate",
            OpName::Unlink => "unlink",
            OpName::Mkdir => "mkdir",
            OpName::Rmdir => "rmdir",
            OpName::Symlink => "symlink",
            OpName::Readlink => "readlink",
            OpName::Rename => "rename",
            OpName::Getxattr => "getxattr",
        }
    }
}

impl fmt::Display for OpName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The operations a route rule applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpSet {
    All,
    Only(Vec<OpName>),
}

impl OpSet {
    pub fn only(ops: &[OpName]) -> Self {
        OpSet::Only(ops.to_vec())
    }

    pub fn contains(&self, op: OpName) -> bool {
        match self {
            OpSet::All => true,
            OpSet::Only(ops) => ops.contains(&op),
        }
    }
}

/// A path-addressed filesystem call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsCall {
    Getattr { path: String },
    Readdir { path: String },
    Opendir { path: String, flags: i32 },
    Releasedir { path: String, fh: u64 },
    Open { path: String, flags: i32 },
    Read { path: String, fh: u64, offset: u64, size: u32 },
    Write { path: String, fh: u64, offset: u64, data: Bytes },
    Flush { path: String, fh: u64 },
    Release { path: String, fh: u64 },
    Create { path: String, mode: u32, flags: i32 },
    Truncate { path: String, size: u64 },
    Unlink { path: String },
    Mkdir { path: String, mode: u32 },
    Rmdir { path: String },
    Symlink { target: String, path: String },
    Readlink { path: String },
    Rename { from: String, to: String },
    Getxattr { path: String, name: String },
}

impl FsCall {
    pub fn op(&self) -> OpName {
        match self {
            FsCall::Getattr { .. } => OpName::Getattr,
            FsCall::Readdir { .. } => OpName::Readdir,
            FsCall::Opendir { .. } => OpName::Opendir,
            FsCall::Releasedir { .. } => OpName::Releasedir,
            FsCall::Open { .. } => OpName::Open,
            FsCall::Read { .. } => OpName::Read,
            FsCall::Write { .. } => OpName::Write,
            FsCall::Flush { .. } => OpName::Flush,
            FsCall::Release { .. } => OpName::Release,
            FsCall::Create { .. } => OpName::Create,
            FsCall::Truncate { .. } => OpName::Truncate,
            FsCall::Unlink { .. } => OpName::Unlink,
            FsCall::Mkdir { .. } => OpName::Mkdir,
            FsCall::Rmdir { .. } => OpName::Rmdir,
            FsCall::Symlink { .. } => OpName::Symlink,
            FsCall::Readlink { .. } => OpName::Readlink,
            FsCall::Rename { .. } => OpName::Rename,
            FsCall::Getxattr { .. } => OpName::Getxattr,
        }
    }

    /// The argument the router matches on (see [`OpName::path_position`]).
    pub fn routed_path(&self) -> &str {
        match self {
            FsCall::Symlink { path, .. } | FsCall::Rename { from: path, .. } => path,
            FsCall::Getattr { path }
            | FsCall::Readdir { path }
            | FsCall::Opendir { path, .. }
            | FsCall::Releasedir { path, .. }
            | FsCall::Open { path, .. }
            | FsCall::Read { path, .. }
            | FsCall::Write { path, .. }
            | FsCall::Flush { path, .. }
            | FsCall::Release { path, .. }
            | FsCall::Create { path, .. }
            | FsCall::Truncate { path, .. }
            | FsCall::Unlink { path }
            | FsCall::Mkdir { path, .. }
            | FsCall::Rmdir { path }
            | FsCall::Readlink { path }
            | FsCall::Getxattr { path, .. } => path,
        }
    }

    pub fn routed_path_mut(&mut self) -> &mut String {
        match self {
            FsCall::Symlink { path, .. } | FsCall::Rename { from: path, .. } => path,
            FsCall::Getattr { path }
            | FsCall::Readdir { path }
            | FsCall::Opendir { path, .. }
            | FsCall::Releasedir { path, .. }
            | FsCall::Open { path, .. }
            | FsCall::Read { path, .. }
            | FsCall::Write { path, .. }
            | FsCall::Flush { path, .. }
            | FsCall::Release { path, .. }
            | FsCall::Create { path, .. }
            | FsCall::Truncate { path, .. }
            | FsCall::Unlink { path }
            | FsCall::Mkdir { path, .. }
            | FsCall::Rmdir { path }
            | FsCall::Readlink { path }
            | FsCall::Getxattr { path, .. } => path,
        }
    }

    /// Returns the call with its routed path replaced.
    #[must_use]
    pub fn with_routed_path(mut self, path: String) -> Self {
        *self.routed_path_mut() = path;
        self
    }
}

/// Successful completion of a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Empty,
    Attr(Stat),
    Entries(Vec<String>),
    Opened { fh: u64 },
    Created { attr: Stat, fh: u64 },
    Data(Bytes),
    Written(u32),
    /// Extended attribute value; `None` means the attribute does not exist.
    Xattr(Option<Bytes>),
    Link(String),
}

/// Outcome of a routed call: a reply or a positive errno.
pub type FsResult = Result<Reply, c_int>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symlink_routes_on_link_path() {
        let call = FsCall::Symlink {
            target: "/Network/target".into(),
            path: "/link".into(),
        };
        assert_eq!(call.op().path_position(), 1);
        assert_eq!(call.routed_path(), "/link");
        let moved = call.with_routed_path("/other".into());
        assert_eq!(
            moved,
            FsCall::Symlink {
                target: "/Network/target".into(),
                path: "/other".into()
            }
        );
    }

    #[test]
    fn test_opset() {
        assert!(OpSet::All.contains(OpName::Rename));
        let set = OpSet::only(&[OpName::Readdir]);
        assert!(set.contains(OpName::Readdir));
        assert!(!set.contains(OpName::Getattr));
    }

    #[test]
    fn test_every_op_has_distinct_name() {
        let mut names: Vec<_> = OpName::ALL.iter().map(|o| o.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), OpName::ALL.len());
    }
}
