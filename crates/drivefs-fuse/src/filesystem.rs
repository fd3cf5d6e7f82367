//! Kernel-facing filesystem.
//!
//! [`RoutedFs`] implements the fuser `Filesystem` trait by translating each
//! inode-addressed kernel request into a path-addressed [`FsCall`] and
//! handing it to the routing layer. Calls run as tokio tasks through a
//! [`CallBridge`], so a slow by-key drive open never stalls the session
//! thread; the reply object travels with the task and is answered exactly
//! once.
//!
//! | Operation | Routed as |
//! |-----------|-----------|
//! | lookup, getattr | `getattr` |
//! | setattr (size) | `truncate` then `getattr` |
//! | readdir | `readdir`, then `getattr` per entry for its type |
//! | create, mkdir, symlink | themselves, reply with the new entry |
//! | getxattr | `getxattr`; a missing value is ENODATA |
//! | access, statfs | answered locally |

use crate::async_bridge::{BridgeError, CallBridge};
use crate::handlers::OpHandler;
use crate::inode::{InodeTable, ROOT_INODE};
use crate::ops::{FsCall, FsResult, Reply};
use bytes::Bytes;
use drivefs_core::path;
use drivefs_core::{EntryKind, Stat};
use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr,
    Request, TimeOrNow,
};
use libc::c_int;
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{info, trace};

/// Block size for filesystem statistics.
const BLOCK_SIZE: u32 = 4096;

/// Longest file name accepted. 254 rather than 255 for GNOME Files, which
/// probes `namelen + 1`.
const NAME_MAX: u32 = 254;

#[cfg(target_os = "macos")]
const NO_XATTR: c_int = libc::ENOATTR;
#[cfg(not(target_os = "macos"))]
const NO_XATTR: c_int = libc::ENODATA;

fn file_type(kind: EntryKind) -> FileType {
    match kind {
        EntryKind::File => FileType::RegularFile,
        EntryKind::Directory => FileType::Directory,
        EntryKind::Symlink => FileType::Symlink,
    }
}

/// Converts drive metadata to a kernel attribute record.
pub fn to_file_attr(ino: u64, stat: &Stat) -> FileAttr {
    // Permission bits only, masked to fit.
    #[allow(clippy::cast_possible_truncation)]
    let perm = (stat.mode & 0o7777) as u16;
    FileAttr {
        ino,
        size: stat.size,
        blocks: stat.size.div_ceil(u64::from(BLOCK_SIZE)),
        atime: stat.mtime,
        mtime: stat.mtime,
        ctime: stat.ctime,
        crtime: stat.ctime,
        kind: file_type(stat.kind),
        perm,
        nlink: if stat.is_dir() { 2 } else { 1 },
        uid: stat.uid,
        gid: stat.gid,
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

fn settle<T>(result: Result<Result<T, c_int>, BridgeError>) -> Result<T, c_int> {
    result.unwrap_or_else(|e| Err(e.to_errno()))
}

fn unexpected(reply: &Reply) -> c_int {
    tracing::error!(?reply, "handler answered with the wrong reply kind");
    libc::EIO
}

/// FUSE filesystem in front of an [`OpHandler`].
pub struct RoutedFs {
    handler: Arc<dyn OpHandler>,
    inodes: Arc<InodeTable>,
    calls: CallBridge,
    ttl: Duration,
}

impl RoutedFs {
    pub fn new(handler: Arc<dyn OpHandler>, calls: CallBridge, ttl: Duration) -> Self {
        Self {
            handler,
            inodes: Arc::new(InodeTable::new()),
            calls,
            ttl,
        }
    }

    pub fn calls(&self) -> &CallBridge {
        &self.calls
    }

    pub fn inodes(&self) -> &Arc<InodeTable> {
        &self.inodes
    }

    fn path(&self, ino: u64) -> Result<String, c_int> {
        self.inodes.path(ino).ok_or(libc::ENOENT)
    }

    fn child(&self, parent: u64, name: &OsStr) -> Result<String, c_int> {
        let name = name.to_str().ok_or(libc::EINVAL)?;
        Ok(path::join(&self.path(parent)?, name))
    }

    /// Runs one routed call and hands the result to `complete`.
    fn route<C>(&self, call: FsCall, complete: C)
    where
        C: FnOnce(FsResult) + Send + 'static,
    {
        trace!(op = %call.op(), path = call.routed_path(), "syscall");
        let handler = Arc::clone(&self.handler);
        self.calls
            .spawn(async move { handler.call(call).await }, move |r| {
                complete(settle(r));
            });
    }

    /// Routes a call that answers with a new or existing entry.
    fn route_entry(&self, call: FsCall, path: String, reply: ReplyEntry) {
        let inodes = Arc::clone(&self.inodes);
        let ttl = self.ttl;
        self.route(call, move |result| match result {
            Ok(Reply::Attr(stat)) => {
                let ino = inodes.get_or_insert(&path);
                reply.entry(&ttl, &to_file_attr(ino, &stat), 0);
            }
            Ok(other) => reply.error(unexpected(&other)),
            Err(errno) => reply.error(errno),
        });
    }

    fn route_empty(&self, call: FsCall, reply: ReplyEmpty) {
        self.route(call, move |result| match result {
            Ok(_) => reply.ok(),
            Err(errno) => reply.error(errno),
        });
    }

    fn route_opened(&self, call: FsCall, reply: ReplyOpen) {
        self.route(call, move |result| match result {
            Ok(Reply::Opened { fh }) => reply.opened(fh, 0),
            Ok(other) => reply.error(unexpected(&other)),
            Err(errno) => reply.error(errno),
        });
    }
}

impl Filesystem for RoutedFs {
    fn init(&mut self, _req: &Request<'_>, config: &mut KernelConfig) -> Result<(), c_int> {
        info!("FUSE filesystem initialized");
        config.add_capabilities(fuser::consts::FUSE_ASYNC_READ).ok();
        Ok(())
    }

    fn destroy(&mut self) {
        info!(
            in_flight = self.calls.stats().in_flight(),
            "FUSE filesystem destroyed"
        );
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        match self.child(parent, name) {
            Ok(path) => self.route_entry(FsCall::Getattr { path: path.clone() }, path, reply),
            Err(errno) => reply.error(errno),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
    }

    fn batch_forget(&mut self, _req: &Request<'_>, nodes: &[fuser::fuse_forget_one]) {
        for node in nodes {
            self.inodes.forget(node.nodeid, node.nlookup);
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let path = match self.path(ino) {
            Ok(p) => p,
            Err(errno) => return reply.error(errno),
        };
        let ttl = self.ttl;
        self.route(FsCall::Getattr { path }, move |result| match result {
            Ok(Reply::Attr(stat)) => reply.attr(&ttl, &to_file_attr(ino, &stat)),
            Ok(other) => reply.error(unexpected(&other)),
            Err(errno) => reply.error(errno),
        });
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let path = match self.path(ino) {
            Ok(p) => p,
            Err(errno) => return reply.error(errno),
        };
        trace!(inode = ino, ?size, "setattr");
        // Only size changes reach the drive; mode, owner and times are fixed.
        let handler = Arc::clone(&self.handler);
        let ttl = self.ttl;
        self.calls.spawn(
            async move {
                if let Some(size) = size {
                    handler
                        .call(FsCall::Truncate {
                            path: path.clone(),
                            size,
                        })
                        .await?;
                }
                handler.call(FsCall::Getattr { path }).await
            },
            move |r| match settle(r) {
                Ok(Reply::Attr(stat)) => reply.attr(&ttl, &to_file_attr(ino, &stat)),
                Ok(other) => reply.error(unexpected(&other)),
                Err(errno) => reply.error(errno),
            },
        );
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let path = match self.path(ino) {
            Ok(p) => p,
            Err(errno) => return reply.error(errno),
        };
        self.route(FsCall::Readlink { path }, move |result| match result {
            Ok(Reply::Link(target)) => reply.data(target.as_bytes()),
            Ok(other) => reply.error(unexpected(&other)),
            Err(errno) => reply.error(errno),
        });
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        match self.path(ino) {
            Ok(path) => self.route_opened(FsCall::Open { path, flags }, reply),
            Err(errno) => reply.error(errno),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let (Ok(path), Ok(offset)) = (self.path(ino), u64::try_from(offset)) else {
            return reply.error(libc::EINVAL);
        };
        let call = FsCall::Read {
            path,
            fh,
            offset,
            size,
        };
        self.route(call, move |result| match result {
            Ok(Reply::Data(data)) => reply.data(&data),
            Ok(other) => reply.error(unexpected(&other)),
            Err(errno) => reply.error(errno),
        });
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let (Ok(path), Ok(offset)) = (self.path(ino), u64::try_from(offset)) else {
            return reply.error(libc::EINVAL);
        };
        let call = FsCall::Write {
            path,
            fh,
            offset,
            data: Bytes::copy_from_slice(data),
        };
        self.route(call, move |result| match result {
            Ok(Reply::Written(n)) => reply.written(n),
            Ok(other) => reply.error(unexpected(&other)),
            Err(errno) => reply.error(errno),
        });
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match self.path(ino) {
            Ok(path) => self.route_empty(FsCall::Flush { path, fh }, reply),
            Err(errno) => reply.error(errno),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.path(ino) {
            Ok(path) => self.route_empty(FsCall::Release { path, fh }, reply),
            Err(errno) => reply.error(errno),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        match self.path(ino) {
            Ok(path) => self.route_opened(FsCall::Opendir { path, flags }, reply),
            Err(errno) => reply.error(errno),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let dir = match self.path(ino) {
            Ok(p) => p,
            Err(errno) => return reply.error(errno),
        };
        let parent_ino = path::split_parent(&dir)
            .and_then(|(parent, _)| self.inodes.get_inode(parent))
            .unwrap_or(ROOT_INODE);
        let handler = Arc::clone(&self.handler);
        let inodes = Arc::clone(&self.inodes);

        self.calls.spawn(
            async move {
                let names = match handler.call(FsCall::Readdir { path: dir.clone() }).await? {
                    Reply::Entries(names) => names,
                    other => return Err(unexpected(&other)),
                };
                // Entries whose type cannot be determined are left out.
                let stats = futures::future::join_all(names.iter().map(|name| {
                    handler.call(FsCall::Getattr {
                        path: path::join(&dir, name),
                    })
                }))
                .await;
                let typed: Vec<(String, FileType)> = names
                    .into_iter()
                    .zip(stats)
                    .filter_map(|(name, stat)| match stat {
                        Ok(Reply::Attr(stat)) => Some((name, file_type(stat.kind))),
                        _ => None,
                    })
                    .collect();
                Ok((dir, typed))
            },
            move |r| {
                let (dir, typed) = match settle(r) {
                    Ok(v) => v,
                    Err(errno) => return reply.error(errno),
                };
                let mut entries = vec![
                    (ino, FileType::Directory, ".".to_string()),
                    (parent_ino, FileType::Directory, "..".to_string()),
                ];
                for (name, kind) in typed {
                    let child = inodes.get_or_insert_no_lookup_inc(&path::join(&dir, &name));
                    entries.push((child, kind, name));
                }
                let skip = usize::try_from(offset).unwrap_or(0);
                for (i, (child, kind, name)) in entries.into_iter().enumerate().skip(skip) {
                    #[allow(clippy::cast_possible_wrap)]
                    let next = (i + 1) as i64;
                    if reply.add(child, next, kind, name) {
                        break;
                    }
                }
                reply.ok();
            },
        );
    }

    fn releasedir(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        match self.path(ino) {
            Ok(path) => self.route_empty(FsCall::Releasedir { path, fh }, reply),
            Err(errno) => reply.error(errno),
        }
    }

    fn access(&mut self, _req: &Request<'_>, _ino: u64, _mask: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        // Drives have no fixed capacity; report plenty of room.
        reply.statfs(
            1_000_000, 500_000, 500_000, 1_000_000, 500_000, BLOCK_SIZE, NAME_MAX, BLOCK_SIZE,
        );
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let path = match self.child(parent, name) {
            Ok(p) => p,
            Err(errno) => return reply.error(errno),
        };
        let call = FsCall::Create {
            path: path.clone(),
            mode: mode & !umask,
            flags,
        };
        let inodes = Arc::clone(&self.inodes);
        let ttl = self.ttl;
        self.route(call, move |result| match result {
            Ok(Reply::Created { attr, fh }) => {
                let ino = inodes.get_or_insert(&path);
                reply.created(&ttl, &to_file_attr(ino, &attr), 0, fh, 0);
            }
            Ok(other) => reply.error(unexpected(&other)),
            Err(errno) => reply.error(errno),
        });
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        match self.child(parent, name) {
            Ok(path) => {
                let call = FsCall::Mkdir {
                    path: path.clone(),
                    mode: mode & !umask,
                };
                self.route_entry(call, path, reply);
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child(parent, name) {
            Ok(p) => p,
            Err(errno) => return reply.error(errno),
        };
        let inodes = Arc::clone(&self.inodes);
        self.route(FsCall::Unlink { path: path.clone() }, move |result| match result {
            Ok(_) => {
                inodes.invalidate_path(&path);
                reply.ok();
            }
            Err(errno) => reply.error(errno),
        });
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child(parent, name) {
            Ok(p) => p,
            Err(errno) => return reply.error(errno),
        };
        let inodes = Arc::clone(&self.inodes);
        self.route(FsCall::Rmdir { path: path.clone() }, move |result| match result {
            Ok(_) => {
                inodes.invalidate_path(&path);
                reply.ok();
            }
            Err(errno) => reply.error(errno),
        });
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let (Ok(path), Some(target)) = (self.child(parent, link_name), target.to_str()) else {
            return reply.error(libc::EINVAL);
        };
        let call = FsCall::Symlink {
            target: target.to_string(),
            path: path.clone(),
        };
        self.route_entry(call, path, reply);
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        if flags != 0 {
            return reply.error(libc::EINVAL);
        }
        let (Ok(from), Ok(to)) = (self.child(parent, name), self.child(newparent, newname)) else {
            return reply.error(libc::ENOENT);
        };
        let inodes = Arc::clone(&self.inodes);
        let call = FsCall::Rename {
            from: from.clone(),
            to: to.clone(),
        };
        self.route(call, move |result| match result {
            Ok(_) => {
                inodes.rename(&from, &to);
                reply.ok();
            }
            Err(errno) => reply.error(errno),
        });
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        let (Ok(path), Some(name)) = (self.path(ino), name.to_str()) else {
            return reply.error(NO_XATTR);
        };
        let call = FsCall::Getxattr {
            path,
            name: name.to_string(),
        };
        self.route(call, move |result| match result {
            Ok(Reply::Xattr(None)) => reply.error(NO_XATTR),
            Ok(Reply::Xattr(Some(value))) => {
                let len = u32::try_from(value.len()).unwrap_or(u32::MAX);
                if size == 0 {
                    reply.size(len);
                } else if len > size {
                    reply.error(libc::ERANGE);
                } else {
                    reply.data(&value);
                }
            }
            Ok(other) => reply.error(unexpected(&other)),
            Err(errno) => reply.error(errno),
        });
    }

    fn listxattr(&mut self, _req: &Request<'_>, _ino: u64, size: u32, reply: ReplyXattr) {
        if size == 0 {
            reply.size(0);
        } else {
            reply.data(&[]);
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _name: &OsStr,
        _value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        reply.error(libc::ENOTSUP);
    }

    fn removexattr(&mut self, _req: &Request<'_>, _ino: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(libc::ENOTSUP);
    }
}

impl std::fmt::Debug for RoutedFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutedFs")
            .field("inodes", &self.inodes.len())
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::UNIX_EPOCH;

    #[test]
    fn test_file_attr_conversion() {
        let stat = Stat::file(5000, UNIX_EPOCH).with_owner(1000, 100);
        let attr = to_file_attr(7, &stat);
        assert_eq!(attr.ino, 7);
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.perm, 0o644);
        assert_eq!(attr.blocks, 2);
        assert_eq!(attr.nlink, 1);
        assert_eq!((attr.uid, attr.gid), (1000, 100));
    }

    #[test]
    fn test_dir_attr_conversion() {
        let attr = to_file_attr(ROOT_INODE, &Stat::directory(UNIX_EPOCH));
        assert_eq!(attr.kind, FileType::Directory);
        assert_eq!(attr.perm, 0o755);
        assert_eq!(attr.nlink, 2);
    }

    #[test]
    fn test_bridge_errors_become_errnos() {
        let timed_out: Result<Result<(), c_int>, _> =
            Err(BridgeError::Timeout(Duration::from_secs(1)));
        assert_eq!(settle(timed_out), Err(libc::ETIMEDOUT));
        assert_eq!(settle::<u8>(Ok(Err(libc::ENOENT))), Err(libc::ENOENT));
    }
}
