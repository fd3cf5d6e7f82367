//! Operation tables.
//!
//! An [`OpHandler`] services path-addressed calls. The router is one, and
//! so is [`DriveHandlers`], the base table that maps calls straight onto a
//! single [`Drive`].

use crate::error::ToErrno;
use crate::handles::{HandleTable, OpenHandle};
use crate::ops::{FsCall, FsResult, Reply};
use async_trait::async_trait;
use drivefs_core::{Drive, DriveError, Stat};
use std::sync::Arc;

/// Services routed filesystem calls.
#[async_trait]
pub trait OpHandler: Send + Sync {
    /// Completes `call` exactly once, with a reply or an errno.
    async fn call(&self, call: FsCall) -> FsResult;
}

/// Owner reported for every entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
}

impl Owner {
    /// The user running this process.
    pub fn current() -> Self {
        #[cfg(unix)]
        {
            Self {
                uid: nix::unistd::getuid().as_raw(),
                gid: nix::unistd::getgid().as_raw(),
            }
        }
        #[cfg(not(unix))]
        {
            Self { uid: 0, gid: 0 }
        }
    }
}

/// Base operation table bound to one drive.
pub struct DriveHandlers {
    drive: Arc<dyn Drive>,
    owner: Owner,
    handles: HandleTable<OpenHandle>,
}

impl DriveHandlers {
    pub fn new(drive: Arc<dyn Drive>, owner: Owner) -> Self {
        Self {
            drive,
            owner,
            handles: HandleTable::new(),
        }
    }

    pub fn drive(&self) -> &Arc<dyn Drive> {
        &self.drive
    }

    /// Number of open file and directory handles.
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    fn owned(&self, stat: Stat) -> Stat {
        stat.with_owner(self.owner.uid, self.owner.gid)
    }

    async fn dispatch(&self, call: FsCall) -> Result<Reply, DriveError> {
        let drive = &self.drive;
        Ok(match call {
            FsCall::Getattr { path } => Reply::Attr(self.owned(drive.stat(&path).await?)),
            FsCall::Readdir { path } => Reply::Entries(drive.readdir(&path).await?),
            // Directories are listed by path; the handle is bookkeeping only.
            FsCall::Opendir { path, .. } => Reply::Opened {
                fh: self.handles.insert(OpenHandle::Dir { path }),
            },
            FsCall::Releasedir { fh, .. } | FsCall::Release { fh, .. } => {
                self.handles.remove(fh);
                Reply::Empty
            }
            FsCall::Open { path, flags } => {
                let stat = drive.stat(&path).await?;
                if stat.is_dir() {
                    return Err(DriveError::IsADirectory(path));
                }
                let handle = OpenHandle::File { path, flags };
                if handle.is_writable() && !drive.writable() {
                    return Err(DriveError::ReadOnly);
                }
                if flags & libc::O_TRUNC != 0 && handle.is_writable() {
                    drive.truncate(handle.path(), 0).await?;
                }
                Reply::Opened {
                    fh: self.handles.insert(handle),
                }
            }
            FsCall::Read {
                path, offset, size, ..
            } => Reply::Data(drive.read(&path, offset, size).await?),
            FsCall::Write {
                path, offset, data, ..
            } => Reply::Written(drive.write(&path, offset, &data).await?),
            FsCall::Flush { .. } => Reply::Empty,
            FsCall::Create { path, mode, flags } => {
                let attr = self.owned(drive.create(&path, mode & 0o7777).await?);
                let fh = self.handles.insert(OpenHandle::File { path, flags });
                Reply::Created { attr, fh }
            }
            FsCall::Truncate { path, size } => {
                drive.truncate(&path, size).await?;
                Reply::Empty
            }
            FsCall::Unlink { path } => {
                drive.unlink(&path).await?;
                Reply::Empty
            }
            FsCall::Mkdir { path, mode } => {
                Reply::Attr(self.owned(drive.mkdir(&path, mode & 0o7777).await?))
            }
            FsCall::Rmdir { path } => {
                drive.rmdir(&path).await?;
                Reply::Empty
            }
            FsCall::Symlink { target, path } => {
                Reply::Attr(self.owned(drive.symlink(&target, &path).await?))
            }
            FsCall::Readlink { path } => Reply::Link(drive.readlink(&path).await?),
            FsCall::Rename { from, to } => {
                drive.rename(&from, &to).await?;
                Reply::Empty
            }
            // No extended attributes are stored on drive entries.
            FsCall::Getxattr { path, .. } => {
                drive.stat(&path).await?;
                Reply::Xattr(None)
            }
        })
    }
}

#[async_trait]
impl OpHandler for DriveHandlers {
    async fn call(&self, call: FsCall) -> FsResult {
        let op = call.op();
        self.dispatch(call).await.map_err(|e| {
            if !e.is_not_found() {
                tracing::debug!(drive = ?self.drive.key(), %op, error = %e, "drive call failed");
            }
            e.to_errno()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use drivefs_core::{DriveStore, MemoryStore};

    async fn handlers() -> (DriveHandlers, Arc<dyn Drive>) {
        let store = MemoryStore::new();
        let drive = store.create_drive().await.unwrap();
        let owner = Owner { uid: 1000, gid: 100 };
        (DriveHandlers::new(Arc::clone(&drive), owner), drive)
    }

    #[tokio::test]
    async fn test_create_write_read() {
        let (h, _drive) = handlers().await;
        let Ok(Reply::Created { attr, fh }) = h
            .call(FsCall::Create {
                path: "/f.txt".into(),
                mode: 0o100644,
                flags: libc::O_WRONLY,
            })
            .await
        else {
            panic!("create failed");
        };
        assert_eq!(attr.uid, 1000);
        assert_eq!(attr.mode, 0o644);

        let written = h
            .call(FsCall::Write {
                path: "/f.txt".into(),
                fh,
                offset: 0,
                data: Bytes::from_static(b"hello"),
            })
            .await;
        assert_eq!(written, Ok(Reply::Written(5)));
        h.call(FsCall::Release {
            path: "/f.txt".into(),
            fh,
        })
        .await
        .unwrap();
        assert_eq!(h.open_handles(), 0);

        let data = h
            .call(FsCall::Read {
                path: "/f.txt".into(),
                fh: 0,
                offset: 1,
                size: 10,
            })
            .await;
        assert_eq!(data, Ok(Reply::Data(Bytes::from_static(b"ello"))));
    }

    #[tokio::test]
    async fn test_missing_entry_is_enoent() {
        let (h, _drive) = handlers().await;
        assert_eq!(
            h.call(FsCall::Getattr {
                path: "/nope".into()
            })
            .await,
            Err(libc::ENOENT)
        );
    }

    #[tokio::test]
    async fn test_open_for_write_on_read_only_drive() {
        let store = MemoryStore::new();
        let writer = store.create_drive().await.unwrap();
        writer.write_file("/a", b"x").await.unwrap();
        let checkout = store
            .open_drive(writer.key(), Some(writer.version()))
            .await
            .unwrap();
        let h = DriveHandlers::new(checkout, Owner::current());
        assert_eq!(
            h.call(FsCall::Open {
                path: "/a".into(),
                flags: libc::O_RDWR
            })
            .await,
            Err(libc::EPERM)
        );
        assert!(matches!(
            h.call(FsCall::Open {
                path: "/a".into(),
                flags: libc::O_RDONLY
            })
            .await,
            Ok(Reply::Opened { .. })
        ));
    }

    #[tokio::test]
    async fn test_open_with_truncate() {
        let (h, drive) = handlers().await;
        drive.write_file("/a", b"content").await.unwrap();
        h.call(FsCall::Open {
            path: "/a".into(),
            flags: libc::O_WRONLY | libc::O_TRUNC,
        })
        .await
        .unwrap();
        assert_eq!(drive.stat("/a").await.unwrap().size, 0);
    }

    #[tokio::test]
    async fn test_getxattr_has_no_value() {
        let (h, drive) = handlers().await;
        drive.write_file("/a", b"x").await.unwrap();
        assert_eq!(
            h.call(FsCall::Getxattr {
                path: "/a".into(),
                name: "user.test".into()
            })
            .await,
            Ok(Reply::Xattr(None))
        );
    }
}
