//! Immutable snapshot of one drive version.
//!
//! A [`Tree`] maps canonical paths to nodes. The root directory is implicit.
//! Every mutation of a drive clones the latest tree, applies the change and
//! appends the result as a new version, so older versions stay readable.

use crate::error::{DriveError, DriveResult};
use crate::key::DriveKey;
use crate::path;
use crate::stat::{EntryKind, Stat};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::time::SystemTime;

/// Largest file the in-memory engine will hold.
pub const MAX_FILE_SIZE: u64 = 1 << 32;

#[derive(Debug, Clone)]
pub(crate) enum Node {
    File {
        data: Bytes,
        mode: u32,
        mtime: SystemTime,
        ctime: SystemTime,
    },
    Directory {
        mode: u32,
        mtime: SystemTime,
        ctime: SystemTime,
    },
    Symlink {
        target: String,
        mtime: SystemTime,
    },
    Mount {
        key: DriveKey,
        version: Option<u64>,
    },
}

impl Node {
    fn kind(&self) -> Option<EntryKind> {
        match self {
            Node::File { .. } => Some(EntryKind::File),
            Node::Directory { .. } => Some(EntryKind::Directory),
            Node::Symlink { .. } => Some(EntryKind::Symlink),
            Node::Mount { .. } => None,
        }
    }
}

/// Where a path lands once nested mounts are taken into account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Location {
    /// The path belongs to this tree.
    Local(String),
    /// The path crosses a mount; `rest` is relative to the child's root.
    Mounted {
        mount_path: String,
        key: DriveKey,
        version: Option<u64>,
        rest: String,
    },
}

#[derive(Debug, Clone)]
pub(crate) struct Tree {
    created: SystemTime,
    nodes: BTreeMap<String, Node>,
}

impl Tree {
    pub(crate) fn new(created: SystemTime) -> Self {
        Self {
            created,
            nodes: BTreeMap::new(),
        }
    }

    /// Resolves `path` against the mounts in this tree.
    ///
    /// With `through_last` false, a mount at exactly `path` is reported as
    /// local so that mount management can address the mountpoint itself.
    pub(crate) fn locate(&self, path: &str, through_last: bool) -> Location {
        let mut prefix = String::new();
        let parts: Vec<&str> = path::components(path).collect();
        for (idx, part) in parts.iter().enumerate() {
            prefix.push('/');
            prefix.push_str(part);
            let last = idx + 1 == parts.len();
            if last && !through_last {
                break;
            }
            if let Some(Node::Mount { key, version }) = self.nodes.get(&prefix) {
                let rest = if last {
                    "/".to_string()
                } else {
                    format!("/{}", parts[idx + 1..].join("/"))
                };
                return Location::Mounted {
                    mount_path: prefix,
                    key: *key,
                    version: *version,
                    rest,
                };
            }
        }
        Location::Local(path.to_string())
    }

    fn node(&self, path: &str) -> DriveResult<&Node> {
        self.nodes
            .get(path)
            .ok_or_else(|| DriveError::NotFound(path.to_string()))
    }

    pub(crate) fn stat(&self, path: &str) -> DriveResult<Stat> {
        if path == "/" {
            return Ok(Stat::directory(self.created));
        }
        match self.node(path)? {
            Node::File {
                data,
                mode,
                mtime,
                ctime,
            } => {
                let mut stat = Stat::file(data.len() as u64, *mtime);
                stat.mode = *mode;
                stat.ctime = *ctime;
                Ok(stat)
            }
            Node::Directory { mode, mtime, ctime } => {
                let mut stat = Stat::directory(*mtime);
                stat.mode = *mode;
                stat.ctime = *ctime;
                Ok(stat)
            }
            Node::Symlink { target, mtime } => Ok(Stat::symlink(target.len(), *mtime)),
            // Callers resolve mounts before asking; a bare mount node is
            // only reached through `locate(.., false)`.
            Node::Mount { .. } => Ok(Stat::directory(self.created)),
        }
    }

    fn require_dir(&self, path: &str) -> DriveResult<()> {
        if path == "/" {
            return Ok(());
        }
        match self.node(path)? {
            Node::Directory { .. } | Node::Mount { .. } => Ok(()),
            _ => Err(DriveError::NotADirectory(path.to_string())),
        }
    }

    /// Direct children of `dir`, in name order.
    fn children<'a>(
        &'a self,
        dir: &str,
    ) -> impl Iterator<Item = (&'a str, &'a Node)> + use<'a> {
        let prefix = if dir == "/" {
            "/".to_string()
        } else {
            format!("{dir}/")
        };
        let plen = prefix.len();
        self.nodes
            .range(prefix.clone()..)
            .take_while(move |(k, _)| k.starts_with(&prefix))
            .filter_map(move |(k, v)| {
                let name = &k[plen..];
                (!name.contains('/')).then_some((name, v))
            })
    }

    pub(crate) fn readdir(&self, path: &str) -> DriveResult<Vec<String>> {
        self.require_dir(path)?;
        Ok(self
            .children(path)
            .map(|(name, _)| name.to_string())
            .collect())
    }

    /// Direct mount nodes as `(path, key, version)`.
    pub(crate) fn mounts(&self) -> Vec<(String, DriveKey, Option<u64>)> {
        self.nodes
            .iter()
            .filter_map(|(p, n)| match n {
                Node::Mount { key, version } => Some((p.clone(), *key, *version)),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn read(&self, path: &str, offset: u64, len: u32) -> DriveResult<Bytes> {
        match self.node(path)? {
            Node::File { data, .. } => {
                let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
                let end = start.saturating_add(len as usize).min(data.len());
                Ok(data.slice(start..end))
            }
            Node::Directory { .. } | Node::Mount { .. } => {
                Err(DriveError::IsADirectory(path.to_string()))
            }
            Node::Symlink { .. } => Err(DriveError::InvalidPath(path.to_string())),
        }
    }

    pub(crate) fn readlink(&self, path: &str) -> DriveResult<String> {
        match self.node(path)? {
            Node::Symlink { target, .. } => Ok(target.clone()),
            _ => Err(DriveError::InvalidPath(path.to_string())),
        }
    }

    fn ensure_parent(&self, path: &str) -> DriveResult<()> {
        let (parent, _) =
            path::split_parent(path).ok_or_else(|| DriveError::AlreadyExists(path.to_string()))?;
        self.require_dir(parent)
    }

    fn insert_new(&mut self, path: &str, node: Node) -> DriveResult<()> {
        self.ensure_parent(path)?;
        if self.nodes.contains_key(path) {
            return Err(DriveError::AlreadyExists(path.to_string()));
        }
        self.nodes.insert(path.to_string(), node);
        Ok(())
    }

    pub(crate) fn create(&mut self, path: &str, mode: u32, now: SystemTime) -> DriveResult<Stat> {
        self.insert_new(
            path,
            Node::File {
                data: Bytes::new(),
                mode,
                mtime: now,
                ctime: now,
            },
        )?;
        self.stat(path)
    }

    pub(crate) fn mkdir(&mut self, path: &str, mode: u32, now: SystemTime) -> DriveResult<Stat> {
        self.insert_new(
            path,
            Node::Directory {
                mode,
                mtime: now,
                ctime: now,
            },
        )?;
        self.stat(path)
    }

    pub(crate) fn symlink(&mut self, target: &str, path: &str, now: SystemTime) -> DriveResult<Stat> {
        self.insert_new(
            path,
            Node::Symlink {
                target: target.to_string(),
                mtime: now,
            },
        )?;
        self.stat(path)
    }

    pub(crate) fn write(
        &mut self,
        path: &str,
        offset: u64,
        bytes: &[u8],
        now: SystemTime,
    ) -> DriveResult<u32> {
        let Some(Node::File { data, mtime, .. }) = self.nodes.get_mut(path) else {
            return match self.nodes.get(path) {
                None => Err(DriveError::NotFound(path.to_string())),
                Some(_) => Err(DriveError::IsADirectory(path.to_string())),
            };
        };
        let end = offset
            .checked_add(bytes.len() as u64)
            .ok_or_else(|| DriveError::FileTooLarge(path.to_string()))?;
        let mut buf = resized(data, end.max(data.len() as u64), path)?;
        let offset = usize::try_from(offset).map_err(|_| DriveError::FileTooLarge(path.to_string()))?;
        buf[offset..offset + bytes.len()].copy_from_slice(bytes);
        *data = Bytes::from(buf);
        *mtime = now;
        u32::try_from(bytes.len()).map_err(|_| DriveError::InvalidPath(path.to_string()))
    }

    pub(crate) fn truncate(&mut self, path: &str, size: u64, now: SystemTime) -> DriveResult<()> {
        match self.nodes.get_mut(path) {
            Some(Node::File { data, mtime, .. }) => {
                *data = Bytes::from(resized(data, size, path)?);
                *mtime = now;
                Ok(())
            }
            Some(_) => Err(DriveError::IsADirectory(path.to_string())),
            None => Err(DriveError::NotFound(path.to_string())),
        }
    }

    pub(crate) fn unlink(&mut self, path: &str) -> DriveResult<()> {
        match self.node(path)? {
            Node::Directory { .. } | Node::Mount { .. } => {
                Err(DriveError::IsADirectory(path.to_string()))
            }
            _ => {
                self.nodes.remove(path);
                Ok(())
            }
        }
    }

    pub(crate) fn rmdir(&mut self, path: &str) -> DriveResult<()> {
        match self.node(path)? {
            Node::Directory { .. } => {}
            Node::Mount { .. } => return Err(DriveError::InvalidPath(path.to_string())),
            _ => return Err(DriveError::NotADirectory(path.to_string())),
        }
        if self.children(path).next().is_some() {
            return Err(DriveError::NotEmpty(path.to_string()));
        }
        self.nodes.remove(path);
        Ok(())
    }

    pub(crate) fn rename(&mut self, from: &str, to: &str) -> DriveResult<()> {
        if from == "/" || to == "/" {
            return Err(DriveError::InvalidPath(from.to_string()));
        }
        self.node(from)?;
        self.ensure_parent(to)?;
        if to.starts_with(&format!("{from}/")) {
            return Err(DriveError::InvalidPath(to.to_string()));
        }
        if let Some(existing) = self.nodes.get(to) {
            let replacing_dir = existing.kind() == Some(EntryKind::Directory);
            if replacing_dir && self.children(to).next().is_some() {
                return Err(DriveError::NotEmpty(to.to_string()));
            }
        }
        let moved: Vec<String> = self
            .nodes
            .range(from.to_string()..)
            .take_while(|(k, _)| k.as_str() == from || k.starts_with(&format!("{from}/")))
            .map(|(k, _)| k.clone())
            .collect();
        for old in moved {
            if let Some(node) = self.nodes.remove(&old) {
                let new = format!("{to}{}", &old[from.len()..]);
                self.nodes.insert(new, node);
            }
        }
        Ok(())
    }

    pub(crate) fn mount(
        &mut self,
        path: &str,
        key: DriveKey,
        version: Option<u64>,
    ) -> DriveResult<()> {
        self.ensure_parent(path)?;
        match self.nodes.get(path) {
            None | Some(Node::Mount { .. }) => {
                self.nodes
                    .insert(path.to_string(), Node::Mount { key, version });
                Ok(())
            }
            Some(_) => Err(DriveError::AlreadyExists(path.to_string())),
        }
    }

    pub(crate) fn unmount(&mut self, path: &str) -> DriveResult<()> {
        match self.node(path)? {
            Node::Mount { .. } => {
                self.nodes.remove(path);
                Ok(())
            }
            _ => Err(DriveError::InvalidPath(path.to_string())),
        }
    }
}

/// Copies `data` into a buffer of exactly `len` bytes, zero-filling growth.
///
/// Allocation failure is reported instead of aborting.
fn resized(data: &Bytes, len: u64, path: &str) -> DriveResult<Vec<u8>> {
    let too_large = || DriveError::FileTooLarge(path.to_string());
    if len > MAX_FILE_SIZE {
        return Err(too_large());
    }
    let len = usize::try_from(len).map_err(|_| too_large())?;
    let mut buf = Vec::new();
    buf.try_reserve_exact(len).map_err(|_| too_large())?;
    buf.extend_from_slice(&data[..data.len().min(len)]);
    buf.resize(len, 0);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> Tree {
        Tree::new(SystemTime::UNIX_EPOCH)
    }

    #[test]
    fn test_readdir_lists_direct_children_only() {
        let mut t = tree();
        let now = SystemTime::now();
        t.mkdir("/a", 0o755, now).unwrap();
        t.create("/a/x", 0o644, now).unwrap();
        t.mkdir("/a/b", 0o755, now).unwrap();
        t.create("/a/b/y", 0o644, now).unwrap();
        t.create("/top", 0o644, now).unwrap();
        assert_eq!(t.readdir("/").unwrap(), vec!["a", "top"]);
        assert_eq!(t.readdir("/a").unwrap(), vec!["b", "x"]);
    }

    #[test]
    fn test_write_extends_and_read_slices() {
        let mut t = tree();
        let now = SystemTime::now();
        t.create("/f", 0o644, now).unwrap();
        t.write("/f", 2, b"hi", now).unwrap();
        assert_eq!(t.read("/f", 0, 10).unwrap().as_ref(), b"\0\0hi");
        assert_eq!(t.read("/f", 3, 10).unwrap().as_ref(), b"i");
        assert!(t.read("/f", 100, 10).unwrap().is_empty());
    }

    #[test]
    fn test_oversized_truncate_and_write_are_rejected() {
        let mut t = tree();
        let now = SystemTime::now();
        t.create("/f", 0o644, now).unwrap();
        t.write("/f", 0, b"keep", now).unwrap();

        let err = t.truncate("/f", 1 << 62, now).unwrap_err();
        assert!(matches!(err, DriveError::FileTooLarge(_)));
        let err = t.write("/f", u64::MAX - 1, b"xy", now).unwrap_err();
        assert!(matches!(err, DriveError::FileTooLarge(_)));
        let err = t.write("/f", MAX_FILE_SIZE, b"x", now).unwrap_err();
        assert!(matches!(err, DriveError::FileTooLarge(_)));
        assert_eq!(t.read("/f", 0, 10).unwrap().as_ref(), b"keep");

        t.truncate("/f", 2, now).unwrap();
        assert_eq!(t.read("/f", 0, 10).unwrap().as_ref(), b"ke");
    }

    #[test]
    fn test_create_requires_parent() {
        let mut t = tree();
        assert!(matches!(
            t.create("/missing/f", 0o644, SystemTime::now()),
            Err(DriveError::NotFound(_))
        ));
    }

    #[test]
    fn test_rmdir_non_empty() {
        let mut t = tree();
        let now = SystemTime::now();
        t.mkdir("/d", 0o755, now).unwrap();
        t.create("/d/f", 0o644, now).unwrap();
        assert!(matches!(t.rmdir("/d"), Err(DriveError::NotEmpty(_))));
        t.unlink("/d/f").unwrap();
        t.rmdir("/d").unwrap();
        assert!(t.readdir("/").unwrap().is_empty());
    }

    #[test]
    fn test_rename_moves_subtree() {
        let mut t = tree();
        let now = SystemTime::now();
        t.mkdir("/d", 0o755, now).unwrap();
        t.create("/d/f", 0o644, now).unwrap();
        t.rename("/d", "/e").unwrap();
        assert_eq!(t.readdir("/e").unwrap(), vec!["f"]);
        assert!(t.stat("/d").is_err());
    }

    #[test]
    fn test_locate_through_mount() {
        let mut t = tree();
        let key = DriveKey::from_bytes([1; 32]);
        t.mount("/docs", key, None).unwrap();
        assert_eq!(
            t.locate("/docs/a/b.txt", true),
            Location::Mounted {
                mount_path: "/docs".into(),
                key,
                version: None,
                rest: "/a/b.txt".into()
            }
        );
        assert_eq!(
            t.locate("/docs", true),
            Location::Mounted {
                mount_path: "/docs".into(),
                key,
                version: None,
                rest: "/".into()
            }
        );
        assert_eq!(t.locate("/docs", false), Location::Local("/docs".into()));
        assert_eq!(t.readdir("/").unwrap(), vec!["docs"]);
    }
}
