//! Inode management for the FUSE filesystem.
//!
//! The kernel addresses entries by inode number; the router addresses them
//! by absolute path. This table maps between the two, with the `nlookup`
//! reference count FUSE needs for `forget()`.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::atomic::{AtomicU64, Ordering};

/// The root inode number (FUSE convention).
pub const ROOT_INODE: u64 = 1;

/// An entry in the inode table.
#[derive(Debug)]
pub struct InodeEntry {
    /// Absolute path as seen by the router.
    pub path: String,
    /// Lookup count for proper `forget()` handling.
    nlookup: AtomicU64,
}

impl InodeEntry {
    fn new(path: String, nlookup: u64) -> Self {
        Self {
            path,
            nlookup: AtomicU64::new(nlookup),
        }
    }

    pub fn inc_nlookup(&self) -> u64 {
        self.nlookup.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Decrements the lookup count and returns what is left, or `None` on
    /// underflow (the count is left unchanged).
    pub fn dec_nlookup(&self, count: u64) -> Option<u64> {
        let old = self.nlookup.fetch_sub(count, Ordering::AcqRel);
        if old < count {
            self.nlookup.fetch_add(count, Ordering::Relaxed);
            None
        } else {
            Some(old - count)
        }
    }

    pub fn nlookup(&self) -> u64 {
        self.nlookup.load(Ordering::Relaxed)
    }
}

/// Thread-safe bidirectional inode/path table.
pub struct InodeTable {
    entries: DashMap<u64, InodeEntry>,
    by_path: DashMap<String, u64>,
    next: AtomicU64,
}

impl InodeTable {
    /// Creates a table holding only the root directory.
    pub fn new() -> Self {
        let entries = DashMap::new();
        let by_path = DashMap::new();
        entries.insert(ROOT_INODE, InodeEntry::new("/".to_string(), 1));
        by_path.insert("/".to_string(), ROOT_INODE);
        Self {
            entries,
            by_path,
            next: AtomicU64::new(ROOT_INODE + 1),
        }
    }

    fn insert_with(&self, path: &str, nlookup: u64) -> u64 {
        match self.by_path.entry(path.to_string()) {
            Entry::Occupied(occupied) => {
                let inode = *occupied.get();
                if nlookup > 0
                    && let Some(entry) = self.entries.get(&inode)
                {
                    entry.inc_nlookup();
                }
                inode
            }
            Entry::Vacant(vacant) => {
                let inode = self.next.fetch_add(1, Ordering::Relaxed);
                self.entries
                    .insert(inode, InodeEntry::new(path.to_string(), nlookup));
                vacant.insert(inode);
                inode
            }
        }
    }

    /// Returns the inode for `path`, allocating one if needed, and counts a
    /// kernel lookup against it.
    pub fn get_or_insert(&self, path: &str) -> u64 {
        self.insert_with(path, 1)
    }

    /// Like [`get_or_insert`](Self::get_or_insert) but without counting a
    /// lookup, for entries handed out by `readdir()`.
    pub fn get_or_insert_no_lookup_inc(&self, path: &str) -> u64 {
        self.insert_with(path, 0)
    }

    /// Path of `inode`.
    pub fn path(&self, inode: u64) -> Option<String> {
        self.entries.get(&inode).map(|e| e.path.clone())
    }

    pub fn get_inode(&self, path: &str) -> Option<u64> {
        self.by_path.get(path).map(|r| *r)
    }

    /// Drops `nlookup` references. Returns true if the inode was evicted.
    pub fn forget(&self, inode: u64, nlookup: u64) -> bool {
        if inode == ROOT_INODE {
            return false;
        }
        let remaining = match self.entries.get(&inode) {
            Some(entry) => entry.dec_nlookup(nlookup),
            None => return false,
        };
        if remaining != Some(0) {
            return false;
        }
        let Some((_, entry)) = self.entries.remove(&inode) else {
            return false;
        };
        self.by_path.remove_if(&entry.path, |_, ino| *ino == inode);
        true
    }

    /// Unlinks `path` from its inode after a delete. The inode itself stays
    /// until the kernel forgets it.
    pub fn invalidate_path(&self, path: &str) {
        self.by_path.remove(path);
    }

    /// Moves `from` and everything below it to `to`.
    pub fn rename(&self, from: &str, to: &str) {
        let prefix = format!("{from}/");
        let moved: Vec<(String, u64)> = self
            .by_path
            .iter()
            .filter(|e| e.key() == from || e.key().starts_with(&prefix))
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        // The destination, if it existed, is replaced.
        self.invalidate_path(to);
        for (old, inode) in moved {
            let new = format!("{to}{}", &old[from.len()..]);
            self.by_path.remove(&old);
            if let Some(mut entry) = self.entries.get_mut(&inode) {
                entry.path.clone_from(&new);
            }
            self.by_path.insert(new, inode);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if only the root inode is present.
    pub fn is_empty(&self) -> bool {
        self.entries.len() <= 1
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_inode_exists() {
        let table = InodeTable::new();
        assert_eq!(table.path(ROOT_INODE).as_deref(), Some("/"));
        assert_eq!(table.get_inode("/"), Some(ROOT_INODE));
        assert!(table.is_empty());
    }

    #[test]
    fn test_allocate_inode() {
        let table = InodeTable::new();
        let inode = table.get_or_insert("/docs");
        assert!(inode > ROOT_INODE);
        assert_eq!(table.get_or_insert("/docs"), inode);
        assert_eq!(table.entries.get(&inode).unwrap().nlookup(), 2);
    }

    #[test]
    fn test_readdir_entries_do_not_count() {
        let table = InodeTable::new();
        let inode = table.get_or_insert_no_lookup_inc("/a");
        assert_eq!(table.entries.get(&inode).unwrap().nlookup(), 0);
        assert_eq!(table.get_or_insert("/a"), inode);
        assert_eq!(table.entries.get(&inode).unwrap().nlookup(), 1);
    }

    #[test]
    fn test_forget_evicts_at_zero() {
        let table = InodeTable::new();
        let inode = table.get_or_insert("/a");
        table.get_or_insert("/a");
        assert!(!table.forget(inode, 1));
        assert!(table.forget(inode, 1));
        assert!(table.path(inode).is_none());
        assert!(table.get_inode("/a").is_none());
        assert!(!table.forget(ROOT_INODE, 1));
    }

    #[test]
    fn test_forget_underflow_is_ignored() {
        let table = InodeTable::new();
        let inode = table.get_or_insert("/a");
        assert!(!table.forget(inode, 5));
        assert_eq!(table.path(inode).as_deref(), Some("/a"));
    }

    #[test]
    fn test_rename_moves_subtree() {
        let table = InodeTable::new();
        let dir = table.get_or_insert("/d");
        let file = table.get_or_insert("/d/f");
        let other = table.get_or_insert("/dx");
        table.rename("/d", "/e");
        assert_eq!(table.path(dir).as_deref(), Some("/e"));
        assert_eq!(table.path(file).as_deref(), Some("/e/f"));
        assert_eq!(table.path(other).as_deref(), Some("/dx"));
        assert_eq!(table.get_inode("/e/f"), Some(file));
        assert!(table.get_inode("/d").is_none());
    }

    #[test]
    fn test_invalidate_keeps_entry() {
        let table = InodeTable::new();
        let inode = table.get_or_insert("/a");
        table.invalidate_path("/a");
        assert!(table.get_inode("/a").is_none());
        assert_eq!(table.path(inode).as_deref(), Some("/a"));
        // A new entry at the same path gets a fresh inode.
        assert_ne!(table.get_or_insert("/a"), inode);
    }
}
