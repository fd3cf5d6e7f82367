//! Open file and directory handles.
//!
//! Drives are addressed by path, so a handle only has to remember what was
//! opened and how. IDs auto-increment from 1; 0 is never handed out.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::atomic::{AtomicU64, Ordering};

/// What a handle refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenHandle {
    File { path: String, flags: i32 },
    Dir { path: String },
}

impl OpenHandle {
    pub fn path(&self) -> &str {
        match self {
            OpenHandle::File { path, .. } | OpenHandle::Dir { path } => path,
        }
    }

    /// True if the file was opened for writing.
    pub fn is_writable(&self) -> bool {
        match self {
            OpenHandle::File { flags, .. } => (flags & libc::O_ACCMODE) != libc::O_RDONLY,
            OpenHandle::Dir { .. } => false,
        }
    }
}

/// Thread-safe table with auto-incrementing u64 handle IDs.
#[derive(Debug)]
pub struct HandleTable<V> {
    handles: DashMap<u64, V>,
    next_id: AtomicU64,
}

impl<V> HandleTable<V> {
    pub fn new() -> Self {
        Self {
            handles: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Insert a value and return its new ID.
    pub fn insert(&self, value: V) -> u64 {
        let mut value = Some(value);
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            // Skip 0 on wraparound.
            if id == 0 {
                continue;
            }
            if let Entry::Vacant(entry) = self.handles.entry(id)
                && let Some(v) = value.take()
            {
                entry.insert(v);
                return id;
            }
        }
    }

    pub fn remove(&self, id: u64) -> Option<V> {
        self.handles.remove(&id).map(|(_, v)| v)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.handles.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Drop every handle.
    pub fn clear(&self) {
        self.handles.clear();
    }
}

impl<V: Clone> HandleTable<V> {
    pub fn get(&self, id: u64) -> Option<V> {
        self.handles.get(&id).map(|v| v.clone())
    }
}

impl<V> Default for HandleTable<V> {
    fn default() -> Self {
        Self::new()
    }
}
