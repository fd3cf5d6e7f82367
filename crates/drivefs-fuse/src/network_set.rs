//! Bounded, recency-ordered set of names shown in the network directory.
//!
//! Names are appended as drives are browsed by key. Re-adding a name moves
//! it to the end, except that the two oldest surviving entries are never
//! searched for a duplicate, so re-adding one of those appends a second
//! copy. Once the list holds [`NETWORK_SET_CAPACITY`] entries the oldest is
//! dropped.

/// Size at which the oldest entry is evicted.
pub const NETWORK_SET_CAPACITY: usize = 18;

/// Entries at the front that are skipped when looking for duplicates.
const PINNED_FRONT: usize = 2;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkSet {
    names: Vec<String>,
}

impl NetworkSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `name` as the most recent entry.
    pub fn add(&mut self, name: &str) {
        if self.names.last().is_some_and(|last| last == name) {
            return;
        }
        if let Some(pos) = self
            .names
            .iter()
            .skip(PINNED_FRONT)
            .position(|n| n == name)
        {
            self.names.remove(pos + PINNED_FRONT);
        }
        self.names.push(name.to_string());
        if self.names.len() >= NETWORK_SET_CAPACITY {
            self.names.remove(0);
        }
    }

    pub fn has(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    /// Entries, oldest first.
    pub fn list(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
