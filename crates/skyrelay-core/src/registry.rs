//! Connection registries keyed by stable ids.
//!
//! Routing fans one message out to many connections, and pushing to a
//! connection can close it (backpressure) in the middle of the pass. Callers
//! therefore iterate over an [`Registry::ids`] snapshot and re-check each id
//! with [`Registry::get`]: a connection removed mid-pass is skipped, and ids
//! are never reused, so a removed id can never alias a new connection.

use std::{collections::BTreeMap, fmt};

/// Stable identifier of a client or driver connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnId(u64);

impl ConnId {
    /// Wrap a raw id.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw id value.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Monotonic id source shared by every registry of one broker.
#[derive(Debug, Default)]
pub struct ConnIdAllocator {
    last: u64,
}

impl ConnIdAllocator {
    /// Allocate the next id. Ids start at 1.
    pub fn next_id(&mut self) -> ConnId {
        self.last += 1;
        ConnId(self.last)
    }
}

/// Id-indexed collection of live connections.
///
/// Iteration order is id order, which is creation order.
#[derive(Debug)]
pub struct Registry<T> {
    entries: BTreeMap<ConnId, T>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Registry<T> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self { entries: BTreeMap::new() }
    }

    /// Insert a connection. Returns the previous entry if `id` was taken.
    pub fn insert(&mut self, id: ConnId, value: T) -> Option<T> {
        self.entries.insert(id, value)
    }

    /// Remove a connection.
    pub fn remove(&mut self, id: ConnId) -> Option<T> {
        self.entries.remove(&id)
    }

    /// Live connection by id. `None` once removed.
    pub fn get(&self, id: ConnId) -> Option<&T> {
        self.entries.get(&id)
    }

    /// Mutable live connection by id.
    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut T> {
        self.entries.get_mut(&id)
    }

    /// Whether `id` is live.
    pub fn contains(&self, id: ConnId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Snapshot of the live ids.
    pub fn ids(&self) -> Vec<ConnId> {
        self.entries.keys().copied().collect()
    }

    /// Live connections in id order.
    pub fn iter(&self) -> impl Iterator<Item = (ConnId, &T)> {
        self.entries.iter().map(|(id, v)| (*id, v))
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no connection is live.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
