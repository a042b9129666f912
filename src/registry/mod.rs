//! Handle allocation and the handle-keyed record registry.
//!
//! Handles are opaque non-zero integers; zero is the invalid sentinel. A
//! handle is unique among live records and is never reassigned while its
//! record is still in the registry.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::hash::Hash;

use crate::core::constants::INVALID_HANDLE;

/// Opaque handle to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle(pub(crate) u32);

/// Opaque handle to a listen socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenSocketHandle(pub(crate) u32);

/// Raw-integer view shared by both handle types.
pub trait Handle: Copy + Eq + Hash {
    /// Wrap a raw handle value.
    fn from_raw(raw: u32) -> Self;
    /// The raw handle value.
    fn raw(self) -> u32;
    /// Whether the handle is not the invalid sentinel.
    fn is_valid(self) -> bool {
        self.raw() != INVALID_HANDLE
    }
}

impl Handle for ConnectionHandle {
    fn from_raw(raw: u32) -> Self {
        Self(raw)
    }
    fn raw(self) -> u32 {
        self.0
    }
}

impl Handle for ListenSocketHandle {
    fn from_raw(raw: u32) -> Self {
        Self(raw)
    }
    fn raw(self) -> u32 {
        self.0
    }
}

impl ConnectionHandle {
    /// The invalid connection handle.
    pub const INVALID: Self = Self(INVALID_HANDLE);

    /// Whether the handle is not the invalid sentinel.
    pub fn is_valid(self) -> bool {
        Handle::is_valid(self)
    }
}

impl ListenSocketHandle {
    /// The invalid listen socket handle.
    pub const INVALID: Self = Self(INVALID_HANDLE);

    /// Whether the handle is not the invalid sentinel.
    pub fn is_valid(self) -> bool {
        Handle::is_valid(self)
    }
}

impl std::fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl std::fmt::Display for ListenSocketHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Handle-keyed record store with a monotonic allocator.
///
/// All operations are O(1) expected. Handle values may recycle after a
/// record is removed (the counter wraps), but never while the record lives.
#[derive(Debug)]
pub struct Registry<H: Handle, V> {
    records: HashMap<H, V>,
    next: u32,
}

impl<H: Handle, V> Registry<H, V> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            records: HashMap::new(),
            next: INVALID_HANDLE,
        }
    }

    /// Allocate a fresh handle: non-zero and distinct from every live handle.
    pub fn allocate(&mut self) -> H {
        loop {
            self.next = self.next.wrapping_add(1);
            if self.next == INVALID_HANDLE {
                continue;
            }
            let handle = H::from_raw(self.next);
            if !self.records.contains_key(&handle) {
                return handle;
            }
        }
    }

    /// Insert a record under a previously allocated handle.
    ///
    /// Returns the displaced record if the handle was already occupied
    /// (callers treat that as a logic error).
    pub fn insert(&mut self, handle: H, record: V) -> Option<V> {
        match self.records.entry(handle) {
            Entry::Occupied(mut slot) => Some(slot.insert(record)),
            Entry::Vacant(slot) => {
                slot.insert(record);
                None
            }
        }
    }

    /// Look up a record. Unknown or removed handles yield `None`.
    pub fn get(&self, handle: H) -> Option<&V> {
        self.records.get(&handle)
    }

    /// Mutable lookup.
    pub fn get_mut(&mut self, handle: H) -> Option<&mut V> {
        self.records.get_mut(&handle)
    }

    /// Remove and return a record.
    pub fn remove(&mut self, handle: H) -> Option<V> {
        self.records.remove(&handle)
    }

    /// Whether a handle refers to a live record.
    pub fn contains(&self, handle: H) -> bool {
        self.records.contains_key(&handle)
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Iterate over live records.
    pub fn iter(&self) -> impl Iterator<Item = (H, &V)> {
        self.records.iter().map(|(h, v)| (*h, v))
    }

    /// Live handles, collected (for iteration that mutates the registry).
    pub fn handles(&self) -> Vec<H> {
        self.records.keys().copied().collect()
    }
}

impl<H: Handle, V> Default for Registry<H, V> {
    fn default() -> Self {
        Self::new()
    }
}
