//! Peer identity.

use std::fmt;

/// Opaque 64-bit peer identifier.
///
/// Assigned by the identity/auth provider, immutable and value-equal.
/// The transport never interprets the bits beyond equality, hashing,
/// and the deterministic ordering used by symmetric-connect tie-breaking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(u64);

impl PeerId {
    /// Wrap a raw 64-bit identity.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw 64-bit value.
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl From<u64> for PeerId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}
