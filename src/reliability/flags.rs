//! Send flags.
//!
//! The original bit-combinable flags are modeled as independent boolean
//! capabilities validated together, so illegal combinations are rejected at
//! the call site instead of silently misbehaving.

use crate::core::TransportError;

/// How a message should be sent.
///
/// Flags combine freely except where [`validate`](SendFlags::validate)
/// rejects them: `reliable` together with `no_delay` is invalid, because a
/// message that must not wait cannot also be retransmitted until
/// acknowledged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendFlags {
    /// Fragment/reassemble, retransmit until acknowledged, deliver in order.
    /// Without it the message is best-effort: it can be lost and carries no
    /// ordering guarantee.
    pub reliable: bool,

    /// Bypass the Nagle coalescing delay for this message and flush anything
    /// currently held by the Nagle timer.
    pub no_nagle: bool,

    /// Drop the message (reporting `Ignored`) if it cannot be placed on the
    /// wire quickly: the connection is not fully connected, or the outbound
    /// backlog exceeds the configured threshold. Unreliable only.
    pub no_delay: bool,

    /// Perform the wire-transmission step synchronously on the calling
    /// thread when data is immediately sendable, instead of deferring to the
    /// background context.
    pub use_current_thread: bool,
}

impl SendFlags {
    /// Unreliable, Nagle-coalesced. The default.
    pub const UNRELIABLE: Self = Self {
        reliable: false,
        no_nagle: false,
        no_delay: false,
        use_current_thread: false,
    };

    /// Unreliable, sent (or dropped) without the Nagle delay.
    pub const UNRELIABLE_NO_NAGLE: Self = Self {
        no_nagle: true,
        ..Self::UNRELIABLE
    };

    /// Unreliable, dropped if not sendable quickly. Implies `no_nagle`.
    pub const UNRELIABLE_NO_DELAY: Self = Self {
        no_nagle: true,
        no_delay: true,
        ..Self::UNRELIABLE
    };

    /// Reliable, Nagle-coalesced.
    pub const RELIABLE: Self = Self {
        reliable: true,
        no_nagle: false,
        no_delay: false,
        use_current_thread: false,
    };

    /// Reliable, bypassing the Nagle delay.
    pub const RELIABLE_NO_NAGLE: Self = Self {
        no_nagle: true,
        ..Self::RELIABLE
    };

    /// Add `use_current_thread` to this flag set.
    pub const fn on_current_thread(mut self) -> Self {
        self.use_current_thread = true;
        self
    }

    /// Reject invalid combinations.
    pub fn validate(self) -> Result<(), TransportError> {
        if self.reliable && self.no_delay {
            return Err(TransportError::InvalidParam(
                "NoDelay is only valid for unreliable sends",
            ));
        }
        Ok(())
    }
}
