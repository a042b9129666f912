//! Reliability engine: send flags, outbound queueing with Nagle coalescing,
//! fragmentation and sliding-window retransmission, and inbound reassembly
//! with single-message retrieval.

mod flags;
mod inbound;
mod outbound;

pub use flags::SendFlags;
pub use inbound::{AbsorbResult, InboundQueue};
pub use outbound::OutboundQueue;

/// Serial-number ordering for fragment sequences: whether `a` comes before
/// `b` in the wrapping u32 space. Well-defined while live sequences span
/// less than half the space, which the send window guarantees.
pub(crate) fn seq_before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}
