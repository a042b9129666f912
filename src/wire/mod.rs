//! Wire formats: datagram frames and signaling messages.

mod frame;
mod signal;

pub use frame::{pack_frames, unpack_frames, Frame};
pub use signal::Signal;
