//! Core types: constants, errors, identity, and collaborator traits.

pub mod constants;
mod error;
mod identity;
mod traits;

pub use error::{SendOutcome, TransportError, WireError};
pub use identity::PeerId;
pub use traits::{ConnectionObserver, IdentityProvider, PacketTransport, SignalingChannel};
