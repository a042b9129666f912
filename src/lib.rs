//! # TETHER Protocol
//!
//! **T**ransport for **E**stablishing **T**unnels between **H**osts over
//! **E**phemeral **R**outes
//!
//! TETHER is a connection-oriented, message-based transport between peers
//! identified by stable identities rather than addresses. It provides:
//!
//! - **Establishment**: dial-by-identity with listen sockets, explicit
//!   accept/reject, and symmetric connects that merge crossed dials
//! - **Rendezvous**: route negotiation over a signaling channel, probing the
//!   direct path first and falling back to a relay
//! - **Reliability**: per-message choice of reliable (fragmented,
//!   retransmitted, ordered) or unreliable best-effort delivery
//! - **Batching**: Nagle-style coalescing of small sends into fewer
//!   datagrams, with per-send opt-outs
//!
//! The core is I/O-free: packet I/O, signaling, and identity come in through
//! the traits in [`core`], and time comes in through explicit instants. The
//! `driver` feature bundles a tokio/UDP implementation.
//!
//! ## Feature Flags
//!
//! - `driver` (default): tokio-based UDP transport and background poll task
//!
//! ## Modules
//!
//! - [`core`]: identities, errors, constants, and collaborator traits
//! - [`endpoint`]: the public transport operations
//! - [`connection`]: connection states and status snapshots
//! - [`reliability`]: send flags and the delivery engine
//! - [`rendezvous`]: route negotiation
//! - [`wire`]: datagram and signaling wire formats
//! - [`driver`]: bundled tokio runtime glue (requires `driver` feature)
//!
//! ## Example Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use tether_protocol::prelude::*;
//!
//! // Collaborators wire the endpoint to the outside world. Real ones
//! // forward to a socket and a signaling service; these do nothing.
//! struct Discard;
//!
//! impl PacketTransport for Discard {
//!     fn send_datagram(&self, _to: PeerId, _relayed: bool, _payload: &[u8]) {}
//! }
//!
//! impl SignalingChannel for Discard {
//!     fn send_signal(&self, _to: PeerId, _payload: &[u8]) {}
//! }
//!
//! struct LocalPeer;
//!
//! impl IdentityProvider for LocalPeer {
//!     fn local_identity(&self) -> PeerId {
//!         PeerId::new(1)
//!     }
//! }
//!
//! let endpoint = Endpoint::new(
//!     Config::default(),
//!     Arc::new(Discard),
//!     Arc::new(Discard),
//!     Arc::new(LocalPeer),
//! );
//!
//! // Listen for inbound connections and dial a peer by identity.
//! let listen = endpoint.create_listen_socket(7).unwrap();
//! let conn = endpoint.connect(PeerId::new(2), 7).unwrap();
//!
//! // Sends queue immediately; delivery starts once the connection is up.
//! endpoint.send(conn, b"hello", SendFlags::RELIABLE).unwrap();
//!
//! endpoint.close_connection(conn, 0, false);
//! endpoint.close_listen_socket(listen);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod config;
pub mod connection;
pub mod core;
pub mod endpoint;
pub mod events;
pub mod registry;
pub mod reliability;
pub mod rendezvous;
pub mod wire;

// Runtime glue (feature-gated)
#[cfg(feature = "driver")]
#[cfg_attr(docsrs, doc(cfg(feature = "driver")))]
pub mod driver;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::connection::{ConnectionInfo, ConnectionState};
    pub use crate::core::{
        ConnectionObserver, IdentityProvider, PacketTransport, PeerId, SendOutcome,
        SignalingChannel, TransportError,
    };
    pub use crate::endpoint::Endpoint;
    pub use crate::events::ConnectionEvent;
    pub use crate::registry::{ConnectionHandle, ListenSocketHandle};
    pub use crate::reliability::SendFlags;
    pub use crate::rendezvous::RoutePath;

    #[cfg(feature = "driver")]
    pub use crate::driver::{spawn_driver, UdpTransport};
}

// Re-export commonly used items at crate root
pub use config::Config;
pub use connection::ConnectionState;
pub use self::core::{PeerId, SendOutcome, TransportError};
pub use endpoint::Endpoint;
pub use reliability::SendFlags;
