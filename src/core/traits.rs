//! Collaborator seams for the TETHER transport.
//!
//! The core does not implement packet I/O, rendezvous signaling, or
//! identity/auth. It reaches them through these narrow interfaces, which the
//! embedding layer (or the bundled [`crate::driver`]) supplies.

use crate::core::identity::PeerId;
use crate::events::ConnectionEvent;

/// Unreliable datagram substrate.
///
/// Implementations must be non-blocking and best-effort: a datagram handed to
/// [`send_datagram`](PacketTransport::send_datagram) may be lost, duplicated,
/// or reordered, and the transport layer above is built to tolerate that.
pub trait PacketTransport: Send + Sync {
    /// Send one datagram toward a peer over the given path.
    ///
    /// `relayed` selects the fallback relay path negotiated during
    /// rendezvous instead of the direct route.
    fn send_datagram(&self, to: PeerId, relayed: bool, payload: &[u8]);

    /// Whether a direct path to `peer` is worth probing.
    fn direct_reachable(&self, peer: PeerId) -> bool {
        let _ = peer;
        true
    }

    /// Relay ticket advertised to `peer` during rendezvous; zero when no
    /// relay path is available.
    fn relay_ticket(&self, peer: PeerId) -> u64 {
        let _ = peer;
        0
    }
}

/// Rendezvous/relay signaling channel.
///
/// Carries the small control messages (connect requests, route candidates)
/// that must flow before any direct route exists. Assumed reliable enough for
/// control traffic but slow; never used for application payload.
pub trait SignalingChannel: Send + Sync {
    /// Deliver an encoded signal to a peer through the out-of-band channel.
    fn send_signal(&self, to: PeerId, payload: &[u8]);
}

/// Identity and authorization provider.
pub trait IdentityProvider: Send + Sync {
    /// The local peer's identity.
    fn local_identity(&self) -> PeerId;

    /// Whether an inbound connection attempt from `peer` may proceed to the
    /// application. Rejected peers receive a connect-reject signal.
    fn authorize_peer(&self, peer: PeerId) -> bool {
        let _ = peer;
        true
    }
}

/// Observer for connection state changes.
///
/// Registered once at endpoint construction and not swappable afterward.
/// Events for one connection arrive in the order the transitions occurred;
/// no cross-connection ordering is guaranteed. The callback runs with no
/// transport locks held, so it may safely call back into the endpoint.
pub trait ConnectionObserver: Send + Sync {
    /// Called once per state transition.
    fn on_state_changed(&self, event: &ConnectionEvent);
}
