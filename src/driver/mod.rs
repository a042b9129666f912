//! Tokio-backed driver: a UDP packet transport and a background task that
//! pumps inbound datagrams and endpoint timers.
//!
//! The core is I/O-free; this module is the bundled way to run it. Gated
//! behind the `driver` feature so embedders with their own runtime can
//! depend on the core alone.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::net::UdpSocket;

use crate::core::{PacketTransport, PeerId};
use crate::endpoint::Endpoint;

/// Fallback poll interval when no timer is armed.
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Default, Clone, Copy)]
struct PeerRoutes {
    direct: Option<SocketAddr>,
    relay: Option<SocketAddr>,
}

/// [`PacketTransport`] over one UDP socket with a per-peer route table.
///
/// Route discovery itself (how a peer's addresses become known) is out of
/// scope: the embedder installs addresses with [`set_direct_route`] and
/// [`set_relay_route`], typically from the same directory service that
/// carries the signaling.
///
/// [`set_direct_route`]: UdpTransport::set_direct_route
/// [`set_relay_route`]: UdpTransport::set_relay_route
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    routes: Mutex<HashMap<PeerId, PeerRoutes>>,
}

impl UdpTransport {
    /// Wrap a bound UDP socket.
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self {
            socket,
            routes: Mutex::new(HashMap::new()),
        }
    }

    /// The underlying socket.
    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    fn routes(&self) -> MutexGuard<'_, HashMap<PeerId, PeerRoutes>> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install or replace the direct address for a peer.
    pub fn set_direct_route(&self, peer: PeerId, addr: SocketAddr) {
        self.routes().entry(peer).or_default().direct = Some(addr);
    }

    /// Install or replace the relay address for a peer.
    pub fn set_relay_route(&self, peer: PeerId, addr: SocketAddr) {
        self.routes().entry(peer).or_default().relay = Some(addr);
    }

    /// Forget every route for a peer.
    pub fn clear_routes(&self, peer: PeerId) {
        self.routes().remove(&peer);
    }

    /// Reverse lookup for inbound datagrams: which peer and path does a
    /// source address belong to?
    pub fn route_for(&self, addr: SocketAddr) -> Option<(PeerId, bool)> {
        let routes = self.routes();
        for (&peer, r) in routes.iter() {
            if r.direct == Some(addr) {
                return Some((peer, false));
            }
            if r.relay == Some(addr) {
                return Some((peer, true));
            }
        }
        None
    }
}

impl PacketTransport for UdpTransport {
    fn send_datagram(&self, to: PeerId, relayed: bool, payload: &[u8]) {
        let addr = {
            let routes = self.routes();
            let Some(r) = routes.get(&to) else {
                tracing::debug!(peer = %to, "no route for peer, dropping datagram");
                return;
            };
            if relayed { r.relay } else { r.direct }
        };
        let Some(addr) = addr else {
            tracing::debug!(peer = %to, relayed, "requested path unavailable, dropping datagram");
            return;
        };
        // Best effort: a full socket buffer is the same as packet loss.
        if let Err(err) = self.socket.try_send_to(payload, addr) {
            tracing::trace!(peer = %to, %addr, %err, "datagram send failed");
        }
    }

    fn direct_reachable(&self, peer: PeerId) -> bool {
        self.routes().get(&peer).is_some_and(|r| r.direct.is_some())
    }

    fn relay_ticket(&self, peer: PeerId) -> u64 {
        let addr = self.routes().get(&peer).and_then(|r| r.relay);
        match addr {
            Some(addr) => {
                let mut hasher = DefaultHasher::new();
                addr.hash(&mut hasher);
                hasher.finish().max(1)
            }
            None => 0,
        }
    }
}

/// Spawn the background task that feeds inbound datagrams into the endpoint
/// and runs its timers.
///
/// The task runs until aborted via the returned handle.
pub fn spawn_driver(
    endpoint: Arc<Endpoint>,
    transport: Arc<UdpTransport>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];
        loop {
            let deadline = endpoint.next_deadline();
            tokio::select! {
                received = transport.socket().recv_from(&mut buf) => {
                    match received {
                        Ok((len, addr)) => match transport.route_for(addr) {
                            Some((peer, relayed)) => {
                                endpoint.handle_datagram(peer, relayed, &buf[..len]);
                            }
                            None => tracing::trace!(%addr, "datagram from unknown address"),
                        },
                        Err(err) => tracing::warn!(%err, "udp receive failed"),
                    }
                }
                _ = sleep_until_deadline(deadline) => {}
            }
            endpoint.poll();
        }
    })
}

async fn sleep_until_deadline(deadline: Option<std::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => tokio::time::sleep(IDLE_POLL_INTERVAL).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_route_table() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let transport = UdpTransport::new(socket);

        let peer = PeerId::new(7);
        let direct: SocketAddr = "10.0.0.1:4000".parse().unwrap();
        let relay: SocketAddr = "10.0.0.2:5000".parse().unwrap();

        assert!(!transport.direct_reachable(peer));
        assert_eq!(transport.relay_ticket(peer), 0);

        transport.set_direct_route(peer, direct);
        transport.set_relay_route(peer, relay);

        assert!(transport.direct_reachable(peer));
        assert_ne!(transport.relay_ticket(peer), 0);
        assert_eq!(transport.route_for(direct), Some((peer, false)));
        assert_eq!(transport.route_for(relay), Some((peer, true)));

        transport.clear_routes(peer);
        assert_eq!(transport.route_for(direct), None);
    }
}
