//! Per-connection bookkeeping.
//!
//! A [`Connection`] ties together the state machine, the reliability queues
//! and the route negotiation for one remote peer. All mutation happens
//! through the endpoint, which owns the records; this module only exposes a
//! read-only [`ConnectionInfo`] snapshot to applications.

use std::time::Instant;

use crate::config::Config;
use crate::connection::ConnectionState;
use crate::core::PeerId;
use crate::events::ConnectionEvent;
use crate::registry::{ConnectionHandle, ListenSocketHandle};
use crate::reliability::{InboundQueue, OutboundQueue};
use crate::rendezvous::{RendezvousCoordinator, RoutePath};

/// Read-only snapshot of a connection's status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// The remote peer.
    pub peer: PeerId,
    /// Virtual port the connection was dialed to or accepted on.
    pub virtual_port: u16,
    /// Current state.
    pub state: ConnectionState,
    /// Negotiated path, once the connection reached `Connected`.
    pub route: Option<RoutePath>,
    /// Close reason once the connection reached a terminal state.
    pub end_reason: i32,
    /// Bytes queued locally but not yet acknowledged or transmitted.
    pub pending_send_bytes: usize,
}

/// State for one connection to a remote peer.
#[derive(Debug)]
pub(crate) struct Connection {
    pub(crate) handle: ConnectionHandle,
    pub(crate) peer: PeerId,
    pub(crate) virtual_port: u16,
    /// Connection token carried by every datagram frame; the initiator's
    /// token is canonical.
    pub(crate) token: u64,
    pub(crate) state: ConnectionState,
    pub(crate) initiator: bool,
    pub(crate) route: Option<RoutePath>,
    pub(crate) outbound: OutboundQueue,
    pub(crate) inbound: InboundQueue,
    /// Present while the connection is in `FindingRoute`.
    pub(crate) rendezvous: Option<RendezvousCoordinator>,
    /// Handshake must complete before this instant.
    pub(crate) connect_deadline: Instant,
    pub(crate) end_reason: i32,
    /// Peer candidates that arrived before this side entered `FindingRoute`.
    pub(crate) pending_candidates: Option<(bool, u64)>,
    /// The application closed the connection; the handle is invalid but the
    /// record may linger to drain reliable data.
    pub(crate) app_closed: bool,
    /// Set when the application closed with linger and reliable data was
    /// still pending; the record is dropped once drained or expired.
    pub(crate) lingering_until: Option<Instant>,
    /// Listen socket that produced this connection, for inbound ones.
    pub(crate) listen_socket: Option<ListenSocketHandle>,
}

impl Connection {
    pub(crate) fn new_at(
        now: Instant,
        cfg: &Config,
        handle: ConnectionHandle,
        peer: PeerId,
        virtual_port: u16,
        token: u64,
        initiator: bool,
        listen_socket: Option<ListenSocketHandle>,
    ) -> Self {
        Self {
            handle,
            peer,
            virtual_port,
            token,
            state: ConnectionState::None,
            initiator,
            route: None,
            outbound: OutboundQueue::new(cfg),
            inbound: InboundQueue::new(cfg.max_inbound_queue),
            rendezvous: None,
            connect_deadline: now + cfg.connect_timeout,
            end_reason: 0,
            pending_candidates: None,
            app_closed: false,
            lingering_until: None,
            listen_socket,
        }
    }

    /// Apply a state transition, producing the event to dispatch.
    ///
    /// Invalid transitions are rejected and logged; the caller's code paths
    /// should never request one.
    pub(crate) fn transition_to(
        &mut self,
        new_state: ConnectionState,
        end_reason: i32,
    ) -> Option<ConnectionEvent> {
        if !self.state.can_transition_to(new_state) {
            tracing::warn!(
                connection = %self.handle,
                from = %self.state,
                to = %new_state,
                "rejected invalid state transition"
            );
            return None;
        }
        let old_state = self.state;
        self.state = new_state;
        if new_state.is_quasi_terminal() {
            self.end_reason = end_reason;
        }
        tracing::debug!(
            connection = %self.handle,
            peer = %self.peer,
            %old_state,
            %new_state,
            "connection state changed"
        );
        Some(ConnectionEvent {
            connection: self.handle,
            peer: self.peer,
            old_state,
            new_state,
            end_reason: self.end_reason,
        })
    }

    pub(crate) fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            peer: self.peer,
            virtual_port: self.virtual_port,
            state: self.state,
            route: self.route,
            end_reason: self.end_reason,
            pending_send_bytes: self.outbound.queued_bytes(),
        }
    }
}

/// State for one listen socket.
#[derive(Debug)]
pub(crate) struct ListenSocket {
    pub(crate) virtual_port: u16,
    /// Inbound connections awaiting an accept or reject decision.
    pub(crate) pending: Vec<ConnectionHandle>,
}

impl ListenSocket {
    pub(crate) fn new(virtual_port: u16) -> Self {
        Self {
            virtual_port,
            pending: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Handle;

    fn connection() -> Connection {
        Connection::new_at(
            Instant::now(),
            &Config::new(),
            ConnectionHandle::from_raw(1),
            PeerId::new(9),
            0,
            0xfeed,
            true,
            None,
        )
    }

    #[test]
    fn test_transition_emits_event() {
        let mut conn = connection();
        let ev = conn.transition_to(ConnectionState::Connecting, 0).unwrap();
        assert_eq!(ev.old_state, ConnectionState::None);
        assert_eq!(ev.new_state, ConnectionState::Connecting);
        assert_eq!(conn.state, ConnectionState::Connecting);
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let mut conn = connection();
        assert!(conn.transition_to(ConnectionState::Connected, 0).is_none());
        assert_eq!(conn.state, ConnectionState::None);
    }

    #[test]
    fn test_end_reason_recorded_on_terminal_state() {
        let mut conn = connection();
        conn.transition_to(ConnectionState::Connecting, 0);
        let ev = conn
            .transition_to(ConnectionState::ClosedByPeer, 1003)
            .unwrap();
        assert_eq!(ev.end_reason, 1003);
        assert_eq!(conn.info().end_reason, 1003);
    }
}
