//! Connection lifecycle states and the legal transition graph.

use std::fmt;

/// Lifecycle state of a connection.
///
/// States only move forward along the edges checked by
/// [`ConnectionState::can_transition_to`]; the quasi-terminal states
/// (`ClosedByPeer`, `ProblemDetectedLocally`) leave the graph only when the
/// record is removed by an explicit close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Dummy value indicating an error condition: the connection does not
    /// exist or has already been closed. Never a live state; used as the
    /// previous state in the event raised when a connection is created.
    None,

    /// Establishing whether the peers can and want to talk: handshake and
    /// basic auth in progress. For inbound connections this covers the
    /// ready-to-accept window before the application accepts. Sends are
    /// queued, not transmitted.
    Connecting,

    /// Handshake complete but no end-to-end route yet; route negotiation
    /// (direct probe, relay fallback) in progress. Sends are still queued.
    FindingRoute,

    /// End-to-end path confirmed; data flows.
    Connected,

    /// The remote peer closed the connection. Quasi-terminal: the inbound
    /// queue stays drainable until the handle is closed locally.
    ClosedByPeer,

    /// A disruption was detected locally (timeout, route failure,
    /// retransmission exhaustion). Quasi-terminal, same as `ClosedByPeer`.
    ProblemDetectedLocally,
}

impl ConnectionState {
    /// Whether the transition graph allows `self -> next`.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (None, Connecting)
                | (Connecting, FindingRoute)
                | (Connecting, ClosedByPeer)
                | (Connecting, ProblemDetectedLocally)
                | (FindingRoute, Connected)
                | (FindingRoute, ProblemDetectedLocally)
                | (Connected, ClosedByPeer)
                | (Connected, ProblemDetectedLocally)
        )
    }

    /// Whether new sends may be queued in this state.
    pub fn can_send(self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::FindingRoute | ConnectionState::Connected
        )
    }

    /// Whether the connection has ended but the record still exists.
    pub fn is_quasi_terminal(self) -> bool {
        matches!(
            self,
            ConnectionState::ClosedByPeer | ConnectionState::ProblemDetectedLocally
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::None => "None",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::FindingRoute => "FindingRoute",
            ConnectionState::Connected => "Connected",
            ConnectionState::ClosedByPeer => "ClosedByPeer",
            ConnectionState::ProblemDetectedLocally => "ProblemDetectedLocally",
        };
        f.write_str(name)
    }
}
