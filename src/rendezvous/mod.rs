//! Route negotiation (rendezvous) for peer-to-peer connections.
//!
//! After the application-level handshake, the peers exchange route
//! candidates through the signaling channel and probe paths on the datagram
//! substrate: the direct route first, then the relay fallback. Success and
//! failure feed back into the connection state machine as
//! `FindingRoute -> Connected` or `FindingRoute -> ProblemDetectedLocally`.
//!
//! The coordinator is a poll-driven state machine: the endpoint feeds it
//! candidates and probe replies, and `poll_at` tells the endpoint which
//! probes to put on the wire.

use std::time::{Duration, Instant};

use crate::config::Config;
use crate::core::PeerId;

/// Which path a connection ended up using.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutePath {
    /// Peers talk directly.
    Direct,
    /// Traffic flows through the negotiated relay.
    Relayed,
}

/// Where the negotiation currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendezvousStatus {
    /// Still exchanging candidates or probing paths.
    Negotiating,
    /// A usable route was confirmed.
    Established(RoutePath),
    /// No route could be established before the deadline.
    Failed,
}

/// Probe the endpoint must put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeRequest {
    /// Echo token carried by the probe.
    pub probe: u64,
    /// Whether to send it along the relay path.
    pub relayed: bool,
}

/// Per-connection route negotiation state machine.
#[derive(Debug)]
pub struct RendezvousCoordinator {
    deadline: Instant,
    probe_interval: Duration,
    direct_attempts_left: u32,
    probe_token: u64,
    status: RendezvousStatus,

    /// Peer candidates; `None` until the Candidates signal arrives.
    peer_direct: Option<bool>,
    peer_relay_ticket: u64,

    last_probe_at: Option<Instant>,
    probing_relay: bool,
}

impl RendezvousCoordinator {
    /// Start a negotiation at `now` with a connection-unique probe token.
    pub fn new_at(now: Instant, cfg: &Config, probe_token: u64) -> Self {
        Self {
            deadline: now + cfg.rendezvous_timeout,
            probe_interval: cfg.probe_interval,
            direct_attempts_left: cfg.direct_probe_attempts,
            probe_token,
            status: RendezvousStatus::Negotiating,
            peer_direct: None,
            peer_relay_ticket: 0,
            last_probe_at: None,
            probing_relay: false,
        }
    }

    /// Record the peer's route candidates.
    pub fn on_candidates(&mut self, direct: bool, relay_ticket: u64) {
        if self.peer_direct.is_none() {
            self.peer_direct = Some(direct);
            self.peer_relay_ticket = relay_ticket;
        }
    }

    /// Record a probe reply. Returns the established path when the reply
    /// echoes our token and the negotiation completes.
    pub fn on_probe_reply(&mut self, probe: u64, relayed: bool) -> Option<RoutePath> {
        if probe != self.probe_token || self.status != RendezvousStatus::Negotiating {
            return None;
        }
        let path = if relayed {
            RoutePath::Relayed
        } else {
            RoutePath::Direct
        };
        self.status = RendezvousStatus::Established(path);
        tracing::debug!(?path, "route established");
        Some(path)
    }

    /// Advance the negotiation. Returns a probe to transmit, if one is due.
    ///
    /// After this call the status may have become `Failed`; the endpoint
    /// checks [`status`](Self::status) and transitions the connection.
    pub fn poll_at(&mut self, now: Instant) -> Option<ProbeRequest> {
        if self.status != RendezvousStatus::Negotiating {
            return None;
        }
        if now >= self.deadline {
            tracing::debug!("rendezvous deadline reached");
            self.status = RendezvousStatus::Failed;
            return None;
        }
        let Some(peer_direct) = self.peer_direct else {
            return None; // still waiting for candidates
        };

        let probe_due = self
            .last_probe_at
            .map_or(true, |last| now.duration_since(last) >= self.probe_interval);
        if !probe_due {
            return None;
        }

        if !self.probing_relay && peer_direct && self.direct_attempts_left > 0 {
            self.direct_attempts_left -= 1;
            self.last_probe_at = Some(now);
            return Some(ProbeRequest {
                probe: self.probe_token,
                relayed: false,
            });
        }

        if self.peer_relay_ticket != 0 {
            if !self.probing_relay {
                tracing::debug!("direct probes exhausted, falling back to relay");
                self.probing_relay = true;
            }
            self.last_probe_at = Some(now);
            return Some(ProbeRequest {
                probe: self.probe_token,
                relayed: true,
            });
        }

        // No path left to try.
        self.status = RendezvousStatus::Failed;
        None
    }

    /// Current negotiation status.
    pub fn status(&self) -> RendezvousStatus {
        self.status
    }

    /// Next instant at which [`poll_at`](Self::poll_at) has work.
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.status != RendezvousStatus::Negotiating {
            return None;
        }
        let next_probe = self.last_probe_at.map(|last| last + self.probe_interval);
        Some(next_probe.map_or(self.deadline, |p| p.min(self.deadline)))
    }
}

/// Symmetric-connect tie-break: when both peers dial each other
/// simultaneously, the peer with the lower identity keeps the initiator
/// role and its connection token becomes canonical. Deterministic on both
/// sides, so exactly one connection survives the race.
pub fn symmetric_initiator(local: PeerId, remote: PeerId) -> bool {
    local < remote
}
