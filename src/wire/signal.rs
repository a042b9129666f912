//! Wire format for the rendezvous signaling channel.
//!
//! Signals carry the handshake and route negotiation that must happen before
//! any datagram route exists: connect request/accept/reject and route
//! candidates. They travel through the external [`SignalingChannel`]
//! collaborator, one signal per payload.
//!
//! [`SignalingChannel`]: crate::core::SignalingChannel

use super::frame::Reader;
use crate::core::constants::{
    SIGNAL_TYPE_CANDIDATES, SIGNAL_TYPE_CONNECT_ACCEPT, SIGNAL_TYPE_CONNECT_REJECT,
    SIGNAL_TYPE_CONNECT_REQUEST,
};
use crate::core::{PeerId, WireError};

/// One message on the signaling channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// Ask the remote peer to open a connection.
    ConnectRequest {
        /// Identity of the initiating peer.
        from: PeerId,
        /// Virtual port the initiator is dialing.
        virtual_port: u16,
        /// Connection token proposed by the initiator; canonical for the
        /// connection once accepted.
        token: u64,
    },

    /// The remote application accepted the connection.
    ConnectAccept {
        /// Token from the matching request.
        token: u64,
    },

    /// The remote side rejected or tore down the pending connection.
    ConnectReject {
        /// Token from the matching request.
        token: u64,
        /// Application-defined reason code.
        reason: i32,
    },

    /// Route candidates for rendezvous: whether the sender believes it is
    /// directly reachable, plus an optional relay ticket (zero when absent).
    Candidates {
        /// Connection token.
        token: u64,
        /// Direct path may work and should be probed first.
        direct: bool,
        /// Relay ticket for the fallback path; zero means none.
        relay_ticket: u64,
    },
}

impl Signal {
    /// Encode into a standalone signaling payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Signal::ConnectRequest {
                from,
                virtual_port,
                token,
            } => {
                buf.push(SIGNAL_TYPE_CONNECT_REQUEST);
                buf.extend_from_slice(&from.raw().to_le_bytes());
                buf.extend_from_slice(&virtual_port.to_le_bytes());
                buf.extend_from_slice(&token.to_le_bytes());
            }
            Signal::ConnectAccept { token } => {
                buf.push(SIGNAL_TYPE_CONNECT_ACCEPT);
                buf.extend_from_slice(&token.to_le_bytes());
            }
            Signal::ConnectReject { token, reason } => {
                buf.push(SIGNAL_TYPE_CONNECT_REJECT);
                buf.extend_from_slice(&token.to_le_bytes());
                buf.extend_from_slice(&reason.to_le_bytes());
            }
            Signal::Candidates {
                token,
                direct,
                relay_ticket,
            } => {
                buf.push(SIGNAL_TYPE_CANDIDATES);
                buf.extend_from_slice(&token.to_le_bytes());
                buf.push(u8::from(*direct));
                buf.extend_from_slice(&relay_ticket.to_le_bytes());
            }
        }
        buf
    }

    /// Decode one signaling payload.
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(data);
        let signal = match r.u8()? {
            SIGNAL_TYPE_CONNECT_REQUEST => Signal::ConnectRequest {
                from: PeerId::new(r.u64()?),
                virtual_port: r.u16()?,
                token: r.u64()?,
            },
            SIGNAL_TYPE_CONNECT_ACCEPT => Signal::ConnectAccept { token: r.u64()? },
            SIGNAL_TYPE_CONNECT_REJECT => Signal::ConnectReject {
                token: r.u64()?,
                reason: r.i32()?,
            },
            SIGNAL_TYPE_CANDIDATES => Signal::Candidates {
                token: r.u64()?,
                direct: r.u8()? != 0,
                relay_ticket: r.u64()?,
            },
            other => return Err(WireError::UnknownType(other)),
        };
        Ok(signal)
    }
}
