//! Protocol constants for the TETHER transport.
//!
//! Defaults for tunable values live in [`crate::config::Config`]; the values
//! here are fixed by the wire protocol or shared as configuration defaults.

use std::time::Duration;

// =============================================================================
// HANDLES
// =============================================================================

/// The invalid handle sentinel. No live connection or listen socket ever
/// carries this value.
pub const INVALID_HANDLE: u32 = 0;

// =============================================================================
// FRAME TYPES (datagram substrate)
// =============================================================================

/// Data frame (application payload, possibly one fragment of a message).
pub const FRAME_TYPE_DATA: u8 = 0x01;

/// Acknowledgment frame (cumulative + selective bitmap).
pub const FRAME_TYPE_ACK: u8 = 0x02;

/// Route probe (tests whether a candidate path carries traffic).
pub const FRAME_TYPE_ROUTE_PROBE: u8 = 0x03;

/// Route probe reply.
pub const FRAME_TYPE_ROUTE_REPLY: u8 = 0x04;

/// Close frame (graceful termination, carries an application reason code).
pub const FRAME_TYPE_CLOSE: u8 = 0x05;

// =============================================================================
// SIGNAL TYPES (rendezvous / signaling channel)
// =============================================================================

/// Connection request, sent through the signaling channel before any route
/// exists.
pub const SIGNAL_TYPE_CONNECT_REQUEST: u8 = 0x10;

/// Connection accepted by the remote application.
pub const SIGNAL_TYPE_CONNECT_ACCEPT: u8 = 0x11;

/// Connection rejected (carries a reason code).
pub const SIGNAL_TYPE_CONNECT_REJECT: u8 = 0x12;

/// Route candidates (direct reachability flag plus optional relay ticket).
pub const SIGNAL_TYPE_CANDIDATES: u8 = 0x13;

// =============================================================================
// DATA FRAME FLAGS
// =============================================================================

/// Payload is part of a reliable message (sequenced, retransmitted).
pub const DATA_FLAG_RELIABLE: u8 = 0x01;

// =============================================================================
// SIZES
// =============================================================================

/// Data frame header size: type + token + flags + seq + frag_index + frag_count.
pub const DATA_FRAME_HEADER_SIZE: usize = 1 + 8 + 1 + 4 + 2 + 2;

/// Recommended maximum payload per datagram fragment (MTU-safe).
pub const DEFAULT_MTU_PAYLOAD: usize = 1200;

/// Maximum size of a single message handed to `send` (default).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 512 * 1024;

/// Default per-connection outbound buffer limit in bytes.
pub const DEFAULT_SEND_BUFFER_LIMIT: usize = 512 * 1024;

/// Default per-connection unacknowledged-byte window.
pub const DEFAULT_SEND_WINDOW: usize = 128 * 1024;

/// Largest permitted `mtu_payload`: a frame body must fit the 16-bit length
/// prefix used when frames are packed into a datagram.
pub const MAX_MTU_PAYLOAD: usize = u16::MAX as usize - DATA_FRAME_HEADER_SIZE;

// =============================================================================
// TIMING DEFAULTS
// =============================================================================

/// Initial retransmission timeout before the first RTT sample.
pub const INITIAL_RTO: Duration = Duration::from_millis(1000);

/// Minimum retransmission timeout.
pub const MIN_RTO: Duration = Duration::from_millis(100);

/// Maximum retransmission timeout.
pub const MAX_RTO: Duration = Duration::from_millis(60000);

/// Retransmission backoff multiplier.
pub const RETRANSMIT_BACKOFF: u32 = 2;

/// Maximum retransmission attempts before the connection is considered broken.
pub const MAX_RETRANSMITS: u32 = 10;

/// Default Nagle coalescing delay for small sends.
pub const DEFAULT_NAGLE_DELAY: Duration = Duration::from_millis(5);

/// Default queued-byte threshold above which a NoDelay send is dropped.
pub const DEFAULT_NO_DELAY_QUEUE_LIMIT: usize = 16 * 1024;

/// Default best-effort drain window for a lingering close.
pub const DEFAULT_LINGER_TIMEOUT: Duration = Duration::from_secs(3);

/// Default overall route-negotiation deadline.
pub const DEFAULT_RENDEZVOUS_TIMEOUT: Duration = Duration::from_secs(10);

/// Default deadline for the full connect attempt (handshake + rendezvous).
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Default interval between route probes.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_millis(500);

/// Default number of direct-path probes before falling back to the relay.
pub const DEFAULT_DIRECT_PROBE_ATTEMPTS: u32 = 3;

// =============================================================================
// QUEUE BOUNDS
// =============================================================================

/// Default cap on queued inbound messages per connection.
pub const DEFAULT_MAX_INBOUND_QUEUE: usize = 1024;

/// Default cap on undelivered state-change events.
pub const DEFAULT_MAX_PENDING_EVENTS: usize = 256;

/// How far ahead of the next expected sequence an out-of-order fragment may
/// sit before it is discarded. Comfortably above the largest span the send
/// window can legitimately produce, so only a misbehaving peer hits it.
pub const MAX_REORDER_FRAGMENTS: u32 = 1 << 18;

// =============================================================================
// END REASONS
// =============================================================================
// Codes below 1000 are reserved for the transport itself; applications pass
// their own codes (>= 1000) to `close_connection`.

/// No reason recorded.
pub const REASON_NONE: i32 = 0;

/// No listen socket was bound to the dialed virtual port.
pub const REASON_NO_LISTENER: i32 = 1;

/// The identity provider refused the inbound peer.
pub const REASON_NOT_AUTHORIZED: i32 = 2;

/// The connect attempt did not complete before the deadline.
pub const REASON_CONNECT_TIMEOUT: i32 = 3;

/// Route negotiation failed on every candidate path.
pub const REASON_ROUTE_FAILED: i32 = 4;

/// A reliable fragment exhausted its retransmission budget.
pub const REASON_RETRANSMIT_LIMIT: i32 = 5;

/// The inbound queue overflowed while holding reliable data.
pub const REASON_QUEUE_OVERFLOW: i32 = 6;
