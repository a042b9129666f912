//! Error types for the TETHER transport.

use thiserror::Error;

/// Errors returned synchronously by the public transport operations.
///
/// Failures detected on a background context (route failure, peer
/// disruption, timeout) never surface here; they appear as state
/// transitions plus the corresponding connection event.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Bad handle, oversized payload, or invalid flag combination.
    #[error("invalid parameter: {0}")]
    InvalidParam(&'static str),

    /// The operation is not valid for the current connection state.
    #[error("operation not valid in the current connection state")]
    InvalidState,

    /// The connection has ended (closed by peer or a local problem).
    #[error("connection has ended")]
    NoConnection,

    /// Outbound queue or buffer capacity exceeded.
    #[error("send buffer limit exceeded")]
    LimitExceeded,

    /// Receive buffer too small for the next queued message.
    ///
    /// The message is dropped from the queue either way; `required` reports
    /// the size the caller's buffer would have needed.
    #[error("receive buffer too small: next message requires {required} bytes")]
    BufferTooSmall {
        /// Exact size of the message that was dropped.
        required: usize,
    },
}

/// Non-error outcome of `send` and `flush`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The message was queued (or put on the wire) for delivery.
    Queued,
    /// The operation was dropped by policy, not an error: a NoDelay send
    /// that could not be placed on the wire quickly, or a flush with
    /// nothing eligible to flush.
    Ignored,
}

/// Errors decoding frames or signals off the wire.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Buffer ended before the frame did.
    #[error("unexpected end of data")]
    UnexpectedEof,

    /// Unknown frame or signal type tag.
    #[error("unknown frame type: {0:#04x}")]
    UnknownType(u8),

    /// A length field disagrees with the buffer.
    #[error("inconsistent length field")]
    BadLength,
}
