//! Wire format for the datagram substrate.
//!
//! Every frame starts with a one-byte type tag followed by the 64-bit
//! connection token assigned during the handshake, so a single datagram
//! socket can demultiplex traffic for many connections. All integers are
//! little-endian.
//!
//! Datagrams may carry several frames back to back (this is how Nagle
//! coalescing actually merges small sends into fewer packets); each frame is
//! prefixed with a 16-bit length when packed.

use crate::core::constants::{
    DATA_FLAG_RELIABLE, FRAME_TYPE_ACK, FRAME_TYPE_CLOSE, FRAME_TYPE_DATA,
    FRAME_TYPE_ROUTE_PROBE, FRAME_TYPE_ROUTE_REPLY,
};
use crate::core::WireError;

/// One frame on the datagram substrate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Application payload: a whole unreliable message, or one fragment of a
    /// reliable message.
    Data {
        /// Connection token.
        token: u64,
        /// Whether this fragment belongs to a reliable message.
        reliable: bool,
        /// Fragment sequence number (reliable only; zero for unreliable).
        seq: u32,
        /// Index of this fragment within its message.
        frag_index: u16,
        /// Total fragments in the message.
        frag_count: u16,
        /// Fragment payload.
        payload: Vec<u8>,
    },

    /// Acknowledgment: all fragments below `next_expected` received, plus a
    /// selective bitmap where bit `i` acknowledges `next_expected + i`.
    Ack {
        /// Connection token.
        token: u64,
        /// Lowest fragment sequence not yet received in order.
        next_expected: u32,
        /// Selective acknowledgment bitmap above `next_expected`.
        bitmap: u32,
    },

    /// Route probe sent while negotiating a usable path.
    RouteProbe {
        /// Connection token.
        token: u64,
        /// Echo token identifying this probe.
        probe: u64,
        /// Whether the probe traveled the relay path.
        relayed: bool,
    },

    /// Reply to a route probe, echoing its token.
    RouteReply {
        /// Connection token.
        token: u64,
        /// Echoed probe token.
        probe: u64,
        /// Whether the probed path was the relay path.
        relayed: bool,
    },

    /// Graceful close carrying the application reason code.
    Close {
        /// Connection token.
        token: u64,
        /// Application-defined close reason.
        reason: i32,
    },
}

impl Frame {
    /// Connection token carried by this frame.
    pub fn token(&self) -> u64 {
        match *self {
            Frame::Data { token, .. }
            | Frame::Ack { token, .. }
            | Frame::RouteProbe { token, .. }
            | Frame::RouteReply { token, .. }
            | Frame::Close { token, .. } => token,
        }
    }

    /// Encode into `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Frame::Data {
                token,
                reliable,
                seq,
                frag_index,
                frag_count,
                payload,
            } => {
                buf.push(FRAME_TYPE_DATA);
                buf.extend_from_slice(&token.to_le_bytes());
                buf.push(if *reliable { DATA_FLAG_RELIABLE } else { 0 });
                buf.extend_from_slice(&seq.to_le_bytes());
                buf.extend_from_slice(&frag_index.to_le_bytes());
                buf.extend_from_slice(&frag_count.to_le_bytes());
                buf.extend_from_slice(payload);
            }
            Frame::Ack {
                token,
                next_expected,
                bitmap,
            } => {
                buf.push(FRAME_TYPE_ACK);
                buf.extend_from_slice(&token.to_le_bytes());
                buf.extend_from_slice(&next_expected.to_le_bytes());
                buf.extend_from_slice(&bitmap.to_le_bytes());
            }
            Frame::RouteProbe {
                token,
                probe,
                relayed,
            } => {
                buf.push(FRAME_TYPE_ROUTE_PROBE);
                buf.extend_from_slice(&token.to_le_bytes());
                buf.extend_from_slice(&probe.to_le_bytes());
                buf.push(u8::from(*relayed));
            }
            Frame::RouteReply {
                token,
                probe,
                relayed,
            } => {
                buf.push(FRAME_TYPE_ROUTE_REPLY);
                buf.extend_from_slice(&token.to_le_bytes());
                buf.extend_from_slice(&probe.to_le_bytes());
                buf.push(u8::from(*relayed));
            }
            Frame::Close { token, reason } => {
                buf.push(FRAME_TYPE_CLOSE);
                buf.extend_from_slice(&token.to_le_bytes());
                buf.extend_from_slice(&reason.to_le_bytes());
            }
        }
    }

    /// Decode a single frame from `data`, consuming the whole slice.
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(data);
        let frame = match r.u8()? {
            FRAME_TYPE_DATA => {
                let token = r.u64()?;
                let flags = r.u8()?;
                let seq = r.u32()?;
                let frag_index = r.u16()?;
                let frag_count = r.u16()?;
                if frag_count == 0 || frag_index >= frag_count {
                    return Err(WireError::BadLength);
                }
                Frame::Data {
                    token,
                    reliable: flags & DATA_FLAG_RELIABLE != 0,
                    seq,
                    frag_index,
                    frag_count,
                    payload: r.rest().to_vec(),
                }
            }
            FRAME_TYPE_ACK => Frame::Ack {
                token: r.u64()?,
                next_expected: r.u32()?,
                bitmap: r.u32()?,
            },
            FRAME_TYPE_ROUTE_PROBE => Frame::RouteProbe {
                token: r.u64()?,
                probe: r.u64()?,
                relayed: r.u8()? != 0,
            },
            FRAME_TYPE_ROUTE_REPLY => Frame::RouteReply {
                token: r.u64()?,
                probe: r.u64()?,
                relayed: r.u8()? != 0,
            },
            FRAME_TYPE_CLOSE => Frame::Close {
                token: r.u64()?,
                reason: r.i32()?,
            },
            other => return Err(WireError::UnknownType(other)),
        };
        Ok(frame)
    }

    /// Encoded size in bytes, without the packing length prefix.
    pub fn encoded_len(&self) -> usize {
        match self {
            Frame::Data { payload, .. } => 1 + 8 + 1 + 4 + 2 + 2 + payload.len(),
            Frame::Ack { .. } => 1 + 8 + 4 + 4,
            Frame::RouteProbe { .. } | Frame::RouteReply { .. } => 1 + 8 + 8 + 1,
            Frame::Close { .. } => 1 + 8 + 4,
        }
    }
}

/// Pack frames into datagrams of at most `mtu` bytes each.
///
/// Frames are never split; a frame larger than `mtu` gets a datagram of its
/// own. Order is preserved.
pub fn pack_frames(frames: &[Frame], mtu: usize) -> Vec<Vec<u8>> {
    let mut datagrams = Vec::new();
    let mut current: Vec<u8> = Vec::new();

    for frame in frames {
        let need = 2 + frame.encoded_len();
        if !current.is_empty() && current.len() + need > mtu {
            datagrams.push(std::mem::take(&mut current));
        }
        let mut body = Vec::with_capacity(frame.encoded_len());
        frame.encode(&mut body);
        debug_assert!(
            body.len() <= u16::MAX as usize,
            "frame body exceeds the 16-bit length prefix"
        );
        current.extend_from_slice(&(body.len() as u16).to_le_bytes());
        current.extend_from_slice(&body);
    }
    if !current.is_empty() {
        datagrams.push(current);
    }
    datagrams
}

/// Decode all frames packed into one datagram.
pub fn unpack_frames(datagram: &[u8]) -> Result<Vec<Frame>, WireError> {
    let mut frames = Vec::new();
    let mut rest = datagram;
    while !rest.is_empty() {
        if rest.len() < 2 {
            return Err(WireError::UnexpectedEof);
        }
        let len = u16::from_le_bytes([rest[0], rest[1]]) as usize;
        rest = &rest[2..];
        if rest.len() < len {
            return Err(WireError::BadLength);
        }
        frames.push(Frame::decode(&rest[..len])?);
        rest = &rest[len..];
    }
    Ok(frames)
}

/// Cursor over a byte slice with checked little-endian reads.
pub(crate) struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.data.len() < n {
            return Err(WireError::UnexpectedEof);
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16, WireError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub(crate) fn u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn i32(&mut self) -> Result<i32, WireError> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn u64(&mut self) -> Result<u64, WireError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub(crate) fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.data)
    }
}
