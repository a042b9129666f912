//! Per-connection outbound path.
//!
//! Owns the queue of messages waiting to go on the wire: Nagle coalescing
//! for small sends, fragmentation of reliable messages at the MTU budget, a
//! sliding window bounding unacknowledged bytes, and retransmission with
//! exponential backoff. Everything is driven by explicit `Instant`s so the
//! endpoint (and tests) control time.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::core::constants::RETRANSMIT_BACKOFF;
use crate::core::TransportError;
use crate::wire::Frame;

use super::seq_before;

/// One reliable fragment awaiting acknowledgment.
#[derive(Debug, Clone)]
struct PendingFragment {
    seq: u32,
    frag_index: u16,
    frag_count: u16,
    payload: Vec<u8>,
    /// Last transmission time; `None` until first put on the wire.
    sent_at: Option<Instant>,
    retransmits: u32,
    rto: Duration,
}

impl PendingFragment {
    fn to_frame(&self, token: u64) -> Frame {
        Frame::Data {
            token,
            reliable: true,
            seq: self.seq,
            frag_index: self.frag_index,
            frag_count: self.frag_count,
            payload: self.payload.clone(),
        }
    }
}

/// Outbound queue with Nagle coalescing, fragmentation, and a sliding
/// retransmission window.
#[derive(Debug)]
pub struct OutboundQueue {
    mtu: usize,
    window: usize,
    buffer_limit: usize,
    nagle_delay: Duration,
    no_delay_limit: usize,
    initial_rto: Duration,
    min_rto: Duration,
    max_rto: Duration,
    max_retransmits: u32,

    /// Next fragment sequence number to assign.
    next_seq: u32,
    /// Reliable fragments not yet transmitted.
    unsent: VecDeque<PendingFragment>,
    /// Reliable fragments on the wire, unacknowledged, ordered by seq.
    in_flight: VecDeque<PendingFragment>,
    /// Unreliable messages awaiting the Nagle gate.
    unreliable: VecDeque<Vec<u8>>,
    /// When the oldest coalesced data was queued.
    nagle_since: Option<Instant>,
    /// A flush (explicit or NoNagle) bypasses the Nagle delay.
    flush_forced: bool,

    /// Bytes in `unsent` plus `unreliable`.
    queued_bytes: usize,
    /// Bytes in `in_flight`.
    in_flight_bytes: usize,
    /// Retransmission budget exhausted; the connection is broken.
    failed: bool,
}

impl OutboundQueue {
    /// Create an outbound queue from the endpoint configuration.
    pub fn new(cfg: &Config) -> Self {
        Self {
            mtu: cfg.mtu_payload,
            window: cfg.send_window,
            buffer_limit: cfg.send_buffer_limit,
            nagle_delay: cfg.nagle_delay,
            no_delay_limit: cfg.no_delay_queue_limit,
            initial_rto: cfg.initial_rto,
            min_rto: cfg.min_rto,
            max_rto: cfg.max_rto,
            max_retransmits: cfg.max_retransmits,
            next_seq: 0,
            unsent: VecDeque::new(),
            in_flight: VecDeque::new(),
            unreliable: VecDeque::new(),
            nagle_since: None,
            flush_forced: false,
            queued_bytes: 0,
            in_flight_bytes: 0,
            failed: false,
        }
    }

    /// Queue a reliable message, fragmenting it at the MTU budget.
    pub fn enqueue_reliable_at(
        &mut self,
        now: Instant,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        if self.queued_bytes + payload.len() > self.buffer_limit {
            return Err(TransportError::LimitExceeded);
        }

        let frag_count = payload.len().div_ceil(self.mtu).max(1) as u16;
        for (index, chunk) in payload.chunks(self.mtu).enumerate() {
            self.unsent.push_back(PendingFragment {
                seq: self.next_seq,
                frag_index: index as u16,
                frag_count,
                payload: chunk.to_vec(),
                sent_at: None,
                retransmits: 0,
                rto: self.initial_rto,
            });
            self.next_seq = self.next_seq.wrapping_add(1);
        }
        if payload.is_empty() {
            // An empty reliable message still occupies one fragment slot so
            // ordering is preserved.
            self.unsent.push_back(PendingFragment {
                seq: self.next_seq,
                frag_index: 0,
                frag_count: 1,
                payload: Vec::new(),
                sent_at: None,
                retransmits: 0,
                rto: self.initial_rto,
            });
            self.next_seq = self.next_seq.wrapping_add(1);
        }

        self.queued_bytes += payload.len();
        self.nagle_since.get_or_insert(now);
        Ok(())
    }

    /// Queue an unreliable message.
    pub fn enqueue_unreliable_at(
        &mut self,
        now: Instant,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        if self.queued_bytes + payload.len() > self.buffer_limit {
            return Err(TransportError::LimitExceeded);
        }
        self.queued_bytes += payload.len();
        self.unreliable.push_back(payload);
        self.nagle_since.get_or_insert(now);
        Ok(())
    }

    /// Whether a NoDelay send must be dropped: the connection is not fully
    /// established, or the backlog already exceeds the configured threshold.
    pub fn no_delay_would_drop(&self, connected: bool) -> bool {
        !connected || self.queued_bytes > self.no_delay_limit
    }

    /// Force the next poll to bypass the Nagle delay.
    pub fn force_flush(&mut self) {
        self.flush_forced = true;
    }

    /// Whether any data is being held by the Nagle timer.
    pub fn has_nagle_pending(&self) -> bool {
        self.nagle_since.is_some() && (!self.unsent.is_empty() || !self.unreliable.is_empty())
    }

    /// Whether the Nagle gate is open at `now`.
    fn nagle_open_at(&self, now: Instant) -> bool {
        if self.flush_forced || self.queued_bytes >= self.mtu {
            return true;
        }
        self.nagle_since
            .is_some_and(|since| now.duration_since(since) >= self.nagle_delay)
    }

    /// Emit every frame that may go on the wire at `now`.
    ///
    /// Transmits nothing until `connected`; sends queue silently before
    /// that. Handles first transmissions (window permitting), Nagle expiry,
    /// and retransmissions of overdue fragments.
    pub fn poll_transmit_at(&mut self, now: Instant, connected: bool, token: u64) -> Vec<Frame> {
        let mut frames = Vec::new();
        if !connected || self.failed {
            return frames;
        }

        // Retransmissions are never Nagle-gated.
        for frag in self.in_flight.iter_mut() {
            let Some(sent_at) = frag.sent_at else { continue };
            if now.duration_since(sent_at) < frag.rto {
                continue;
            }
            if frag.retransmits >= self.max_retransmits {
                tracing::debug!(seq = frag.seq, "retransmission budget exhausted");
                self.failed = true;
                return frames;
            }
            frag.retransmits += 1;
            frag.rto = (frag.rto * RETRANSMIT_BACKOFF)
                .max(self.min_rto)
                .min(self.max_rto);
            frag.sent_at = Some(now);
            tracing::trace!(seq = frag.seq, attempt = frag.retransmits, "retransmit");
            frames.push(frag.to_frame(token));
        }

        if self.nagle_open_at(now) {
            while let Some(payload) = self.unreliable.pop_front() {
                self.queued_bytes -= payload.len();
                frames.push(Frame::Data {
                    token,
                    reliable: false,
                    seq: 0,
                    frag_index: 0,
                    frag_count: 1,
                    payload,
                });
            }

            while let Some(front) = self.unsent.front() {
                if self.in_flight_bytes + front.payload.len() > self.window {
                    break; // window full; wait for acks
                }
                let mut frag = self.unsent.pop_front().expect("front checked");
                self.queued_bytes -= frag.payload.len();
                self.in_flight_bytes += frag.payload.len();
                frag.sent_at = Some(now);
                frames.push(frag.to_frame(token));
                self.in_flight.push_back(frag);
            }

            if self.unsent.is_empty() && self.unreliable.is_empty() {
                self.nagle_since = None;
                self.flush_forced = false;
            }
        }

        frames
    }

    /// Apply a cumulative + selective acknowledgment.
    pub fn handle_ack(&mut self, next_expected: u32, bitmap: u32) {
        let mut acked = 0usize;
        self.in_flight.retain(|frag| {
            let is_acked = seq_before(frag.seq, next_expected) || {
                let offset = frag.seq.wrapping_sub(next_expected);
                offset < 32 && bitmap & (1 << offset) != 0
            };
            if is_acked {
                acked += frag.payload.len();
            }
            !is_acked
        });
        self.in_flight_bytes -= acked;
    }

    /// Whether the retransmission budget has been exhausted.
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Whether reliable data is still awaiting transmission or
    /// acknowledgment. Drives the linger drain.
    pub fn has_pending_reliable(&self) -> bool {
        !self.unsent.is_empty() || !self.in_flight.is_empty()
    }

    /// Bytes currently queued (not yet on the wire).
    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    /// Drop everything without delivery confirmation (close without linger).
    pub fn discard_all(&mut self) {
        self.unsent.clear();
        self.in_flight.clear();
        self.unreliable.clear();
        self.queued_bytes = 0;
        self.in_flight_bytes = 0;
        self.nagle_since = None;
        self.flush_forced = false;
    }

    /// The next instant at which [`poll_transmit_at`] may have work:
    /// Nagle expiry or the earliest retransmission deadline.
    ///
    /// [`poll_transmit_at`]: OutboundQueue::poll_transmit_at
    pub fn next_deadline(&self) -> Option<Instant> {
        let nagle = if self.has_nagle_pending() {
            self.nagle_since.map(|since| since + self.nagle_delay)
        } else {
            None
        };
        let retransmit = self
            .in_flight
            .iter()
            .filter_map(|f| f.sent_at.map(|t| t + f.rto))
            .min();
        match (nagle, retransmit) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}
