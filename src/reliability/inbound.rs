//! Per-connection inbound path.
//!
//! Reassembles reliable fragments in sequence order, suppresses duplicates,
//! and queues whole messages for non-blocking single-message retrieval.

use std::collections::{BTreeMap, VecDeque};

use crate::core::constants::MAX_REORDER_FRAGMENTS;
use crate::core::TransportError;

use super::seq_before;

/// Result of absorbing one data fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbsorbResult {
    /// Fragment accepted (message may still be incomplete).
    Accepted,
    /// Duplicate or stale fragment, silently dropped.
    Duplicate,
    /// Inbound queue full; a reliable message could not be queued. The
    /// connection must be treated as broken (backpressure failure).
    Overflow,
}

/// Buffered fragment waiting for its predecessors.
#[derive(Debug, Clone)]
struct BufferedFragment {
    frag_index: u16,
    frag_count: u16,
    payload: Vec<u8>,
}

/// Inbound queue with in-order reliable reassembly.
#[derive(Debug)]
pub struct InboundQueue {
    /// Next reliable fragment sequence expected in order.
    next_seq: u32,
    /// Fragments received ahead of `next_seq`.
    out_of_order: BTreeMap<u32, BufferedFragment>,
    /// Partial message currently being assembled from in-order fragments.
    assembling: Vec<u8>,
    assembled_frags: u16,
    /// Whole messages awaiting retrieval, FIFO.
    queue: VecDeque<Vec<u8>>,
    max_queue: usize,
    /// An ack should be generated for the peer.
    ack_needed: bool,
}

impl InboundQueue {
    /// Create an inbound queue bounded at `max_queue` messages.
    pub fn new(max_queue: usize) -> Self {
        Self {
            next_seq: 0,
            out_of_order: BTreeMap::new(),
            assembling: Vec::new(),
            assembled_frags: 0,
            queue: VecDeque::new(),
            max_queue,
            ack_needed: false,
        }
    }

    /// Absorb an unreliable message. Dropped without error when the queue is
    /// full; unreliable delivery carries no guarantee.
    pub fn absorb_unreliable(&mut self, payload: Vec<u8>) -> AbsorbResult {
        if self.queue.len() >= self.max_queue {
            tracing::debug!("inbound queue full, dropping unreliable message");
            return AbsorbResult::Duplicate;
        }
        self.queue.push_back(payload);
        AbsorbResult::Accepted
    }

    /// Absorb one reliable fragment.
    pub fn absorb_reliable(
        &mut self,
        seq: u32,
        frag_index: u16,
        frag_count: u16,
        payload: Vec<u8>,
    ) -> AbsorbResult {
        if seq_before(seq, self.next_seq) || self.out_of_order.contains_key(&seq) {
            return AbsorbResult::Duplicate;
        }
        // Fragments too far ahead cannot come from a compliant sender; refuse
        // to buffer them so the reorder map stays bounded.
        if seq.wrapping_sub(self.next_seq) >= MAX_REORDER_FRAGMENTS {
            tracing::debug!(seq, next_seq = self.next_seq, "fragment beyond reorder horizon");
            return AbsorbResult::Duplicate;
        }
        self.ack_needed = true;
        self.out_of_order.insert(
            seq,
            BufferedFragment {
                frag_index,
                frag_count,
                payload,
            },
        );
        self.drain_in_order()
    }

    /// Move contiguous fragments out of the reorder buffer, assembling
    /// whole messages into the retrieval queue.
    fn drain_in_order(&mut self) -> AbsorbResult {
        while let Some(frag) = self.out_of_order.remove(&self.next_seq) {
            self.next_seq = self.next_seq.wrapping_add(1);

            // Fragments of one message carry consecutive sequence numbers,
            // so in-order draining sees them as index 0..count-1.
            debug_assert_eq!(frag.frag_index, self.assembled_frags);
            self.assembling.extend_from_slice(&frag.payload);
            self.assembled_frags += 1;

            if self.assembled_frags == frag.frag_count {
                if self.queue.len() >= self.max_queue {
                    tracing::warn!("inbound queue full on reliable message");
                    return AbsorbResult::Overflow;
                }
                self.queue.push_back(std::mem::take(&mut self.assembling));
                self.assembled_frags = 0;
            }
        }
        AbsorbResult::Accepted
    }

    /// Produce the acknowledgment the peer needs, if any: the next expected
    /// sequence plus a selective bitmap of fragments held out of order.
    pub fn take_ack(&mut self) -> Option<(u32, u32)> {
        if !self.ack_needed {
            return None;
        }
        self.ack_needed = false;
        let mut bitmap = 0u32;
        for &seq in self.out_of_order.keys() {
            let offset = seq.wrapping_sub(self.next_seq);
            if offset < 32 {
                bitmap |= 1 << offset;
            }
        }
        Some((self.next_seq, bitmap))
    }

    /// Retrieve at most one whole message, FIFO.
    ///
    /// Returns `Ok(None)` when nothing is queued. If the next message
    /// exceeds `capacity` the call fails with `BufferTooSmall { required }`
    /// and the message is dropped from the queue all the same: the slot is
    /// released whether or not the size check passes.
    pub fn pop(&mut self, capacity: usize) -> Result<Option<Vec<u8>>, TransportError> {
        let Some(message) = self.queue.pop_front() else {
            return Ok(None);
        };
        if message.len() > capacity {
            return Err(TransportError::BufferTooSmall {
                required: message.len(),
            });
        }
        Ok(Some(message))
    }

    /// Number of whole messages awaiting retrieval.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether no messages await retrieval.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single(seq: u32, byte: u8) -> (u32, u16, u16, Vec<u8>) {
        (seq, 0, 1, vec![byte])
    }

    #[test]
    fn test_in_order_delivery() {
        let mut q = InboundQueue::new(16);
        for seq in 0..3 {
            let (s, i, c, p) = single(seq, seq as u8);
            assert_eq!(q.absorb_reliable(s, i, c, p), AbsorbResult::Accepted);
        }
        assert_eq!(q.pop(10).unwrap(), Some(vec![0]));
        assert_eq!(q.pop(10).unwrap(), Some(vec![1]));
        assert_eq!(q.pop(10).unwrap(), Some(vec![2]));
        assert_eq!(q.pop(10).unwrap(), None);
    }

    #[test]
    fn test_out_of_order_reassembly() {
        let mut q = InboundQueue::new(16);
        // Three-fragment message arriving 2, 0, 1.
        assert_eq!(q.absorb_reliable(2, 2, 3, vec![3]), AbsorbResult::Accepted);
        assert!(q.is_empty());
        assert_eq!(q.absorb_reliable(0, 0, 3, vec![1]), AbsorbResult::Accepted);
        assert!(q.is_empty());
        assert_eq!(q.absorb_reliable(1, 1, 3, vec![2]), AbsorbResult::Accepted);
        assert_eq!(q.pop(10).unwrap(), Some(vec![1, 2, 3]));
    }

    #[test]
    fn test_duplicates_dropped() {
        let mut q = InboundQueue::new(16);
        let (s, i, c, p) = single(0, 9);
        assert_eq!(q.absorb_reliable(s, i, c, p.clone()), AbsorbResult::Accepted);
        // Same seq again, both after delivery and while buffered.
        assert_eq!(q.absorb_reliable(s, i, c, p), AbsorbResult::Duplicate);
        assert_eq!(q.absorb_reliable(5, 0, 1, vec![5]), AbsorbResult::Accepted);
        assert_eq!(q.absorb_reliable(5, 0, 1, vec![5]), AbsorbResult::Duplicate);
        assert_eq!(q.len(), 1); // only seq 0 delivered; seq 5 waits for 1..=4
    }

    #[test]
    fn test_pop_too_small_consumes_message() {
        let mut q = InboundQueue::new(16);
        q.absorb_reliable(0, 0, 1, vec![0u8; 100]);
        q.absorb_reliable(1, 0, 1, vec![7]);

        assert_eq!(
            q.pop(10),
            Err(TransportError::BufferTooSmall { required: 100 })
        );
        // The oversized message is gone; the next one is retrievable.
        assert_eq!(q.pop(10).unwrap(), Some(vec![7]));
    }

    #[test]
    fn test_ack_generation() {
        let mut q = InboundQueue::new(16);
        assert_eq!(q.take_ack(), None);

        q.absorb_reliable(0, 0, 1, vec![0]);
        q.absorb_reliable(2, 0, 1, vec![2]); // gap at 1
        let (next_expected, bitmap) = q.take_ack().unwrap();
        assert_eq!(next_expected, 1);
        assert_eq!(bitmap, 0b10); // seq 2 held out of order

        // Ack consumed until new data arrives.
        assert_eq!(q.take_ack(), None);
    }

    #[test]
    fn test_unreliable_bypasses_sequencing() {
        let mut q = InboundQueue::new(16);
        q.absorb_unreliable(vec![42]);
        assert_eq!(q.pop(10).unwrap(), Some(vec![42]));
        // Unreliable data generates no ack.
        assert_eq!(q.take_ack(), None);
    }

    #[test]
    fn test_overflow_reliable() {
        let mut q = InboundQueue::new(1);
        assert_eq!(q.absorb_reliable(0, 0, 1, vec![0]), AbsorbResult::Accepted);
        assert_eq!(q.absorb_reliable(1, 0, 1, vec![1]), AbsorbResult::Overflow);
    }

    #[test]
    fn test_overflow_unreliable_drops_silently() {
        let mut q = InboundQueue::new(1);
        q.absorb_unreliable(vec![0]);
        assert_eq!(q.absorb_unreliable(vec![1]), AbsorbResult::Duplicate);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_delivery_across_sequence_wrap() {
        let mut q = InboundQueue::new(16);
        q.next_seq = u32::MAX - 1;
        assert_eq!(
            q.absorb_reliable(u32::MAX - 1, 0, 1, vec![1]),
            AbsorbResult::Accepted
        );
        assert_eq!(
            q.absorb_reliable(u32::MAX, 0, 1, vec![2]),
            AbsorbResult::Accepted
        );
        assert_eq!(q.absorb_reliable(0, 0, 1, vec![3]), AbsorbResult::Accepted);
        // Pre-wrap sequences are stale after the counter wraps.
        assert_eq!(
            q.absorb_reliable(u32::MAX, 0, 1, vec![2]),
            AbsorbResult::Duplicate
        );
        assert_eq!(q.pop(10).unwrap(), Some(vec![1]));
        assert_eq!(q.pop(10).unwrap(), Some(vec![2]));
        assert_eq!(q.pop(10).unwrap(), Some(vec![3]));
    }

    #[test]
    fn test_reorder_horizon_bounds_buffer() {
        let mut q = InboundQueue::new(16);
        // A sequence far beyond anything a compliant sender could have in
        // flight is refused instead of buffered.
        assert_eq!(
            q.absorb_reliable(MAX_REORDER_FRAGMENTS, 0, 1, vec![9]),
            AbsorbResult::Duplicate
        );
        assert!(q.out_of_order.is_empty());
        // In-range gaps still buffer and deliver.
        assert_eq!(q.absorb_reliable(1, 0, 1, vec![2]), AbsorbResult::Accepted);
        assert_eq!(q.absorb_reliable(0, 0, 1, vec![1]), AbsorbResult::Accepted);
        assert_eq!(q.pop(10).unwrap(), Some(vec![1]));
        assert_eq!(q.pop(10).unwrap(), Some(vec![2]));
    }

    #[test]
    fn test_fifo_across_kinds() {
        let mut q = InboundQueue::new(16);
        q.absorb_reliable(0, 0, 1, vec![1]);
        q.absorb_unreliable(vec![2]);
        q.absorb_reliable(1, 0, 1, vec![3]);
        assert_eq!(q.pop(10).unwrap(), Some(vec![1]));
        assert_eq!(q.pop(10).unwrap(), Some(vec![2]));
        assert_eq!(q.pop(10).unwrap(), Some(vec![3]));
    }
}
