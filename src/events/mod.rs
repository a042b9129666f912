//! Connection state-change events.
//!
//! Every state transition produces a [`ConnectionEvent`] carrying the old
//! and new states. Events are buffered in a bounded FIFO and drained by the
//! application; when the buffer overflows the oldest event is dropped, since
//! the newest event always reflects the current state.

use std::collections::VecDeque;

use crate::connection::ConnectionState;
use crate::core::PeerId;
use crate::registry::ConnectionHandle;

/// A connection changed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionEvent {
    /// The connection that changed.
    pub connection: ConnectionHandle,
    /// The remote peer of that connection.
    pub peer: PeerId,
    /// State before the transition.
    pub old_state: ConnectionState,
    /// State after the transition.
    pub new_state: ConnectionState,
    /// Application or protocol close reason; `0` when not applicable.
    pub end_reason: i32,
}

/// Bounded event buffer, drained oldest-first.
#[derive(Debug)]
pub struct EventDispatcher {
    queue: VecDeque<ConnectionEvent>,
    capacity: usize,
}

impl EventDispatcher {
    /// Create a dispatcher holding at most `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity.min(64)),
            capacity,
        }
    }

    /// Enqueue an event, dropping the oldest one on overflow.
    pub fn push(&mut self, event: ConnectionEvent) {
        if self.queue.len() >= self.capacity {
            let dropped = self.queue.pop_front();
            tracing::warn!(?dropped, "event queue full, dropping oldest event");
        }
        self.queue.push_back(event);
    }

    /// Take the oldest pending event.
    pub fn pop(&mut self) -> Option<ConnectionEvent> {
        self.queue.pop_front()
    }

    /// Number of buffered events.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// True when no events are pending.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Handle;

    fn event(n: u32) -> ConnectionEvent {
        ConnectionEvent {
            connection: ConnectionHandle::from_raw(n),
            peer: PeerId::new(42),
            old_state: ConnectionState::None,
            new_state: ConnectionState::Connecting,
            end_reason: 0,
        }
    }

    #[test]
    fn test_fifo_order() {
        let mut d = EventDispatcher::new(8);
        d.push(event(1));
        d.push(event(2));
        assert_eq!(d.pop().unwrap().connection.raw(), 1);
        assert_eq!(d.pop().unwrap().connection.raw(), 2);
        assert!(d.pop().is_none());
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let mut d = EventDispatcher::new(2);
        d.push(event(1));
        d.push(event(2));
        d.push(event(3));
        assert_eq!(d.len(), 2);
        assert_eq!(d.pop().unwrap().connection.raw(), 2);
        assert_eq!(d.pop().unwrap().connection.raw(), 3);
    }
}
