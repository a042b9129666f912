//! Endpoint configuration.

use std::time::Duration;

use crate::core::constants;

/// Tunable parameters for an [`Endpoint`](crate::endpoint::Endpoint).
///
/// Defaults come from [`crate::core::constants`]; every field can be
/// overridden with the builder-style setters.
#[derive(Debug, Clone)]
pub struct Config {
    /// Coalescing delay applied to sends without `no_nagle`.
    pub nagle_delay: Duration,

    /// Queued-byte threshold above which a NoDelay send is dropped. Together
    /// with the requirement of being fully `Connected`, this defines
    /// "cannot be sent relatively quickly".
    pub no_delay_queue_limit: usize,

    /// Best-effort drain window for `close_connection(.., linger = true)`.
    pub linger_timeout: Duration,

    /// Per-connection cap on queued outbound bytes; exceeding it fails a
    /// send with `LimitExceeded`.
    pub send_buffer_limit: usize,

    /// Per-connection bound on unacknowledged reliable bytes in flight
    /// (the sliding window).
    pub send_window: usize,

    /// Maximum size of a single message accepted by `send`.
    pub max_message_size: usize,

    /// Maximum payload bytes per datagram fragment.
    pub mtu_payload: usize,

    /// Retransmission timeout before the first sample.
    pub initial_rto: Duration,

    /// Lower bound on the retransmission timeout.
    pub min_rto: Duration,

    /// Upper bound on the retransmission timeout.
    pub max_rto: Duration,

    /// Retransmission attempts before the connection is declared broken.
    pub max_retransmits: u32,

    /// Overall deadline for route negotiation.
    pub rendezvous_timeout: Duration,

    /// Overall deadline for a connect attempt to reach `Connected`.
    pub connect_timeout: Duration,

    /// Interval between route probes.
    pub probe_interval: Duration,

    /// Direct-path probe attempts before falling back to the relay path.
    pub direct_probe_attempts: u32,

    /// Cap on queued inbound messages per connection.
    pub max_inbound_queue: usize,

    /// Cap on undelivered connection events.
    pub max_pending_events: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nagle_delay: constants::DEFAULT_NAGLE_DELAY,
            no_delay_queue_limit: constants::DEFAULT_NO_DELAY_QUEUE_LIMIT,
            linger_timeout: constants::DEFAULT_LINGER_TIMEOUT,
            send_buffer_limit: constants::DEFAULT_SEND_BUFFER_LIMIT,
            send_window: constants::DEFAULT_SEND_WINDOW,
            max_message_size: constants::DEFAULT_MAX_MESSAGE_SIZE,
            mtu_payload: constants::DEFAULT_MTU_PAYLOAD,
            initial_rto: constants::INITIAL_RTO,
            min_rto: constants::MIN_RTO,
            max_rto: constants::MAX_RTO,
            max_retransmits: constants::MAX_RETRANSMITS,
            rendezvous_timeout: constants::DEFAULT_RENDEZVOUS_TIMEOUT,
            connect_timeout: constants::DEFAULT_CONNECT_TIMEOUT,
            probe_interval: constants::DEFAULT_PROBE_INTERVAL,
            direct_probe_attempts: constants::DEFAULT_DIRECT_PROBE_ATTEMPTS,
            max_inbound_queue: constants::DEFAULT_MAX_INBOUND_QUEUE,
            max_pending_events: constants::DEFAULT_MAX_PENDING_EVENTS,
        }
    }
}

impl Config {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the Nagle coalescing delay.
    pub fn nagle_delay(mut self, delay: Duration) -> Self {
        self.nagle_delay = delay;
        self
    }

    /// Set the NoDelay queued-byte threshold.
    pub fn no_delay_queue_limit(mut self, bytes: usize) -> Self {
        self.no_delay_queue_limit = bytes;
        self
    }

    /// Set the linger drain window.
    pub fn linger_timeout(mut self, timeout: Duration) -> Self {
        self.linger_timeout = timeout;
        self
    }

    /// Set the per-connection outbound buffer limit.
    pub fn send_buffer_limit(mut self, bytes: usize) -> Self {
        self.send_buffer_limit = bytes;
        self
    }

    /// Set the unacknowledged-byte window.
    pub fn send_window(mut self, bytes: usize) -> Self {
        self.send_window = bytes;
        self
    }

    /// Set the maximum single-message size.
    pub fn max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes;
        self
    }

    /// Set the per-fragment payload budget.
    ///
    /// # Panics
    ///
    /// Panics when `bytes` exceeds [`constants::MAX_MTU_PAYLOAD`]: a frame
    /// body must fit the 16-bit length prefix used when frames are packed
    /// into a datagram.
    pub fn mtu_payload(mut self, bytes: usize) -> Self {
        assert!(
            bytes <= constants::MAX_MTU_PAYLOAD,
            "mtu_payload must fit the 16-bit frame length prefix"
        );
        self.mtu_payload = bytes;
        self
    }

    /// Set the rendezvous deadline.
    pub fn rendezvous_timeout(mut self, timeout: Duration) -> Self {
        self.rendezvous_timeout = timeout;
        self
    }

    /// Set the overall connect deadline.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the route probe interval.
    pub fn probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    /// Set the inbound queue bound.
    pub fn max_inbound_queue(mut self, messages: usize) -> Self {
        self.max_inbound_queue = messages;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.mtu_payload, 1200);
        assert_eq!(cfg.max_message_size, 512 * 1024);
        assert_eq!(cfg.max_retransmits, 10);
    }

    #[test]
    fn test_builder_overrides() {
        let cfg = Config::new()
            .nagle_delay(Duration::from_millis(1))
            .linger_timeout(Duration::from_millis(50))
            .mtu_payload(400);
        assert_eq!(cfg.nagle_delay, Duration::from_millis(1));
        assert_eq!(cfg.linger_timeout, Duration::from_millis(50));
        assert_eq!(cfg.mtu_payload, 400);
    }

    #[test]
    #[should_panic(expected = "mtu_payload")]
    fn test_mtu_payload_rejects_oversized_bodies() {
        let _ = Config::new().mtu_payload(constants::MAX_MTU_PAYLOAD + 1);
    }
}
