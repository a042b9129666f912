//! End-to-end tests over an in-memory network: two endpoints wired together
//! through queued datagram and signaling channels, pumped explicitly.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tether_protocol::core::constants::{REASON_NO_LISTENER, REASON_ROUTE_FAILED};
use tether_protocol::prelude::*;

/// Queued in-memory network shared by both endpoints.
#[derive(Default)]
struct Router {
    /// `(from, to, relayed, payload)`
    datagrams: Mutex<VecDeque<(PeerId, PeerId, bool, Vec<u8>)>>,
    /// `(from, to, payload)`
    signals: Mutex<VecDeque<(PeerId, PeerId, Vec<u8>)>>,
}

/// One endpoint's attachment to the router; implements all three
/// collaborator traits.
struct Port {
    local: PeerId,
    router: Arc<Router>,
    direct: bool,
    relay_ticket: u64,
}

impl PacketTransport for Port {
    fn send_datagram(&self, to: PeerId, relayed: bool, payload: &[u8]) {
        self.router
            .datagrams
            .lock()
            .unwrap()
            .push_back((self.local, to, relayed, payload.to_vec()));
    }

    fn direct_reachable(&self, _peer: PeerId) -> bool {
        self.direct
    }

    fn relay_ticket(&self, _peer: PeerId) -> u64 {
        self.relay_ticket
    }
}

impl SignalingChannel for Port {
    fn send_signal(&self, to: PeerId, payload: &[u8]) {
        self.router
            .signals
            .lock()
            .unwrap()
            .push_back((self.local, to, payload.to_vec()));
    }
}

impl IdentityProvider for Port {
    fn local_identity(&self) -> PeerId {
        self.local
    }
}

struct Pair {
    a: Endpoint,
    b: Endpoint,
    a_id: PeerId,
    b_id: PeerId,
    router: Arc<Router>,
}

fn test_config() -> Config {
    Config::new()
        .nagle_delay(Duration::ZERO)
        .probe_interval(Duration::from_millis(1))
        .linger_timeout(Duration::from_millis(500))
}

impl Pair {
    fn new() -> Self {
        Self::with_paths(true, 0, true, 0)
    }

    /// Build a pair with explicit path capabilities per side.
    fn with_paths(a_direct: bool, a_ticket: u64, b_direct: bool, b_ticket: u64) -> Self {
        let router = Arc::new(Router::default());
        let a_id = PeerId::new(1);
        let b_id = PeerId::new(2);
        let make = |local: PeerId, direct: bool, relay_ticket: u64| {
            let port = Arc::new(Port {
                local,
                router: Arc::clone(&router),
                direct,
                relay_ticket,
            });
            Endpoint::new(
                test_config(),
                Arc::clone(&port) as Arc<dyn PacketTransport>,
                Arc::clone(&port) as Arc<dyn SignalingChannel>,
                port as Arc<dyn IdentityProvider>,
            )
        };
        let a = make(a_id, a_direct, a_ticket);
        let b = make(b_id, b_direct, b_ticket);
        Pair {
            a,
            b,
            a_id,
            b_id,
            router,
        }
    }

    fn endpoint_for(&self, id: PeerId) -> &Endpoint {
        if id == self.a_id {
            &self.a
        } else {
            &self.b
        }
    }

    /// Deliver everything currently queued. Returns whether anything moved.
    fn pump(&self) -> bool {
        let mut moved = false;
        loop {
            let signal = self.router.signals.lock().unwrap().pop_front();
            if let Some((from, to, payload)) = signal {
                moved = true;
                self.endpoint_for(to).handle_signal(from, &payload);
                continue;
            }
            let datagram = self.router.datagrams.lock().unwrap().pop_front();
            if let Some((from, to, relayed, payload)) = datagram {
                moved = true;
                self.endpoint_for(to).handle_datagram(from, relayed, &payload);
                continue;
            }
            break;
        }
        moved
    }

    /// Poll and pump both sides until the network goes quiet.
    fn run(&self) {
        for _ in 0..100 {
            self.a.poll();
            self.b.poll();
            if !self.pump() {
                self.a.poll();
                self.b.poll();
                if !self.pump() {
                    return;
                }
            }
        }
        panic!("network never went quiet");
    }
}

fn drain_events(endpoint: &Endpoint) -> Vec<ConnectionEvent> {
    std::iter::from_fn(|| endpoint.poll_event()).collect()
}

fn new_states(events: &[ConnectionEvent]) -> Vec<ConnectionState> {
    events.iter().map(|e| e.new_state).collect()
}

/// Dial, accept, and finish the handshake; both sides end up `Connected`.
fn establish(pair: &Pair, port: u16) -> (ConnectionHandle, ConnectionHandle) {
    pair.b.create_listen_socket(port).unwrap();
    let a_conn = pair.a.connect(pair.b_id, port).unwrap();
    pair.run();

    let pending = drain_events(&pair.b)
        .iter()
        .find(|e| e.new_state == ConnectionState::Connecting)
        .map(|e| e.connection)
        .expect("inbound connection event");
    pair.b.accept_connection(pending).unwrap();
    pair.run();

    assert_eq!(
        pair.a.connection_info(a_conn).unwrap().state,
        ConnectionState::Connected
    );
    assert_eq!(
        pair.b.connection_info(pending).unwrap().state,
        ConnectionState::Connected
    );
    drain_events(&pair.a);
    drain_events(&pair.b);
    (a_conn, pending)
}

#[test]
fn test_connect_accept_lifecycle() {
    let pair = Pair::new();
    pair.b.create_listen_socket(10).unwrap();

    let a_conn = pair.a.connect(pair.b_id, 10).unwrap();
    pair.run();

    // The dialer has progressed to Connecting; the listener reports a
    // pending inbound connection.
    let b_events = drain_events(&pair.b);
    assert_eq!(new_states(&b_events), vec![ConnectionState::Connecting]);
    let b_conn = b_events[0].connection;
    assert_eq!(b_events[0].peer, pair.a_id);
    assert_eq!(
        pair.b.connection_info(b_conn).unwrap().state,
        ConnectionState::Connecting
    );

    pair.b.accept_connection(b_conn).unwrap();
    pair.run();

    let a_events = drain_events(&pair.a);
    assert_eq!(
        new_states(&a_events),
        vec![
            ConnectionState::Connecting,
            ConnectionState::FindingRoute,
            ConnectionState::Connected,
        ]
    );
    // Events on one connection arrive in transition order.
    for window in a_events.windows(2) {
        assert_eq!(window[0].new_state, window[1].old_state);
    }

    let info = pair.a.connection_info(a_conn).unwrap();
    assert_eq!(info.peer, pair.b_id);
    assert_eq!(info.virtual_port, 10);
    assert_eq!(info.route, Some(RoutePath::Direct));
}

#[test]
fn test_accept_rejects_bad_handles() {
    let pair = Pair::new();
    pair.b.create_listen_socket(10).unwrap();
    let a_conn = pair.a.connect(pair.b_id, 10).unwrap();

    // The dialer cannot accept its own outgoing attempt.
    assert_eq!(
        pair.a.accept_connection(a_conn),
        Err(TransportError::InvalidState)
    );
    // Unknown handles are a parameter error.
    assert!(matches!(
        pair.b.accept_connection(a_conn),
        Err(TransportError::InvalidParam(_))
    ));
}

#[test]
fn test_connect_without_listener_is_rejected() {
    let pair = Pair::new();
    let a_conn = pair.a.connect(pair.b_id, 99).unwrap();
    pair.run();

    let events = drain_events(&pair.a);
    assert_eq!(
        new_states(&events),
        vec![ConnectionState::Connecting, ConnectionState::ClosedByPeer]
    );
    assert_eq!(events[1].end_reason, REASON_NO_LISTENER);
    assert_eq!(
        pair.a.send(a_conn, b"late", SendFlags::RELIABLE),
        Err(TransportError::NoConnection)
    );
}

#[test]
fn test_duplicate_listen_port_rejected() {
    let pair = Pair::new();
    pair.b.create_listen_socket(5).unwrap();
    assert!(matches!(
        pair.b.create_listen_socket(5),
        Err(TransportError::InvalidParam(_))
    ));
}

#[test]
fn test_close_listen_socket_rejects_pending() {
    let pair = Pair::new();
    let listen = pair.b.create_listen_socket(10).unwrap();
    pair.a.connect(pair.b_id, 10).unwrap();
    pair.run();
    drain_events(&pair.b);

    assert!(pair.b.close_listen_socket(listen));
    assert!(!pair.b.close_listen_socket(listen));
    pair.run();

    let events = drain_events(&pair.a);
    assert_eq!(
        new_states(&events),
        vec![ConnectionState::Connecting, ConnectionState::ClosedByPeer]
    );
}

#[test]
fn test_reliable_message_fragmented_and_reassembled() {
    let pair = Pair::new();
    let (a_conn, b_conn) = establish(&pair, 10);

    // 10 KiB spans several fragments at the default MTU budget.
    let message: Vec<u8> = (0..10 * 1024).map(|i| (i % 251) as u8).collect();
    assert_eq!(
        pair.a.send(a_conn, &message, SendFlags::RELIABLE),
        Ok(SendOutcome::Queued)
    );
    pair.run();

    let mut buf = vec![0u8; 16 * 1024];
    let len = pair.b.receive(b_conn, &mut buf).unwrap().expect("message");
    assert_eq!(&buf[..len], &message[..]);
    // Delivered exactly once.
    assert_eq!(pair.b.receive(b_conn, &mut buf), Ok(None));
}

#[test]
fn test_reliable_messages_arrive_in_order() {
    let pair = Pair::new();
    let (a_conn, b_conn) = establish(&pair, 10);

    for i in 0..5u8 {
        pair.a
            .send(a_conn, &[i; 64], SendFlags::RELIABLE)
            .unwrap();
    }
    pair.run();

    let mut buf = [0u8; 128];
    for i in 0..5u8 {
        let len = pair.b.receive(b_conn, &mut buf).unwrap().expect("message");
        assert_eq!(&buf[..len], &[i; 64]);
    }
}

#[test]
fn test_unreliable_delivery() {
    let pair = Pair::new();
    let (a_conn, b_conn) = establish(&pair, 10);

    pair.a
        .send(a_conn, b"datagram", SendFlags::UNRELIABLE)
        .unwrap();
    pair.run();

    let mut buf = [0u8; 64];
    assert_eq!(pair.b.receive(b_conn, &mut buf).unwrap(), Some(8));
    assert_eq!(&buf[..8], b"datagram");
}

#[test]
fn test_sends_queued_while_connecting_are_delivered() {
    let pair = Pair::new();
    pair.b.create_listen_socket(10).unwrap();
    let a_conn = pair.a.connect(pair.b_id, 10).unwrap();

    // Queued before the handshake even reaches the peer.
    assert_eq!(
        pair.a.send(a_conn, b"early", SendFlags::RELIABLE),
        Ok(SendOutcome::Queued)
    );

    pair.run();
    let b_conn = drain_events(&pair.b)[0].connection;
    pair.b.accept_connection(b_conn).unwrap();
    pair.run();

    let mut buf = [0u8; 64];
    assert_eq!(pair.b.receive(b_conn, &mut buf).unwrap(), Some(5));
    assert_eq!(&buf[..5], b"early");
}

#[test]
fn test_no_delay_dropped_until_connected() {
    let pair = Pair::new();
    pair.b.create_listen_socket(10).unwrap();
    let a_conn = pair.a.connect(pair.b_id, 10).unwrap();

    // Not yet fully established: NoDelay refuses to queue.
    assert_eq!(
        pair.a.send(a_conn, b"now or never", SendFlags::UNRELIABLE_NO_DELAY),
        Ok(SendOutcome::Ignored)
    );

    pair.run();
    let b_conn = drain_events(&pair.b)[0].connection;
    pair.b.accept_connection(b_conn).unwrap();
    pair.run();

    assert_eq!(
        pair.a.send(a_conn, b"now", SendFlags::UNRELIABLE_NO_DELAY),
        Ok(SendOutcome::Queued)
    );
    pair.pump();
    let mut buf = [0u8; 64];
    assert_eq!(pair.b.receive(b_conn, &mut buf).unwrap(), Some(3));
}

#[test]
fn test_reliable_no_delay_is_invalid() {
    let pair = Pair::new();
    let (a_conn, _) = establish(&pair, 10);
    let mut flags = SendFlags::RELIABLE;
    flags.no_delay = true;
    assert!(matches!(
        pair.a.send(a_conn, b"x", flags),
        Err(TransportError::InvalidParam(_))
    ));
}

#[test]
fn test_oversized_messages_rejected() {
    let pair = Pair::new();
    let (a_conn, _) = establish(&pair, 10);

    let too_big = vec![0u8; Config::default().max_message_size + 1];
    assert!(matches!(
        pair.a.send(a_conn, &too_big, SendFlags::RELIABLE),
        Err(TransportError::InvalidParam(_))
    ));
    // Unreliable messages must fit a single datagram.
    let over_mtu = vec![0u8; Config::default().mtu_payload + 1];
    assert!(matches!(
        pair.a.send(a_conn, &over_mtu, SendFlags::UNRELIABLE),
        Err(TransportError::InvalidParam(_))
    ));
}

#[test]
fn test_flush_reports_whether_anything_was_held() {
    let pair = Pair::new();
    let (a_conn, _) = establish(&pair, 10);
    // Drain whatever establish left behind.
    pair.run();

    assert_eq!(pair.a.flush(a_conn), Ok(SendOutcome::Ignored));
    pair.a.send(a_conn, b"held", SendFlags::RELIABLE).unwrap();
    assert_eq!(pair.a.flush(a_conn), Ok(SendOutcome::Queued));
}

#[test]
fn test_flush_before_established_reports_ignored() {
    let pair = Pair::new();
    pair.b.create_listen_socket(10).unwrap();
    let a_conn = pair.a.connect(pair.b_id, 10).unwrap();
    pair.a.send(a_conn, b"early", SendFlags::RELIABLE).unwrap();
    // Nothing can go on the wire before the route is up.
    assert_eq!(pair.a.flush(a_conn), Ok(SendOutcome::Ignored));
}

#[test]
fn test_use_current_thread_transmits_synchronously() {
    let pair = Pair::new();
    let (a_conn, b_conn) = establish(&pair, 10);

    // A plain send only queues; wire work happens on a later poll.
    pair.a.send(a_conn, b"queued", SendFlags::RELIABLE).unwrap();
    assert!(pair.router.datagrams.lock().unwrap().is_empty());

    // UseCurrentThread does the wire work on the calling thread.
    pair.a
        .send(a_conn, b"direct", SendFlags::RELIABLE.on_current_thread())
        .unwrap();
    assert!(!pair.router.datagrams.lock().unwrap().is_empty());

    pair.run();
    let mut buf = [0u8; 16];
    assert_eq!(pair.b.receive(b_conn, &mut buf).unwrap(), Some(6));
    assert_eq!(&buf[..6], b"queued");
    assert_eq!(pair.b.receive(b_conn, &mut buf).unwrap(), Some(6));
    assert_eq!(&buf[..6], b"direct");
}

#[test]
fn test_linger_expiry_stops_retransmission() {
    let pair = Pair::new();
    let (a_conn, _b_conn) = establish(&pair, 10);

    pair.a
        .send(a_conn, &[3u8; 4096], SendFlags::RELIABLE)
        .unwrap();
    assert!(pair.a.close_connection(a_conn, 0, true));
    assert!(pair.a.next_deadline().is_some());

    // Every datagram is lost from here on: no acks ever come back.
    pair.router.datagrams.lock().unwrap().clear();

    // Past the linger window the record is dropped: one final close goes
    // out and retransmission stops.
    pair.a.poll_at(Instant::now() + Duration::from_secs(1));
    assert!(!pair.router.datagrams.lock().unwrap().is_empty());
    pair.router.datagrams.lock().unwrap().clear();

    pair.a.poll_at(Instant::now() + Duration::from_secs(2));
    assert!(pair.router.datagrams.lock().unwrap().is_empty());
    assert_eq!(pair.a.next_deadline(), None);
}

#[test]
fn test_receive_buffer_too_small_drops_message() {
    let pair = Pair::new();
    let (a_conn, b_conn) = establish(&pair, 10);

    pair.a
        .send(a_conn, &[7u8; 100], SendFlags::RELIABLE)
        .unwrap();
    pair.run();

    let mut tiny = [0u8; 10];
    assert_eq!(
        pair.b.receive(b_conn, &mut tiny),
        Err(TransportError::BufferTooSmall { required: 100 })
    );
    // The failed retrieval consumed the message.
    assert_eq!(pair.b.receive(b_conn, &mut tiny), Ok(None));
}

#[test]
fn test_close_is_idempotent() {
    let pair = Pair::new();
    let (a_conn, b_conn) = establish(&pair, 10);

    assert!(pair.a.close_connection(a_conn, 1000, false));
    assert!(!pair.a.close_connection(a_conn, 1000, false));
    assert!(pair.a.connection_info(a_conn).is_none());
    pair.run();

    // The peer observes the close with the application reason.
    let events = drain_events(&pair.b);
    assert_eq!(new_states(&events), vec![ConnectionState::ClosedByPeer]);
    assert_eq!(events[0].end_reason, 1000);
    assert_eq!(
        pair.b.connection_info(b_conn).unwrap().state,
        ConnectionState::ClosedByPeer
    );
}

#[test]
fn test_close_without_linger_discards_queued_data() {
    let pair = Pair::new();
    let (a_conn, b_conn) = establish(&pair, 10);

    pair.a
        .send(a_conn, &[9u8; 4096], SendFlags::RELIABLE)
        .unwrap();
    // Closed before any poll put the data on the wire.
    assert!(pair.a.close_connection(a_conn, 0, false));
    pair.run();

    let mut buf = vec![0u8; 8192];
    assert_eq!(pair.b.receive(b_conn, &mut buf), Ok(None));
    assert_eq!(
        pair.b.connection_info(b_conn).unwrap().state,
        ConnectionState::ClosedByPeer
    );
}

#[test]
fn test_close_with_linger_drains_queued_data() {
    let pair = Pair::new();
    let (a_conn, b_conn) = establish(&pair, 10);

    let message: Vec<u8> = (0..8 * 1024).map(|i| (i % 127) as u8).collect();
    pair.a.send(a_conn, &message, SendFlags::RELIABLE).unwrap();
    assert!(pair.a.close_connection(a_conn, 0, true));

    // The handle is gone immediately even though draining continues.
    assert!(pair.a.connection_info(a_conn).is_none());
    pair.run();

    let mut buf = vec![0u8; 16 * 1024];
    let len = pair.b.receive(b_conn, &mut buf).unwrap().expect("drained message");
    assert_eq!(&buf[..len], &message[..]);
    // The close still arrives after the data.
    assert_eq!(
        pair.b.connection_info(b_conn).unwrap().state,
        ConnectionState::ClosedByPeer
    );
}

#[test]
fn test_symmetric_connect_merges_crossed_dials() {
    let pair = Pair::new();
    pair.a.set_symmetric_connect(true);
    pair.b.set_symmetric_connect(true);
    pair.a.create_listen_socket(10).unwrap();
    pair.b.create_listen_socket(10).unwrap();

    // Both dial before any traffic moves.
    let a_conn = pair.a.connect(pair.b_id, 10).unwrap();
    let b_conn = pair.b.connect(pair.a_id, 10).unwrap();
    pair.run();

    assert_eq!(
        pair.a.connection_info(a_conn).unwrap().state,
        ConnectionState::Connected
    );
    assert_eq!(
        pair.b.connection_info(b_conn).unwrap().state,
        ConnectionState::Connected
    );

    // Exactly one connection per side: every event references the handle
    // the dial returned.
    for (endpoint, conn) in [(&pair.a, a_conn), (&pair.b, b_conn)] {
        for event in drain_events(endpoint) {
            assert_eq!(event.connection, conn);
        }
    }

    // Traffic flows over the merged connection in both directions.
    pair.a.send(a_conn, b"ping", SendFlags::RELIABLE).unwrap();
    pair.b.send(b_conn, b"pong", SendFlags::RELIABLE).unwrap();
    pair.run();
    let mut buf = [0u8; 16];
    assert_eq!(pair.b.receive(b_conn, &mut buf).unwrap(), Some(4));
    assert_eq!(&buf[..4], b"ping");
    assert_eq!(pair.a.receive(a_conn, &mut buf).unwrap(), Some(4));
    assert_eq!(&buf[..4], b"pong");
}

#[test]
fn test_symmetric_connect_reuses_existing_dial() {
    let pair = Pair::new();
    pair.a.set_symmetric_connect(true);
    pair.b.create_listen_socket(10).unwrap();

    let first = pair.a.connect(pair.b_id, 10).unwrap();
    let second = pair.a.connect(pair.b_id, 10).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_relay_fallback_when_direct_unavailable() {
    // Neither side is directly reachable, but both advertise relay tickets.
    let pair = Pair::with_paths(false, 11, false, 22);
    let (a_conn, b_conn) = establish(&pair, 10);

    assert_eq!(
        pair.a.connection_info(a_conn).unwrap().route,
        Some(RoutePath::Relayed)
    );
    assert_eq!(
        pair.b.connection_info(b_conn).unwrap().route,
        Some(RoutePath::Relayed)
    );
}

#[test]
fn test_no_route_candidates_fails_locally() {
    // No direct path and no relay on either side: rendezvous cannot work.
    let pair = Pair::with_paths(false, 0, false, 0);
    pair.b.create_listen_socket(10).unwrap();
    pair.a.connect(pair.b_id, 10).unwrap();
    pair.run();

    let b_conn = drain_events(&pair.b)[0].connection;
    pair.b.accept_connection(b_conn).unwrap();
    pair.run();

    let a_events = drain_events(&pair.a);
    let last = a_events.last().expect("events");
    assert_eq!(last.new_state, ConnectionState::ProblemDetectedLocally);
    assert_eq!(last.end_reason, REASON_ROUTE_FAILED);
}

#[test]
fn test_connect_to_self_rejected() {
    let pair = Pair::new();
    assert!(matches!(
        pair.a.connect(pair.a_id, 1),
        Err(TransportError::InvalidParam(_))
    ));
}
